//! Markdown metadata parsing for task and unit-plan files.
//!
//! Metadata is accepted in two forms:
//! - YAML front-matter delimited by `---` lines starting at byte 0 (canonical)
//! - a fenced YAML block inside a `## Metadata` section (legacy)
//!
//! When both are present the front-matter wins and the fenced block is
//! reported as a warning. Normalize rewrites legacy files to the canonical
//! form without losing any body content.

use crate::types::{TaskMeta, UnitMeta};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("no metadata found (expected front-matter or a `## Metadata` fenced block)")]
    MissingMetadata,
    #[error("unterminated front-matter block")]
    UnterminatedFrontmatter,
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
}

pub type Result<T> = std::result::Result<T, FrontmatterError>;

fn validation(field: &str, message: impl Into<String>) -> FrontmatterError {
    FrontmatterError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Where a document's metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSource {
    Frontmatter,
    LegacyFenced,
}

/// Raw metadata extracted from a markdown document.
#[derive(Debug, Clone)]
pub struct Extracted {
    /// The YAML text, without delimiters.
    pub yaml: String,
    pub source: MetadataSource,
    /// Non-fatal findings, e.g. a legacy block shadowed by front-matter.
    pub warnings: Vec<String>,
}

/// Extract the front-matter YAML, if the document starts with `---`.
///
/// Returns the YAML text and the byte offset where the body begins.
fn extract_frontmatter(content: &str) -> Result<Option<(String, usize)>> {
    let Some(rest) = content.strip_prefix("---\n") else {
        return Ok(None);
    };
    // Closing delimiter is a `---` line; accept a trailing EOF without newline.
    let mut offset = 4;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches('\n') == "---" {
            let yaml = &content[4..offset];
            return Ok(Some((yaml.to_string(), offset + line.len())));
        }
        offset += line.len();
    }
    Err(FrontmatterError::UnterminatedFrontmatter)
}

/// Extract a fenced YAML block from a `## Metadata` section.
///
/// Returns the YAML text and the byte range of the fence (for normalize).
fn extract_legacy(content: &str) -> Option<(String, std::ops::Range<usize>)> {
    let mut in_metadata = false;
    let mut fence_start: Option<usize> = None;
    let mut yaml = String::new();
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.starts_with("## ") {
            in_metadata = trimmed[3..].trim().eq_ignore_ascii_case("metadata");
        } else if in_metadata {
            if fence_start.is_none() {
                if trimmed == "```yaml" || trimmed == "```yml" || trimmed == "```" {
                    fence_start = Some(offset);
                }
            } else if trimmed == "```" {
                return Some((yaml, fence_start.unwrap_or(0)..offset + line.len()));
            } else {
                yaml.push_str(line);
            }
        }
        offset += line.len();
    }
    None
}

/// Extract metadata from a document, preferring front-matter.
pub fn extract(content: &str) -> Result<Extracted> {
    let frontmatter = extract_frontmatter(content)?;
    let legacy = extract_legacy(content);

    match (frontmatter, legacy) {
        (Some((yaml, _)), legacy) => {
            let mut warnings = Vec::new();
            if legacy.is_some() {
                warnings.push(
                    "legacy `## Metadata` block shadowed by front-matter".to_string(),
                );
            }
            Ok(Extracted {
                yaml,
                source: MetadataSource::Frontmatter,
                warnings,
            })
        }
        (None, Some((yaml, _))) => Ok(Extracted {
            yaml,
            source: MetadataSource::LegacyFenced,
            warnings: Vec::new(),
        }),
        (None, None) => Err(FrontmatterError::MissingMetadata),
    }
}

/// Parse and validate task metadata from a task file.
pub fn parse_task(content: &str) -> Result<(TaskMeta, Vec<String>)> {
    let extracted = extract(content)?;
    let meta: TaskMeta = serde_yaml::from_str(&extracted.yaml)?;
    validate_task(&meta)?;
    Ok((meta, extracted.warnings))
}

/// Parse and validate unit metadata from an `IMPLEMENTATION_PLAN.md`.
pub fn parse_unit(content: &str) -> Result<(UnitMeta, Vec<String>)> {
    let extracted = extract(content)?;
    let meta: UnitMeta = serde_yaml::from_str(&extracted.yaml)?;
    validate_unit(&meta)?;
    Ok((meta, extracted.warnings))
}

pub fn validate_task(meta: &TaskMeta) -> Result<()> {
    if meta.task < 1 {
        return Err(validation("task", "task number must be >= 1"));
    }
    if meta.backpressure.trim().is_empty() {
        return Err(validation("backpressure", "backpressure command must not be empty"));
    }
    if meta.depends_on.iter().any(|d| *d == meta.task) {
        return Err(validation("depends_on", "task cannot depend on itself"));
    }
    Ok(())
}

pub fn validate_unit(meta: &UnitMeta) -> Result<()> {
    if meta.unit.trim().is_empty() {
        return Err(validation("unit", "unit id must not be empty"));
    }
    if meta.depends_on.iter().any(|d| *d == meta.unit) {
        return Err(validation("depends_on", "unit cannot depend on itself"));
    }
    Ok(())
}

/// Rewrite a legacy document to canonical front-matter form.
///
/// Returns `None` when the document already carries front-matter or has no
/// metadata at all. The fenced YAML moves to the top verbatim; the rest of
/// the body (including the `## Metadata` heading) is preserved, so running
/// normalize a second time is a no-op.
pub fn normalize(content: &str) -> Result<Option<String>> {
    if extract_frontmatter(content)?.is_some() {
        return Ok(None);
    }
    let Some((yaml, fence_range)) = extract_legacy(content) else {
        return Ok(None);
    };

    let mut rewritten = String::with_capacity(content.len() + yaml.len() + 8);
    rewritten.push_str("---\n");
    rewritten.push_str(&yaml);
    if !yaml.ends_with('\n') {
        rewritten.push('\n');
    }
    rewritten.push_str("---\n");
    rewritten.push_str(&content[..fence_range.start]);
    rewritten.push_str(&content[fence_range.end..]);
    Ok(Some(rewritten))
}

/// First `# ` heading of a document, used as the task title.
pub fn title(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let trimmed = line.trim_start();
        trimmed
            .strip_prefix("# ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
    })
}

/// Serialize metadata back into a canonical front-matter document.
pub fn render<T: serde::Serialize>(meta: &T, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(meta)?;
    let mut out = String::with_capacity(yaml.len() + body.len() + 8);
    out.push_str("---\n");
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(body);
    Ok(out)
}

/// Body of a document with its front-matter stripped.
pub fn body(content: &str) -> Result<&str> {
    match extract_frontmatter(content)? {
        Some((_, body_start)) => Ok(&content[body_start..]),
        None => Ok(content),
    }
}
