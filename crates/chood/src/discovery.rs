//! Discovery: parse the tasks directory into units, tasks, and the
//! dependency graph.
//!
//! A unit is a subdirectory carrying an `IMPLEMENTATION_PLAN.md`; its tasks
//! are `NN-*.md` files (two-digit prefix). Files with other names are
//! silently skipped. Metadata violations are collected as file-level errors
//! rather than aborting the walk; graph-level violations (cycles, missing
//! referents) are hard failures at build time.

use crate::agent::AgentCommand;
use choo_core::frontmatter::{self, FrontmatterError};
use choo_core::graph::{DepGraph, GraphError};
use choo_core::types::{TaskMeta, TaskStatus, UnitMeta};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("tasks directory not found: {0}")]
    TasksDirMissing(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("discovery found {0} invalid file(s)")]
    InvalidFiles(usize),
    #[error("agent repair failed for {path}: {message}")]
    RepairFailed { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// A task parsed from disk. `path` is relative to the repository root so it
/// can be re-rooted into a worktree.
#[derive(Debug, Clone)]
pub struct DiscoveredTask {
    pub meta: TaskMeta,
    pub path: PathBuf,
    pub title: String,
}

impl DiscoveredTask {
    pub fn num(&self) -> u32 {
        self.meta.task
    }

    pub fn status(&self) -> TaskStatus {
        self.meta.status
    }
}

/// A unit parsed from disk, tasks sorted by number.
#[derive(Debug, Clone)]
pub struct DiscoveredUnit {
    pub meta: UnitMeta,
    /// Unit directory, relative to the repository root.
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub tasks: Vec<DiscoveredTask>,
}

impl DiscoveredUnit {
    pub fn id(&self) -> &str {
        &self.meta.unit
    }
}

/// A file-level problem found during the walk.
#[derive(Debug, Clone)]
pub struct FileError {
    pub path: PathBuf,
    pub message: String,
}

/// Everything discovery produced.
#[derive(Debug)]
pub struct Discovery {
    pub units: Vec<DiscoveredUnit>,
    pub errors: Vec<FileError>,
    pub warnings: Vec<FileError>,
}

impl Discovery {
    /// Build the validated unit dependency graph; cycles, self-loops, and
    /// missing referents fail here.
    pub fn build_graph(&self) -> Result<DepGraph> {
        Ok(DepGraph::build(self.units.iter().map(|u| {
            (u.meta.unit.clone(), u.meta.depends_on.clone())
        }))?)
    }

    pub fn unit(&self, unit_id: &str) -> Option<&DiscoveredUnit> {
        self.units.iter().find(|u| u.meta.unit == unit_id)
    }
}

/// True for `NN-*.md` (two ASCII digits, a dash, any name).
fn is_task_file_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".md") else {
        return false;
    };
    let bytes = stem.as_bytes();
    bytes.len() > 3
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[2] == b'-'
}

/// Walk `tasks_dir` (relative to `repo_root`) and parse every unit.
pub fn discover(repo_root: &Path, tasks_dir: &Path) -> Result<Discovery> {
    let absolute = repo_root.join(tasks_dir);
    if !absolute.is_dir() {
        return Err(DiscoveryError::TasksDirMissing(absolute));
    }

    let mut units = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&absolute)
        .map_err(|source| DiscoveryError::Io {
            path: absolute.clone(),
            source,
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();

    for unit_dir in entries {
        let plan_abs = unit_dir.join("IMPLEMENTATION_PLAN.md");
        if !plan_abs.is_file() {
            debug!(dir = %unit_dir.display(), "skipping directory without IMPLEMENTATION_PLAN.md");
            continue;
        }
        let rel_dir = unit_dir.strip_prefix(repo_root).unwrap_or(&unit_dir).to_path_buf();

        match parse_unit_dir(repo_root, &rel_dir, &mut warnings) {
            Ok(unit) => units.push(unit),
            Err(file_error) => errors.push(file_error),
        }
    }

    info!(
        units = units.len(),
        errors = errors.len(),
        "discovery complete"
    );
    Ok(Discovery {
        units,
        errors,
        warnings,
    })
}

fn parse_unit_dir(
    repo_root: &Path,
    rel_dir: &Path,
    warnings: &mut Vec<FileError>,
) -> std::result::Result<DiscoveredUnit, FileError> {
    let plan_rel = rel_dir.join("IMPLEMENTATION_PLAN.md");
    let plan_abs = repo_root.join(&plan_rel);

    let plan_content = std::fs::read_to_string(&plan_abs).map_err(|e| FileError {
        path: plan_rel.clone(),
        message: e.to_string(),
    })?;
    let (unit_meta, plan_warnings) =
        frontmatter::parse_unit(&plan_content).map_err(|e| FileError {
            path: plan_rel.clone(),
            message: e.to_string(),
        })?;
    for warning in plan_warnings {
        warnings.push(FileError {
            path: plan_rel.clone(),
            message: warning,
        });
    }

    let mut tasks = Vec::new();
    let mut file_names: Vec<String> = std::fs::read_dir(repo_root.join(rel_dir))
        .map_err(|e| FileError {
            path: rel_dir.to_path_buf(),
            message: e.to_string(),
        })?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| is_task_file_name(name))
        .collect();
    file_names.sort();

    for name in file_names {
        let task_rel = rel_dir.join(&name);
        let content = std::fs::read_to_string(repo_root.join(&task_rel)).map_err(|e| FileError {
            path: task_rel.clone(),
            message: e.to_string(),
        })?;
        let (meta, task_warnings) = frontmatter::parse_task(&content).map_err(|e| FileError {
            path: task_rel.clone(),
            message: e.to_string(),
        })?;
        for warning in task_warnings {
            warnings.push(FileError {
                path: task_rel.clone(),
                message: warning,
            });
        }
        let title = frontmatter::title(&content)
            .map(str::to_string)
            .unwrap_or_else(|| name.trim_end_matches(".md").to_string());
        tasks.push(DiscoveredTask {
            meta,
            path: task_rel,
            title,
        });
    }

    tasks.sort_by_key(DiscoveredTask::num);
    validate_task_graph(rel_dir, &tasks)?;

    Ok(DiscoveredUnit {
        meta: unit_meta,
        dir: rel_dir.to_path_buf(),
        plan_path: plan_rel,
        tasks,
    })
}

/// Duplicate numbers, unknown referents, and cycles among a unit's tasks are
/// file-level errors attributed to the unit directory.
fn validate_task_graph(
    rel_dir: &Path,
    tasks: &[DiscoveredTask],
) -> std::result::Result<(), FileError> {
    let mut seen = std::collections::BTreeSet::new();
    for task in tasks {
        if !seen.insert(task.num()) {
            return Err(FileError {
                path: rel_dir.to_path_buf(),
                message: format!("duplicate task number {}", task.num()),
            });
        }
    }

    DepGraph::build(tasks.iter().map(|t| {
        (
            t.num().to_string(),
            t.meta.depends_on.iter().map(u32::to_string).collect::<Vec<_>>(),
        )
    }))
    .map(|_| ())
    .map_err(|e| FileError {
        path: rel_dir.to_path_buf(),
        message: e.to_string(),
    })
}

/// Rewrite every legacy-metadata file under `tasks_dir` to canonical
/// front-matter. Returns the rewritten paths. Lossless and idempotent.
pub fn normalize(repo_root: &Path, tasks_dir: &Path) -> Result<Vec<PathBuf>> {
    let absolute = repo_root.join(tasks_dir);
    if !absolute.is_dir() {
        return Err(DiscoveryError::TasksDirMissing(absolute));
    }

    let mut rewritten = Vec::new();
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(&absolute)
        .map_err(|source| DiscoveryError::Io {
            path: absolute.clone(),
            source,
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|source| DiscoveryError::Io {
                path: dir.clone(),
                source,
            })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n == "IMPLEMENTATION_PLAN.md" || is_task_file_name(n))
            })
            .collect();
        files.sort();

        for path in files {
            let content = std::fs::read_to_string(&path).map_err(|source| DiscoveryError::Io {
                path: path.clone(),
                source,
            })?;
            match frontmatter::normalize(&content) {
                Ok(Some(canonical)) => {
                    std::fs::write(&path, canonical).map_err(|source| DiscoveryError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    info!(path = %path.display(), "normalized legacy metadata");
                    rewritten.push(path);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unnormalizable file"),
            }
        }
    }
    Ok(rewritten)
}

/// Delegate metadata reconstruction for a broken task file to the agent.
///
/// The agent is asked for a JSON object with the required fields; the reply
/// is validated and the file rewritten with canonical front-matter.
pub async fn repair_task_file(
    agent: &AgentCommand,
    cancel: &CancellationToken,
    repo_root: &Path,
    task_path: &Path,
) -> Result<TaskMeta> {
    let absolute = repo_root.join(task_path);
    let content = std::fs::read_to_string(&absolute).map_err(|source| DiscoveryError::Io {
        path: task_path.to_path_buf(),
        source,
    })?;

    let prompt = format!(
        "The following markdown task file has missing or invalid metadata.\n\
         Reply with ONLY a JSON object of the form\n\
         {{\"task\": <int >= 1>, \"status\": \"pending|in_progress|complete|failed\", \
         \"backpressure\": \"<shell command>\", \"depends_on\": [<ints>]}}\n\
         reconstructed from the document:\n\n{content}"
    );

    let output = agent
        .invoke_capture(cancel, &prompt, repo_root)
        .await
        .map_err(|e| DiscoveryError::RepairFailed {
            path: task_path.to_path_buf(),
            message: e.to_string(),
        })?;

    let meta = parse_repair_response(&output).ok_or_else(|| DiscoveryError::RepairFailed {
        path: task_path.to_path_buf(),
        message: "no valid JSON metadata in agent response".to_string(),
    })?;
    frontmatter::validate_task(&meta).map_err(|e| DiscoveryError::RepairFailed {
        path: task_path.to_path_buf(),
        message: e.to_string(),
    })?;

    let body = body_without_metadata(&content);
    let rewritten =
        frontmatter::render(&meta, body).map_err(|e| DiscoveryError::RepairFailed {
            path: task_path.to_path_buf(),
            message: e.to_string(),
        })?;
    std::fs::write(&absolute, rewritten).map_err(|source| DiscoveryError::Io {
        path: task_path.to_path_buf(),
        source,
    })?;

    Ok(meta)
}

/// Parse the agent's repair reply: the whole output, or the outermost JSON
/// object embedded in surrounding prose.
fn parse_repair_response(output: &str) -> Option<TaskMeta> {
    let trimmed = output.trim();
    if let Ok(meta) = serde_json::from_str::<TaskMeta>(trimmed) {
        return Some(meta);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Document body with any front-matter stripped; used when rewriting.
fn body_without_metadata(content: &str) -> &str {
    frontmatter::body(content).unwrap_or(content)
}
