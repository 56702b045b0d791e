//! Orchestrator configuration.
//!
//! Loaded from a TOML file and merged under CLI flags; every field has a
//! default so a bare `chood run` works in a conventional repository.
//! Precedence: CLI flags > `--config` file > defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },
}

/// A named repo-wide gate command, run once per unit after its tasks finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineCheck {
    pub name: String,
    pub command: String,
}

/// Per-provider overrides from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    /// Command path overriding the PATH-resolved default.
    pub command: Option<String>,
}

/// Agent provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider type selected by the config file (fourth in the precedence
    /// chain, above the built-in default).
    #[serde(rename = "type")]
    pub provider_type: Option<String>,
    pub providers: BTreeMap<String, ProviderOverride>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum concurrent unit workers.
    pub parallelism: u32,
    /// Branch unit branches are created from.
    pub target_branch: String,
    /// Tasks directory, relative to the repository root.
    pub tasks_dir: PathBuf,
    /// Directory worktrees are created under.
    pub worktree_base: PathBuf,
    /// Prefix for generated unit branches.
    pub branch_prefix: String,
    /// Skip push and PR creation.
    pub no_pr: bool,
    pub skip_review: bool,
    /// Run only the named unit.
    pub single_unit: Option<String>,
    /// Discover and validate, but execute nothing.
    pub dry_run: bool,
    pub shutdown_timeout_sec: u64,
    /// Built-in provider used when nothing else in the chain resolves.
    pub default_provider: String,
    /// Provider forced for every unit, overriding the whole chain.
    pub force_task_provider: Option<String>,
    pub provider_config: ProviderConfig,
    /// Model override passed through to the agent CLI.
    pub model: Option<String>,
    /// Frame per-line JSON from agent stdout onto the event bus.
    pub stream_agent_events: bool,
    pub max_claude_retries: u32,
    pub max_baseline_retries: u32,
    pub backpressure_timeout_sec: u64,
    pub baseline_timeout_sec: u64,
    pub baseline_checks: Vec<BaselineCheck>,
    /// Delete the unit's local branch when the worktree is removed.
    pub delete_branch_on_cleanup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: 3,
            target_branch: "main".to_string(),
            tasks_dir: PathBuf::from("tasks"),
            worktree_base: PathBuf::from("../choo-worktrees"),
            branch_prefix: "choo".to_string(),
            no_pr: false,
            skip_review: false,
            single_unit: None,
            dry_run: false,
            shutdown_timeout_sec: 30,
            default_provider: "claude".to_string(),
            force_task_provider: None,
            provider_config: ProviderConfig::default(),
            model: None,
            stream_agent_events: false,
            max_claude_retries: 3,
            max_baseline_retries: 3,
            backpressure_timeout_sec: 600,
            baseline_timeout_sec: 1800,
            baseline_checks: Vec::new(),
            delete_branch_on_cleanup: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid {
                field: "parallelism".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        if self.target_branch.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "target_branch".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        for check in &self.baseline_checks {
            if check.name.trim().is_empty() || check.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "baseline_checks".to_string(),
                    message: "name and command must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the provider name for a unit from the precedence chain:
    /// `force_task_provider` > unit front-matter > CLI `--provider` >
    /// config-file type > built-in default.
    pub fn resolve_provider(
        &self,
        unit_provider: Option<&str>,
        cli_provider: Option<&str>,
    ) -> String {
        self.force_task_provider
            .as_deref()
            .or(unit_provider)
            .or(cli_provider)
            .or(self.provider_config.provider_type.as_deref())
            .unwrap_or(&self.default_provider)
            .to_string()
    }

    /// Command override for a provider, if configured.
    pub fn provider_command(&self, provider: &str) -> Option<&str> {
        self.provider_config
            .providers
            .get(provider)
            .and_then(|p| p.command.as_deref())
    }
}
