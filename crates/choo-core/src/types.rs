//! Core types for the orchestrator.
//!
//! Runs, unit records, task metadata, and the persisted event record, plus
//! the status enumerations they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Run lifecycle status.
///
/// Transitions are monotonic: `pending -> running -> {completed, failed,
/// cancelled}`. Entering `running` stamps `started_at`; entering any terminal
/// status stamps `completed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// A run in a terminal status never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active runs block a new run for the same `(feature_branch, repo_path)`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Unit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Ready,
    InProgress,
    PrOpen,
    InReview,
    Merging,
    Complete,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::PrOpen => "pr_open",
            Self::InReview => "in_review",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "in_progress" => Some(Self::InProgress),
            "pr_open" => Some(Self::PrOpen),
            "in_review" => Some(Self::InReview),
            "merging" => Some(Self::Merging),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Task status carried in task-file front-matter.
///
/// The markdown file on disk is the source of truth: the agent mutates it and
/// the worker re-reads it after every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// A top-level orchestration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Feature branch this run builds toward.
    pub feature_branch: String,
    /// Absolute path to the repository.
    pub repo_path: String,
    /// Branch unit branches are created from.
    pub target_branch: String,
    /// Path to the tasks directory, relative to `repo_path`.
    pub tasks_dir: String,
    pub parallelism: u32,
    pub status: RunStatus,
    pub daemon_version: String,
    /// Opaque serialized configuration for resume.
    pub config_json: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable per-unit state, keyed by `(run_id, unit_id)`.
///
/// Mutated exclusively through the worker that owns the unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    pub run_id: RunId,
    pub unit_id: String,
    pub status: UnitStatus,
    /// Branch assigned when the worktree is created.
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl UnitRecord {
    pub fn new(run_id: RunId, unit_id: impl Into<String>) -> Self {
        Self {
            run_id,
            unit_id: unit_id.into(),
            status: UnitStatus::Pending,
            branch: None,
            worktree_path: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A persisted event in a run's append-only log.
///
/// `(run_id, sequence)` is unique; within a run, sequence numbers are strictly
/// increasing and gap-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: RunId,
    pub sequence: i64,
    /// Dotted event type name (e.g. `unit.started`, `task.completed`).
    pub event_type: String,
    pub unit_id: Option<String>,
    pub payload_json: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Task metadata parsed from a task file's front-matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Task number, unique within the unit (>= 1).
    pub task: u32,
    #[serde(default)]
    pub status: TaskStatus,
    /// Shell command that must exit 0 before the task counts as done.
    pub backpressure: String,
    /// Task numbers in the same unit that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<u32>,
}

/// Unit metadata parsed from `IMPLEMENTATION_PLAN.md` front-matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMeta {
    pub unit: String,
    /// Unit ids that must complete before this unit may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Agent provider override for this unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Orchestrator-managed; written back after branch assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_generates_unique_values() {
        let id1 = RunId::new();
        let id2 = RunId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::from_str("bogus"), None);
    }

    #[test]
    fn run_status_classification() {
        assert!(RunStatus::Pending.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Completed.is_active());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn unit_status_round_trips() {
        for status in [
            UnitStatus::Pending,
            UnitStatus::Ready,
            UnitStatus::InProgress,
            UnitStatus::PrOpen,
            UnitStatus::InReview,
            UnitStatus::Merging,
            UnitStatus::Complete,
            UnitStatus::Failed,
            UnitStatus::Blocked,
        ] {
            assert_eq!(UnitStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn task_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(TaskStatus::default(), TaskStatus::Pending);
    }

    #[test]
    fn unit_meta_optional_fields_omitted() {
        let meta = UnitMeta {
            unit: "storage".to_string(),
            depends_on: Vec::new(),
            provider: None,
            branch: None,
            worktree: None,
            pr: None,
        };
        let yaml = serde_yaml::to_string(&meta).unwrap();
        assert!(yaml.contains("unit: storage"));
        assert!(!yaml.contains("provider"));
        assert!(!yaml.contains("depends_on"));
    }
}
