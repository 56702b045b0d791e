//! Live run state maintained by the web process.
//!
//! Fed exclusively by events arriving over the orchestrator socket; absence
//! of a connected run renders as waiting/pending, never as success. Reads
//! (snapshot handlers) take the read side of the lock; the single socket
//! reader is the only writer.

use chrono::{DateTime, Utc};
use choo_core::events::{GraphPayload, WireEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Top-level orchestrator status as shown to browsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

/// Per-unit live state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl UnitState {
    fn pending() -> Self {
        Self {
            status: "pending".to_string(),
            current_task: None,
            total_tasks: None,
            error: None,
            started_at: None,
        }
    }
}

/// The daemon's in-memory view of the connected orchestrator.
#[derive(Debug)]
pub struct LiveState {
    pub connected: bool,
    pub status: OrchStatus,
    pub parallelism: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub graph: GraphPayload,
    pub units: BTreeMap<String, UnitState>,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            connected: false,
            status: OrchStatus::Waiting,
            parallelism: None,
            started_at: None,
            graph: GraphPayload::default(),
            units: BTreeMap::new(),
        }
    }
}

pub type SharedState = Arc<RwLock<LiveState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(LiveState::default()))
}

impl LiveState {
    /// Fold one wire event into the state. Unknown types are ignored here
    /// (they still fan out to SSE).
    pub fn apply(&mut self, event: &WireEvent) {
        match event.event_type.as_str() {
            "orch.started" => {
                self.status = OrchStatus::Running;
                self.started_at = Some(event.time);
                if let Some(payload) = &event.payload {
                    self.parallelism = payload["parallelism"].as_u64().map(|p| p as u32);
                    if let Ok(graph) =
                        serde_json::from_value::<GraphPayload>(payload["graph"].clone())
                    {
                        self.units = graph
                            .nodes
                            .iter()
                            .map(|n| (n.id.clone(), UnitState::pending()))
                            .collect();
                        self.graph = graph;
                    }
                }
            }
            "orch.completed" => self.status = OrchStatus::Completed,
            "orch.failed" => self.status = OrchStatus::Failed,
            "unit.queued" => self.set_unit_status(event, "ready"),
            "unit.started" => {
                let time = event.time;
                let total = event
                    .payload
                    .as_ref()
                    .and_then(|p| p["total_tasks"].as_u64())
                    .map(|t| t as u32);
                let unit = self.unit_mut(event);
                unit.status = "in_progress".to_string();
                unit.started_at = Some(time);
                if total.is_some() {
                    unit.total_tasks = total;
                }
            }
            "unit.completed" => self.set_unit_status(event, "complete"),
            "unit.failed" => {
                let error = event.error.clone();
                let unit = self.unit_mut(event);
                unit.status = "failed".to_string();
                unit.error = error;
            }
            "unit.blocked" => self.set_unit_status(event, "blocked"),
            "task.started" | "task.completed" => {
                let task = event.task;
                let unit = self.unit_mut(event);
                if task.is_some() {
                    unit.current_task = task;
                }
            }
            _ => {}
        }
    }

    fn unit_mut(&mut self, event: &WireEvent) -> &mut UnitState {
        let unit_id = event.unit.clone().unwrap_or_default();
        self.units.entry(unit_id).or_insert_with(UnitState::pending)
    }

    fn set_unit_status(&mut self, event: &WireEvent, status: &str) {
        self.unit_mut(event).status = status.to_string();
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            total: self.units.len(),
            ..Summary::default()
        };
        for unit in self.units.values() {
            match unit.status.as_str() {
                "pending" | "ready" => summary.pending += 1,
                "in_progress" | "pr_open" | "in_review" | "merging" => summary.in_progress += 1,
                "complete" => summary.complete += 1,
                "failed" => summary.failed += 1,
                "blocked" => summary.blocked += 1,
                _ => {}
            }
        }
        summary
    }
}

/// Per-status tally for `GET /api/state`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// A unit entry in the snapshot response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitEntry {
    pub id: String,
    #[serde(flatten)]
    pub state: UnitState,
}

/// Response body for `GET /api/state`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub connected: bool,
    pub status: OrchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    pub units: Vec<UnitEntry>,
    pub summary: Summary,
}

impl StateResponse {
    pub fn snapshot(state: &LiveState) -> Self {
        Self {
            connected: state.connected,
            status: state.status,
            started_at: state.started_at,
            parallelism: state.parallelism,
            units: state
                .units
                .iter()
                .map(|(id, unit)| UnitEntry {
                    id: id.clone(),
                    state: unit.clone(),
                })
                .collect(),
            summary: state.summary(),
        }
    }
}
