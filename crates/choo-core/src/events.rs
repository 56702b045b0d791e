//! Event types for the run log and the daemon wire protocol.
//!
//! Two layers share these names: the persisted, sequence-numbered log
//! (`EventRecord` in [`crate::types`]) and the newline-delimited JSON wire
//! format relayed to the web process.

use crate::types::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "orch.started")]
    OrchStarted,
    #[serde(rename = "orch.completed")]
    OrchCompleted,
    #[serde(rename = "orch.failed")]
    OrchFailed,
    #[serde(rename = "unit.queued")]
    UnitQueued,
    #[serde(rename = "unit.started")]
    UnitStarted,
    #[serde(rename = "unit.completed")]
    UnitCompleted,
    #[serde(rename = "unit.failed")]
    UnitFailed,
    #[serde(rename = "unit.blocked")]
    UnitBlocked,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.claude.invoke")]
    TaskAgentInvoke,
    #[serde(rename = "task.claude.done")]
    TaskAgentDone,
    #[serde(rename = "branch.pushed")]
    BranchPushed,
    #[serde(rename = "pr.created")]
    PrCreated,
    #[serde(rename = "baseline.started")]
    BaselineStarted,
    #[serde(rename = "baseline.failed")]
    BaselineFailed,
    #[serde(rename = "agent.stream")]
    AgentStream,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrchStarted => "orch.started",
            Self::OrchCompleted => "orch.completed",
            Self::OrchFailed => "orch.failed",
            Self::UnitQueued => "unit.queued",
            Self::UnitStarted => "unit.started",
            Self::UnitCompleted => "unit.completed",
            Self::UnitFailed => "unit.failed",
            Self::UnitBlocked => "unit.blocked",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskAgentInvoke => "task.claude.invoke",
            Self::TaskAgentDone => "task.claude.done",
            Self::BranchPushed => "branch.pushed",
            Self::PrCreated => "pr.created",
            Self::BaselineStarted => "baseline.started",
            Self::BaselineFailed => "baseline.failed",
            Self::AgentStream => "agent.stream",
        }
    }
}

/// Node in the serialized dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// Longest path from a source node.
    pub level: usize,
}

/// Edge `from -> to` meaning `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

/// Wire form of the dependency graph, shared by the `orch.started` payload
/// and `GET /api/graph`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPayload {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Unit ids grouped by level, ascending.
    pub levels: Vec<Vec<String>>,
}

/// Payload for `orch.started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchStartedPayload {
    pub run_id: RunId,
    pub unit_count: usize,
    pub parallelism: u32,
    pub graph: GraphPayload,
}

/// Payload for `orch.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchFailedPayload {
    pub run_id: RunId,
    pub error: String,
}

/// Payload for `unit.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailedPayload {
    pub unit: String,
    pub error: String,
}

/// Payload for task lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub unit: String,
    pub task: u32,
}

/// Payload for `branch.pushed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchPushedPayload {
    pub unit: String,
    pub branch: String,
}

/// Payload for `pr.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrCreatedPayload {
    pub unit: String,
    pub url: String,
    pub pr: u64,
}

/// Payload for `baseline.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineFailedPayload {
    pub unit: String,
    pub attempt: u32,
    pub output: String,
}

/// A single event on the orchestrator -> daemon socket, one JSON object per
/// line. Unknown `type` values are forwarded to SSE subscribers verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            time: Utc::now(),
            unit: None,
            task: None,
            pr: None,
            payload: None,
            error: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_task(mut self, task: u32) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_pr(mut self, pr: u64) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_dotted_names() {
        assert_eq!(
            serde_json::to_string(&EventType::UnitStarted).unwrap(),
            "\"unit.started\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::TaskAgentInvoke).unwrap(),
            "\"task.claude.invoke\""
        );
    }

    #[test]
    fn wire_event_omits_empty_fields() {
        let event = WireEvent::new(EventType::OrchCompleted);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"orch.completed\""));
        assert!(!json.contains("\"unit\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn wire_event_round_trips() {
        let event = WireEvent::new(EventType::UnitFailed)
            .with_unit("storage")
            .with_error("backpressure exhausted");
        let json = serde_json::to_string(&event).unwrap();
        let parsed: WireEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, "unit.failed");
        assert_eq!(parsed.unit.as_deref(), Some("storage"));
        assert_eq!(parsed.error.as_deref(), Some("backpressure exhausted"));
    }

    #[test]
    fn wire_event_time_is_rfc3339() {
        let event = WireEvent::new(EventType::TaskCompleted).with_task(3);
        let json = serde_json::to_value(&event).unwrap();
        let time = json["time"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(time).is_ok());
        assert_eq!(json["task"], 3);
    }

    #[test]
    fn graph_payload_serializes_shape() {
        let graph = GraphPayload {
            nodes: vec![
                GraphNode {
                    id: "a".to_string(),
                    level: 0,
                },
                GraphNode {
                    id: "b".to_string(),
                    level: 1,
                },
            ],
            edges: vec![GraphEdge {
                from: "a".to_string(),
                to: "b".to_string(),
            }],
            levels: vec![vec!["a".to_string()], vec!["b".to_string()]],
        };
        let json = serde_json::to_value(&graph).unwrap();
        assert_eq!(json["nodes"][1]["level"], 1);
        assert_eq!(json["edges"][0]["from"], "a");
        assert_eq!(json["levels"][1][0], "b");
    }

    #[test]
    fn unknown_wire_event_type_still_parses() {
        let line = r#"{"type":"custom.metric","time":"2026-01-01T00:00:00Z","payload":{"n":1}}"#;
        let parsed: WireEvent = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.event_type, "custom.metric");
        assert_eq!(parsed.payload.unwrap()["n"], 1);
    }
}
