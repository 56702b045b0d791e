//! Escalations: structured records emitted when retries are exhausted.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// How urgently a human needs to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Blocking,
}

/// A structured record handed to the configured sink; never emitted on
/// success.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Escalation {
    pub severity: Severity,
    pub unit: String,
    pub title: String,
    pub message: String,
    /// Free-form key/value context (attempt counts, captured output, ...).
    pub context: BTreeMap<String, String>,
}

impl Escalation {
    pub fn blocking(unit: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Blocking,
            unit: unit.into(),
            title: title.into(),
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Sink for escalations.
pub trait Escalator: Send + Sync {
    fn escalate(&self, escalation: Escalation);
}

/// Default sink: structured log output.
#[derive(Debug, Default)]
pub struct LogEscalator;

impl Escalator for LogEscalator {
    fn escalate(&self, escalation: Escalation) {
        tracing::error!(
            unit = %escalation.unit,
            severity = ?escalation.severity,
            title = %escalation.title,
            message = %escalation.message,
            context = ?escalation.context,
            "escalation"
        );
    }
}

/// Test sink that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingEscalator {
    pub received: Mutex<Vec<Escalation>>,
}

impl Escalator for RecordingEscalator {
    fn escalate(&self, escalation: Escalation) {
        if let Ok(mut received) = self.received.lock() {
            received.push(escalation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_constructor_sets_severity() {
        let escalation = Escalation::blocking("storage", "commit failed", "3 attempts exhausted")
            .with_context("attempts", "3");
        assert_eq!(escalation.severity, Severity::Blocking);
        assert_eq!(escalation.unit, "storage");
        assert_eq!(escalation.context.get("attempts").unwrap(), "3");
    }

    #[test]
    fn recording_escalator_captures() {
        let escalator = RecordingEscalator::default();
        escalator.escalate(Escalation::blocking("a", "t", "m"));
        assert_eq!(escalator.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn severity_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Severity::Blocking).unwrap(),
            "\"blocking\""
        );
    }
}
