//! Scheduling decisions: which unit runs next, and when a run is finished
//! or deadlocked.
//!
//! A unit is ready iff it is pending and every dependency is complete.
//! Candidates are scanned in deterministic order: by topological level,
//! alphabetical within a level.

use choo_core::graph::DepGraph;
use choo_core::types::UnitStatus;
use std::collections::BTreeMap;
use thiserror::Error;

/// A unit that can never become ready, with the dependencies it is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedUnit {
    pub unit: String,
    pub missing: Vec<String>,
}

#[derive(Debug, Error)]
#[error("deadlock: {} unit(s) blocked: {}", .blocked.len(), describe(.blocked))]
pub struct DeadlockError {
    pub blocked: Vec<BlockedUnit>,
}

fn describe(blocked: &[BlockedUnit]) -> String {
    blocked
        .iter()
        .map(|b| format!("{} (missing: {})", b.unit, b.missing.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// What the run loop should do next.
#[derive(Debug)]
pub enum Scheduling {
    /// Submit this unit to the pool.
    Dispatch(String),
    /// Nothing ready, but in-flight workers may unblock units.
    Wait,
    /// Every unit is terminal; `failed` lists the casualties.
    Finished { failed: Vec<String> },
    /// No ready units, nothing in flight, non-terminal units remain.
    Deadlock(DeadlockError),
}

/// Next unit in status `pending` whose every dependency is `complete`.
pub fn next_ready(graph: &DepGraph, statuses: &BTreeMap<String, UnitStatus>) -> Option<String> {
    let complete = |unit: &str| statuses.get(unit) == Some(&UnitStatus::Complete);
    graph
        .ready_units(complete)
        .into_iter()
        .find(|unit| statuses.get(*unit) == Some(&UnitStatus::Pending))
        .map(str::to_string)
}

/// Evaluate the terminate conditions.
pub fn next_action(
    graph: &DepGraph,
    statuses: &BTreeMap<String, UnitStatus>,
    in_flight: usize,
) -> Scheduling {
    if let Some(unit) = next_ready(graph, statuses) {
        return Scheduling::Dispatch(unit);
    }

    let all_terminal = graph
        .unit_ids()
        .all(|unit| statuses.get(unit).is_some_and(UnitStatus::is_terminal));
    if all_terminal && in_flight == 0 {
        let failed = graph
            .unit_ids()
            .filter(|unit| statuses.get(*unit) == Some(&UnitStatus::Failed))
            .map(str::to_string)
            .collect();
        return Scheduling::Finished { failed };
    }

    if in_flight > 0 {
        return Scheduling::Wait;
    }

    // Nothing ready, nothing running, work remains: every non-terminal unit
    // is blocked on dependencies that will never complete.
    let complete = |unit: &str| statuses.get(unit) == Some(&UnitStatus::Complete);
    let blocked = graph
        .unit_ids()
        .filter(|unit| !statuses.get(*unit).is_some_and(UnitStatus::is_terminal))
        .map(|unit| BlockedUnit {
            unit: unit.to_string(),
            missing: graph.missing_dependencies(unit, complete),
        })
        .collect();
    Scheduling::Deadlock(DeadlockError { blocked })
}

/// True when any unit has failed; drives the fail-fast drain policy.
pub fn has_failures(statuses: &BTreeMap<String, UnitStatus>) -> bool {
    statuses.values().any(|s| *s == UnitStatus::Failed)
}
