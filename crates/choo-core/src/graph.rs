//! Unit dependency graph: validation, levels, and ready-set computation.
//!
//! Nodes are unit ids, edges come from `depends_on`. The graph must be
//! acyclic; a cycle, self-loop, or missing referent is a hard discovery
//! failure. A node's level is the length of the longest path from a source,
//! which drives both the dashboard layout and deterministic scheduling order.

use crate::events::{GraphEdge, GraphNode, GraphPayload};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unit {unit} depends on unknown unit {dependency}")]
    MissingDependency { unit: String, dependency: String },
    #[error("unit {0} depends on itself")]
    SelfLoop(String),
    #[error("dependency cycle involving units: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("duplicate unit id {0}")]
    DuplicateUnit(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Validated dependency graph over unit ids.
///
/// Deterministic by construction: iteration order is alphabetical (BTreeMap),
/// so levels and ready sets come out stable across runs.
#[derive(Debug, Clone)]
pub struct DepGraph {
    /// unit id -> direct dependencies.
    deps: BTreeMap<String, BTreeSet<String>>,
    /// unit id -> longest path from a source.
    levels: BTreeMap<String, usize>,
}

impl DepGraph {
    /// Build and validate a graph from `(unit_id, depends_on)` pairs.
    pub fn build<I, D>(units: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, D)>,
        D: IntoIterator<Item = String>,
    {
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (unit, unit_deps) in units {
            if deps.contains_key(&unit) {
                return Err(GraphError::DuplicateUnit(unit));
            }
            deps.insert(unit, unit_deps.into_iter().collect());
        }

        for (unit, unit_deps) in &deps {
            for dep in unit_deps {
                if dep == unit {
                    return Err(GraphError::SelfLoop(unit.clone()));
                }
                if !deps.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        unit: unit.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let levels = compute_levels(&deps)?;
        Ok(Self { deps, levels })
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.deps.contains_key(unit)
    }

    /// Unit ids in alphabetical order.
    pub fn unit_ids(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    pub fn dependencies(&self, unit: &str) -> impl Iterator<Item = &str> {
        self.deps.get(unit).into_iter().flatten().map(String::as_str)
    }

    pub fn level(&self, unit: &str) -> Option<usize> {
        self.levels.get(unit).copied()
    }

    /// Units whose dependencies are all satisfied by `is_complete`, ordered
    /// by level then alphabetically within the level.
    pub fn ready_units<'a, F>(&'a self, is_complete: F) -> Vec<&'a str>
    where
        F: Fn(&str) -> bool,
    {
        let mut ready: Vec<&str> = self
            .deps
            .iter()
            .filter(|(unit, unit_deps)| {
                !is_complete(unit) && unit_deps.iter().all(|d| is_complete(d))
            })
            .map(|(unit, _)| unit.as_str())
            .collect();
        ready.sort_by_key(|unit| (self.levels.get(*unit).copied().unwrap_or(0), *unit));
        ready
    }

    /// Dependencies of `unit` not satisfied by `is_complete`.
    pub fn missing_dependencies<F>(&self, unit: &str, is_complete: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        self.dependencies(unit)
            .filter(|d| !is_complete(d))
            .map(str::to_string)
            .collect()
    }

    /// Wire form for `orch.started` and `GET /api/graph`.
    pub fn to_payload(&self) -> GraphPayload {
        let nodes = self
            .deps
            .keys()
            .map(|id| GraphNode {
                id: id.clone(),
                level: self.levels.get(id).copied().unwrap_or(0),
            })
            .collect();

        let edges = self
            .deps
            .iter()
            .flat_map(|(unit, unit_deps)| {
                unit_deps.iter().map(move |dep| GraphEdge {
                    from: dep.clone(),
                    to: unit.clone(),
                })
            })
            .collect();

        let max_level = self.levels.values().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); if self.deps.is_empty() { 0 } else { max_level + 1 }];
        for (unit, level) in &self.levels {
            levels[*level].push(unit.clone());
        }

        GraphPayload {
            nodes,
            edges,
            levels,
        }
    }
}

/// Longest-path levels via Kahn's algorithm; detects cycles as a side effect.
fn compute_levels(deps: &BTreeMap<String, BTreeSet<String>>) -> Result<BTreeMap<String, usize>> {
    let mut in_degree: BTreeMap<&str, usize> =
        deps.iter().map(|(u, d)| (u.as_str(), d.len())).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (unit, unit_deps) in deps {
        for dep in unit_deps {
            dependents.entry(dep.as_str()).or_default().push(unit.as_str());
        }
    }

    let mut levels: BTreeMap<String, usize> = BTreeMap::new();
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(u, _)| *u)
        .collect();

    while let Some(unit) = queue.pop() {
        let level = deps[unit]
            .iter()
            .filter_map(|d| levels.get(d.as_str()))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        levels.insert(unit.to_string(), level);

        for &dependent in dependents.get(unit).into_iter().flatten() {
            let remaining = in_degree
                .get_mut(dependent)
                .map(|d| {
                    *d -= 1;
                    *d
                })
                .unwrap_or(0);
            if remaining == 0 {
                queue.push(dependent);
            }
        }
    }

    if levels.len() != deps.len() {
        let cycle: Vec<String> = deps
            .keys()
            .filter(|u| !levels.contains_key(*u))
            .cloned()
            .collect();
        return Err(GraphError::Cycle(cycle));
    }
    Ok(levels)
}
