//! A worker owns one unit for the duration of its execution.
//!
//! It isolates the unit in a fresh worktree, drives the Ralph loop, records
//! every status transition, and always cleans up — success, failure, or
//! cancellation. It never constructs a pool or schedules other units.

use crate::agent::AgentCommand;
use crate::delegate::GitDelegate;
use crate::discovery::DiscoveredUnit;
use crate::emit::RunEvents;
use crate::escalation::Escalator;
use crate::ralph::{RalphError, RalphLoop, RalphOutcome};
use crate::storage::{Storage, StorageError};
use crate::worktree::{WorktreeError, WorktreeManager};
use choo_core::config::Config;
use choo_core::events::{EventType, UnitFailedPayload, WireEvent};
use choo_core::types::{RunId, UnitStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ralph(#[from] RalphError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("cancelled")]
    Cancelled,
}

impl WorkerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Ralph(RalphError::Cancelled)
        )
    }
}

/// Everything a worker needs beyond its unit; cloned per worker by the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub storage: Arc<Storage>,
    pub events: RunEvents,
    pub worktrees: WorktreeManager,
    pub escalator: Arc<dyn Escalator>,
    pub config: Arc<Config>,
    pub run_id: RunId,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Drives one unit to a terminal state.
#[derive(Debug)]
pub struct Worker {
    unit: DiscoveredUnit,
    agent: AgentCommand,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(unit: DiscoveredUnit, agent: AgentCommand, ctx: WorkerContext) -> Self {
        Self { unit, agent, ctx }
    }

    pub fn unit_id(&self) -> &str {
        self.unit.id()
    }

    /// Execute the unit. The returned result mirrors the unit record's final
    /// status: `Ok` iff the record is `complete`.
    pub async fn run(self, cancel: CancellationToken) -> Result<RalphOutcome, WorkerError> {
        let unit_id = self.unit.id().to_string();
        let result = self.execute(&cancel, &unit_id).await;

        match &result {
            Ok(outcome) => {
                info!(
                    unit = %unit_id,
                    iterations = outcome.iterations,
                    tasks = outcome.tasks_completed,
                    "unit complete"
                );
            }
            Err(e) => {
                error!(unit = %unit_id, error = %e, "unit failed");
            }
        }
        result
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        unit_id: &str,
    ) -> Result<RalphOutcome, WorkerError> {
        if cancel.is_cancelled() {
            self.mark_failed(unit_id, "cancelled").await;
            return Err(WorkerError::Cancelled);
        }

        self.ctx
            .storage
            .update_unit_status(&self.ctx.run_id, unit_id, UnitStatus::InProgress, None)
            .await?;
        self.ctx
            .events
            .emit(
                WireEvent::new(EventType::UnitStarted)
                    .with_unit(unit_id)
                    .with_payload(&serde_json::json!({
                        "total_tasks": self.unit.tasks.len()
                    })),
            )
            .await;

        // Re-enter the recorded branch after a restart so committed agent
        // work survives; otherwise start a fresh branch off target.
        let recorded_branch = self
            .ctx
            .storage
            .get_unit(&self.ctx.run_id, unit_id)
            .await?
            .and_then(|record| record.branch)
            .filter(|branch| {
                crate::git::branch_exists(self.ctx.worktrees.repo(), branch).unwrap_or(false)
            });

        let created = match recorded_branch {
            Some(branch) => {
                info!(unit = %unit_id, branch = %branch, "re-entering existing unit branch");
                self.ctx
                    .worktrees
                    .create_on_branch(unit_id, &branch, &self.ctx.config.target_branch)
            }
            None => self
                .ctx
                .worktrees
                .create(unit_id, &self.ctx.config.target_branch),
        };
        let worktree = match created {
            Ok(worktree) => worktree,
            Err(e) => {
                self.mark_failed(unit_id, &e.to_string()).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .ctx
            .storage
            .update_unit_branch(
                &self.ctx.run_id,
                unit_id,
                &worktree.branch,
                Some(&worktree.path.to_string_lossy()),
            )
            .await
        {
            warn!(unit = %unit_id, error = %e, "failed to record unit branch");
        }

        let delegate = GitDelegate::new(self.agent.clone(), Arc::clone(&self.ctx.escalator));
        let mut ralph = RalphLoop::new(
            &self.unit,
            &worktree.path,
            &worktree.branch,
            self.agent.clone(),
            delegate,
            self.ctx.events.clone(),
            Arc::clone(&self.ctx.config),
        );

        let outcome = ralph.run(cancel).await;

        // Cleanup runs on every exit path.
        if let Err(e) = self
            .ctx
            .worktrees
            .remove(&worktree, self.ctx.config.delete_branch_on_cleanup)
        {
            warn!(unit = %unit_id, error = %e, "worktree cleanup failed");
        }

        match outcome {
            Ok(outcome) => {
                if outcome.pr_url.is_some() {
                    self.ctx
                        .storage
                        .update_unit_status(&self.ctx.run_id, unit_id, UnitStatus::PrOpen, None)
                        .await?;
                }
                self.ctx
                    .storage
                    .update_unit_status(&self.ctx.run_id, unit_id, UnitStatus::Complete, None)
                    .await?;
                self.ctx
                    .events
                    .emit(WireEvent::new(EventType::UnitCompleted).with_unit(unit_id))
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                let message = if matches!(e, RalphError::Cancelled) {
                    "cancelled".to_string()
                } else {
                    e.to_string()
                };
                self.mark_failed(unit_id, &message).await;
                Err(e.into())
            }
        }
    }

    async fn mark_failed(&self, unit_id: &str, message: &str) {
        if let Err(e) = self
            .ctx
            .storage
            .update_unit_status(&self.ctx.run_id, unit_id, UnitStatus::Failed, Some(message))
            .await
        {
            warn!(unit = %unit_id, error = %e, "failed to record unit failure");
        }
        self.ctx
            .events
            .emit(
                WireEvent::new(EventType::UnitFailed)
                    .with_unit(unit_id)
                    .with_error(message)
                    .with_payload(&UnitFailedPayload {
                        unit: unit_id.to_string(),
                        error: message.to_string(),
                    }),
            )
            .await;
    }
}
