//! Daemon core: job registry, boot-time resume, shutdown discipline.
//!
//! On boot the daemon lists incomplete runs and reattaches the ones whose
//! repositories and worktrees still exist; everything else flips to failed
//! with `"daemon restart: unresumable"`. Shutdown cancels active jobs and
//! drains them under the configured timeout.

use crate::bus::EventBus;
use crate::job::{JobHandle, JobOutcome};
use crate::storage::{Storage, StorageError};
use choo_core::config::Config;
use choo_core::types::{Run, RunId, RunStatus, UnitStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const UNRESUMABLE: &str = "daemon restart: unresumable";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("run already active for branch {0}")]
    DuplicateRun(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Supervises job execution over one store.
pub struct Daemon {
    storage: Arc<Storage>,
    bus: EventBus,
    config: Arc<Config>,
    cancel: CancellationToken,
    jobs: JoinSet<(RunId, Option<JobOutcome>)>,
    active: HashMap<RunId, CancellationToken>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    pub fn new(storage: Arc<Storage>, bus: EventBus, config: Arc<Config>) -> Self {
        Self {
            storage,
            bus,
            config,
            cancel: CancellationToken::new(),
            jobs: JoinSet::new(),
            active: HashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Submit a new run. A duplicate active run for the same
    /// `(feature_branch, repo_path)` is rejected without touching it.
    pub async fn submit(&mut self, run: Run) -> Result<RunId> {
        match self.storage.create_run(&run).await {
            Ok(()) => {}
            Err(StorageError::DuplicateRun { feature_branch, .. }) => {
                return Err(DaemonError::DuplicateRun(feature_branch));
            }
            Err(e) => return Err(e.into()),
        }
        let run_id = run.id.clone();
        self.spawn_job(run);
        Ok(run_id)
    }

    /// Reattach or garbage-collect incomplete runs from a previous daemon
    /// process. Returns the runs that were resumed.
    pub async fn resume_incomplete(&mut self) -> Result<Vec<Run>> {
        let incomplete = self.storage.list_incomplete_runs().await?;
        let mut resumed = Vec::new();

        for run in incomplete {
            if !Path::new(&run.repo_path).is_dir() {
                warn!(run_id = %run.id, repo = %run.repo_path, "repository missing, not resuming");
                self.storage
                    .update_run_status(&run.id, RunStatus::Failed, Some(UNRESUMABLE))
                    .await?;
                continue;
            }

            self.reset_units_for_resume(&run).await?;
            info!(run_id = %run.id, branch = %run.feature_branch, "resuming run");
            self.spawn_job(run.clone());
            resumed.push(run);
        }
        Ok(resumed)
    }

    /// Units interrupted mid-flight: re-enter the ones whose worktrees
    /// survive (their branch is kept), fail the rest.
    async fn reset_units_for_resume(&self, run: &Run) -> Result<()> {
        for unit in self.storage.list_units_by_run(&run.id).await? {
            match unit.status {
                UnitStatus::Pending | UnitStatus::Complete | UnitStatus::Failed => {}
                UnitStatus::Ready => {
                    self.storage
                        .update_unit_status(&run.id, &unit.unit_id, UnitStatus::Pending, None)
                        .await?;
                }
                _ => {
                    let worktree_alive = unit
                        .worktree_path
                        .as_deref()
                        .is_some_and(|p| Path::new(p).is_dir());
                    if worktree_alive {
                        info!(unit = %unit.unit_id, "re-entering unit with live worktree");
                        self.storage
                            .update_unit_status(&run.id, &unit.unit_id, UnitStatus::Pending, None)
                            .await?;
                    } else {
                        warn!(unit = %unit.unit_id, "worktree lost, failing unit");
                        self.storage
                            .update_unit_status(
                                &run.id,
                                &unit.unit_id,
                                UnitStatus::Failed,
                                Some(UNRESUMABLE),
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_job(&mut self, run: Run) {
        let handle = JobHandle::new(
            Arc::clone(&self.storage),
            self.bus.clone(),
            Arc::clone(&self.config),
        );
        let job_cancel = self.cancel.child_token();
        self.active.insert(run.id.clone(), job_cancel.clone());

        self.jobs.spawn(async move {
            let run_id = run.id.clone();
            let outcome = handle.execute(&run, job_cancel).await.ok();
            (run_id, outcome)
        });
    }

    /// Wait for the next job to finish, reaping its registry entry.
    pub async fn next_finished(&mut self) -> Option<(RunId, Option<JobOutcome>)> {
        loop {
            match self.jobs.join_next().await? {
                Ok((run_id, outcome)) => {
                    self.active.remove(&run_id);
                    return Some((run_id, outcome));
                }
                Err(e) => warn!(error = %e, "job task aborted"),
            }
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Cancel everything and drain within the shutdown timeout.
    pub async fn shutdown(mut self) {
        info!(active = self.active.len(), "daemon shutting down");
        self.cancel.cancel();

        let timeout = Duration::from_secs(self.config.shutdown_timeout_sec);
        let drain = async {
            while self.jobs.join_next().await.is_some() {}
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timeout expired, aborting jobs");
            self.jobs.abort_all();
        }
    }
}
