//! Job driver: executes one run end to end.
//!
//! Discovery produces the graph; the resolver hands ready units to the pool;
//! workers report back as they finish. A unit failure stops new submissions
//! and drains in-flight work before the run ends with failure. Every state
//! transition lands in the store and on the bus.

use crate::bus::EventBus;
use crate::discovery::{self, DiscoveryError};
use crate::emit::RunEvents;
use crate::escalation::{Escalator, LogEscalator};
use crate::pool::{self, Pool};
use crate::resolver::{self, Scheduling};
use crate::storage::{Storage, StorageError};
use crate::worker::WorkerContext;
use crate::worktree::WorktreeManager;
use choo_core::config::Config;
use choo_core::events::{EventType, OrchFailedPayload, OrchStartedPayload, WireEvent};
use choo_core::types::{Run, RunStatus, UnitRecord, UnitStatus};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// How a run ended.
#[derive(Debug)]
pub struct JobOutcome {
    pub success: bool,
    pub failed_units: Vec<String>,
    pub error: Option<String>,
}

/// Inputs for one run's execution.
pub struct JobHandle {
    pub storage: Arc<Storage>,
    pub bus: EventBus,
    pub config: Arc<Config>,
    pub cli_provider: Option<String>,
    pub escalator: Arc<dyn Escalator>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn new(storage: Arc<Storage>, bus: EventBus, config: Arc<Config>) -> Self {
        Self {
            storage,
            bus,
            config,
            cli_provider: None,
            escalator: Arc::new(LogEscalator),
        }
    }

    pub fn with_cli_provider(mut self, provider: Option<String>) -> Self {
        self.cli_provider = provider;
        self
    }

    pub fn with_escalator(mut self, escalator: Arc<dyn Escalator>) -> Self {
        self.escalator = escalator;
        self
    }

    /// Execute `run` to a terminal status. `Ok` covers both successful and
    /// failed runs; `Err` is reserved for validation and infrastructure
    /// failures (the run record is still finalized).
    pub async fn execute(&self, run: &Run, cancel: CancellationToken) -> Result<JobOutcome> {
        match self.execute_inner(run, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail_run(run, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn execute_inner(&self, run: &Run, cancel: CancellationToken) -> Result<JobOutcome> {
        let repo_path = Path::new(&run.repo_path);
        let tasks_dir = PathBuf::from(&run.tasks_dir);

        let mut discovered = discovery::discover(repo_path, &tasks_dir)?;
        if !discovered.errors.is_empty() {
            let detail = discovered
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.path.display(), e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(JobError::Validation(detail));
        }
        for warning in &discovered.warnings {
            warn!(path = %warning.path.display(), "{}", warning.message);
        }

        if let Some(single) = &self.config.single_unit {
            let Some(mut unit) = discovered.unit(single).cloned() else {
                return Err(JobError::Validation(format!("unknown unit: {single}")));
            };
            unit.meta.depends_on.clear();
            discovered.units = vec![unit];
        }

        let graph = discovered
            .build_graph()
            .map_err(|e| JobError::Validation(e.to_string()))?;

        self.storage
            .update_run_status(&run.id, RunStatus::Running, None)
            .await?;
        let events = RunEvents::new(Arc::clone(&self.storage), self.bus.clone(), run.id.clone());

        events
            .emit(
                WireEvent::new(EventType::OrchStarted).with_payload(&OrchStartedPayload {
                    run_id: run.id.clone(),
                    unit_count: graph.len(),
                    parallelism: run.parallelism,
                    graph: graph.to_payload(),
                }),
            )
            .await;
        info!(
            run_id = %run.id,
            units = graph.len(),
            parallelism = run.parallelism,
            "run started"
        );

        if self.config.dry_run {
            info!(run_id = %run.id, "dry run: discovery and graph validated, nothing executed");
            self.storage
                .update_run_status(&run.id, RunStatus::Completed, None)
                .await?;
            events.emit(WireEvent::new(EventType::OrchCompleted)).await;
            return Ok(JobOutcome {
                success: true,
                failed_units: Vec::new(),
                error: None,
            });
        }

        let mut statuses: BTreeMap<String, UnitStatus> = BTreeMap::new();
        for unit in &discovered.units {
            self.storage
                .create_unit(&UnitRecord::new(run.id.clone(), unit.id()))
                .await?;
            statuses.insert(unit.id().to_string(), UnitStatus::Pending);
        }

        let ctx = WorkerContext {
            storage: Arc::clone(&self.storage),
            events: events.clone(),
            worktrees: WorktreeManager::new(
                repo_path,
                self.resolve_worktree_base(repo_path),
                self.config.branch_prefix.clone(),
            ),
            escalator: Arc::clone(&self.escalator),
            config: Arc::clone(&self.config),
            run_id: run.id.clone(),
        };
        let factory = pool::provider_factory(Arc::clone(&self.config), self.cli_provider.clone());
        let mut pool = Pool::new(
            ctx,
            factory,
            run.parallelism,
            Duration::from_secs(self.config.shutdown_timeout_sec),
            cancel.child_token(),
        );

        let mut draining = false;
        let mut dispatch_error: Option<String> = None;
        let mut deadlock: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                info!(run_id = %run.id, "cancellation requested, shutting down pool");
                for result in pool.shutdown().await {
                    apply_result(&mut statuses, &result.unit_id, result.result.is_ok());
                }
                self.mark_unfinished_cancelled(run, &mut statuses).await;
                self.fail_run(run, "cancelled").await;
                return Ok(JobOutcome {
                    success: false,
                    failed_units: failed_units(&statuses),
                    error: Some("cancelled".to_string()),
                });
            }

            if draining {
                if pool.in_flight() == 0 {
                    break;
                }
                if let Some(result) = pool.next_result().await {
                    apply_result(&mut statuses, &result.unit_id, result.result.is_ok());
                }
                continue;
            }

            match resolver::next_action(&graph, &statuses, pool.in_flight()) {
                Scheduling::Dispatch(unit_id) => {
                    self.storage
                        .update_unit_status(&run.id, &unit_id, UnitStatus::Ready, None)
                        .await?;
                    events
                        .emit(WireEvent::new(EventType::UnitQueued).with_unit(&unit_id))
                        .await;

                    let unit = discovered
                        .unit(&unit_id)
                        .cloned()
                        .ok_or_else(|| JobError::Validation(format!("unknown unit: {unit_id}")))?;
                    match pool.submit(unit).await {
                        Ok(()) => {
                            statuses.insert(unit_id, UnitStatus::InProgress);
                        }
                        Err(e) => {
                            error!(unit = %unit_id, error = %e, "submit failed");
                            self.storage
                                .update_unit_status(
                                    &run.id,
                                    &unit_id,
                                    UnitStatus::Failed,
                                    Some(&e.to_string()),
                                )
                                .await?;
                            statuses.insert(unit_id, UnitStatus::Failed);
                            dispatch_error = Some(e.to_string());
                            draining = true;
                        }
                    }
                }
                Scheduling::Wait => {
                    let result = tokio::select! {
                        result = pool.next_result() => result,
                        () = cancel.cancelled() => continue,
                    };
                    if let Some(result) = result {
                        let ok = result.result.is_ok();
                        apply_result(&mut statuses, &result.unit_id, ok);
                        if !ok {
                            // Fail fast: drain in-flight, submit nothing new.
                            draining = true;
                        }
                    }
                }
                Scheduling::Finished { .. } => break,
                Scheduling::Deadlock(e) => {
                    deadlock = Some(e.to_string());
                    break;
                }
            }
        }

        let failed = failed_units(&statuses);
        if let Some(message) = deadlock {
            self.fail_run(run, &message).await;
            return Ok(JobOutcome {
                success: false,
                failed_units: failed,
                error: Some(message),
            });
        }

        if failed.is_empty() && dispatch_error.is_none() {
            self.storage
                .update_run_status(&run.id, RunStatus::Completed, None)
                .await?;
            events.emit(WireEvent::new(EventType::OrchCompleted)).await;
            info!(run_id = %run.id, "run completed");
            Ok(JobOutcome {
                success: true,
                failed_units: Vec::new(),
                error: None,
            })
        } else {
            let message = dispatch_error
                .unwrap_or_else(|| format!("{} unit(s) failed: {}", failed.len(), failed.join(", ")));
            self.fail_run(run, &message).await;
            Ok(JobOutcome {
                success: false,
                failed_units: failed,
                error: Some(message),
            })
        }
    }

    /// Worktrees live outside the repository so agents cannot trip over
    /// them; a relative base resolves against the repository parent.
    fn resolve_worktree_base(&self, repo_path: &Path) -> PathBuf {
        let base = &self.config.worktree_base;
        if base.is_absolute() {
            base.clone()
        } else {
            repo_path
                .parent()
                .unwrap_or(repo_path)
                .join(base.file_name().unwrap_or(base.as_os_str()))
        }
    }

    async fn mark_unfinished_cancelled(
        &self,
        run: &Run,
        statuses: &mut BTreeMap<String, UnitStatus>,
    ) {
        for (unit_id, status) in statuses.iter_mut() {
            if !status.is_terminal() {
                *status = UnitStatus::Failed;
                if let Err(e) = self
                    .storage
                    .update_unit_status(&run.id, unit_id, UnitStatus::Failed, Some("cancelled"))
                    .await
                {
                    warn!(unit = %unit_id, error = %e, "failed to record cancellation");
                }
            }
        }
    }

    async fn fail_run(&self, run: &Run, message: &str) {
        if let Err(e) = self
            .storage
            .update_run_status(&run.id, RunStatus::Failed, Some(message))
            .await
        {
            warn!(run_id = %run.id, error = %e, "failed to record run failure");
        }
        let events = RunEvents::new(Arc::clone(&self.storage), self.bus.clone(), run.id.clone());
        events
            .emit(
                WireEvent::new(EventType::OrchFailed)
                    .with_error(message)
                    .with_payload(&OrchFailedPayload {
                        run_id: run.id.clone(),
                        error: message.to_string(),
                    }),
            )
            .await;
        error!(run_id = %run.id, error = %message, "run failed");
    }
}

fn apply_result(statuses: &mut BTreeMap<String, UnitStatus>, unit_id: &str, ok: bool) {
    let status = if ok {
        UnitStatus::Complete
    } else {
        UnitStatus::Failed
    };
    statuses.insert(unit_id.to_string(), status);
}

fn failed_units(statuses: &BTreeMap<String, UnitStatus>) -> Vec<String> {
    statuses
        .iter()
        .filter(|(_, status)| **status == UnitStatus::Failed)
        .map(|(unit, _)| unit.clone())
        .collect()
}

/// Build a new run record for submission.
pub fn new_run(
    feature_branch: impl Into<String>,
    repo_path: &Path,
    config: &Config,
) -> Run {
    let now = chrono::Utc::now();
    Run {
        id: choo_core::types::RunId::new(),
        feature_branch: feature_branch.into(),
        repo_path: repo_path.to_string_lossy().into_owned(),
        target_branch: config.target_branch.clone(),
        tasks_dir: config.tasks_dir.to_string_lossy().into_owned(),
        parallelism: config.parallelism,
        status: RunStatus::Pending,
        daemon_version: env!("CARGO_PKG_VERSION").to_string(),
        config_json: serde_json::to_string(config).ok(),
        started_at: None,
        completed_at: None,
        error: None,
        created_at: now,
        updated_at: now,
    }
}
