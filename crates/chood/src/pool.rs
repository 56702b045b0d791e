//! Bounded worker pool.
//!
//! `max_workers` units run concurrently; `submit` waits on the slot
//! semaphore when the pool is full. The agent for each unit is resolved at
//! dispatch time through the injected provider factory, so a worker never
//! owns the scheduler and an unresolvable provider fails submission, not
//! unit execution.

use crate::agent::AgentCommand;
use crate::discovery::DiscoveredUnit;
use crate::ralph::RalphOutcome;
use crate::worker::{Worker, WorkerContext, WorkerError};
use choo_core::config::Config;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("provider resolution failed for unit {unit}: {message}")]
    UnresolvedProvider { unit: String, message: String },
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Resolves the agent for a unit at dispatch time.
pub type ProviderFactory =
    Arc<dyn Fn(&DiscoveredUnit) -> Result<AgentCommand, String> + Send + Sync>;

/// Build the standard factory from the precedence chain:
/// `--force-task-provider` > unit front-matter > CLI `--provider` >
/// config-file type > built-in default, with command overrides on top.
pub fn provider_factory(config: Arc<Config>, cli_provider: Option<String>) -> ProviderFactory {
    Arc::new(move |unit: &DiscoveredUnit| {
        let provider =
            config.resolve_provider(unit.meta.provider.as_deref(), cli_provider.as_deref());
        AgentCommand::resolve(&provider, &config)
    })
}

/// Result of one worker's execution.
#[derive(Debug)]
pub struct WorkerResult {
    pub unit_id: String,
    pub result: Result<RalphOutcome, WorkerError>,
}

/// Bounded parallelism over units.
pub struct Pool {
    ctx: WorkerContext,
    factory: ProviderFactory,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    workers: JoinSet<WorkerResult>,
    accepting: bool,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("in_flight", &self.workers.len())
            .field("accepting", &self.accepting)
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(
        ctx: WorkerContext,
        factory: ProviderFactory,
        max_workers: u32,
        shutdown_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            factory,
            semaphore: Arc::new(Semaphore::new(max_workers.max(1) as usize)),
            cancel,
            workers: JoinSet::new(),
            accepting: true,
            shutdown_timeout,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Dispatch a unit. Waits for a free slot when the pool is saturated;
    /// fails fast when the provider cannot be resolved.
    pub async fn submit(&mut self, unit: DiscoveredUnit) -> Result<(), PoolError> {
        if !self.accepting || self.cancel.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let agent = (self.factory)(&unit).map_err(|message| PoolError::UnresolvedProvider {
            unit: unit.id().to_string(),
            message,
        })?;

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::ShuttingDown)?;

        let unit_id = unit.id().to_string();
        let worker = Worker::new(unit, agent, self.ctx.clone());
        let worker_cancel = self.cancel.child_token();

        info!(unit = %unit_id, in_flight = self.workers.len() + 1, "dispatching unit");
        self.workers.spawn(async move {
            let _permit = permit;
            let result = worker.run(worker_cancel).await;
            WorkerResult { unit_id, result }
        });
        Ok(())
    }

    /// Next finished worker; `None` when nothing is in flight.
    pub async fn next_result(&mut self) -> Option<WorkerResult> {
        loop {
            match self.workers.join_next().await? {
                Ok(result) => return Some(result),
                Err(join_error) => {
                    // A panicked worker is a failed unit we cannot attribute
                    // beyond the log; keep draining.
                    warn!(error = %join_error, "worker task aborted");
                }
            }
        }
    }

    /// Stop accepting units, cancel in-flight workers, and wait up to the
    /// shutdown timeout. Returns the results that arrived in time.
    pub async fn shutdown(&mut self) -> Vec<WorkerResult> {
        self.accepting = false;
        self.cancel.cancel();

        let mut finished = Vec::new();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        while self.in_flight() > 0 {
            match tokio::time::timeout_at(deadline, self.next_result()).await {
                Ok(Some(result)) => finished.push(result),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.in_flight(),
                        "shutdown timeout expired, aborting workers"
                    );
                    self.workers.abort_all();
                    while self.workers.join_next().await.is_some() {}
                    break;
                }
            }
        }
        finished
    }
}
