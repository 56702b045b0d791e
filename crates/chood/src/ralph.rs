//! The per-unit inner loop: select ready tasks, invoke the agent, verify
//! completion, run backpressure, commit, then baseline and PR.
//!
//! Task files on disk are the source of truth. The agent mutates front-matter
//! status; the loop re-reads every ready task after each invocation and
//! treats the first newly-complete one as "the" completed task. A failed
//! backpressure reverts that task to pending in memory only and re-invokes
//! the agent with the failure output; the file is never rewritten by the
//! orchestrator.

use crate::agent::{AgentCommand, AgentError};
use crate::backpressure::{self, BackpressureError};
use crate::baseline;
use crate::delegate::{self, DelegateError, GitDelegate};
use crate::discovery::DiscoveredUnit;
use crate::emit::RunEvents;
use choo_core::config::Config;
use choo_core::events::{
    BaselineFailedPayload, BranchPushedPayload, EventType, PrCreatedPayload, TaskPayload, WireEvent,
};
use choo_core::frontmatter;
use choo_core::types::TaskStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RalphError {
    #[error("no ready tasks but {0:?} still pending (task-level deadlock)")]
    TaskDeadlock(Vec<u32>),
    #[error("agent made no progress after {attempts} attempts: {last}")]
    AgentExhausted { attempts: u32, last: String },
    #[error("backpressure for task #{task} failed after {attempts} attempts:\n{output}")]
    BackpressureExhausted {
        task: u32,
        attempts: u32,
        output: String,
    },
    #[error("baseline checks failed after {attempts} fix attempts:\n{output}")]
    BaselineExhausted { attempts: u32, output: String },
    #[error("task file {path}: {message}")]
    TaskFile { path: PathBuf, message: String },
    #[error(transparent)]
    Delegate(#[from] DelegateError),
    #[error("agent error: {0}")]
    Agent(AgentError),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RalphError>;

/// Loop phase, exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RalphPhase {
    TaskSelection,
    ClaudeInvoke,
    Backpressure,
    Commit,
    BaselineChecks,
    BaselineFix,
    PrCreation,
}

impl RalphPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskSelection => "task_selection",
            Self::ClaudeInvoke => "claude_invoke",
            Self::Backpressure => "backpressure",
            Self::Commit => "commit",
            Self::BaselineChecks => "baseline_checks",
            Self::BaselineFix => "baseline_fix",
            Self::PrCreation => "pr_creation",
        }
    }
}

/// What the loop produced for a unit.
#[derive(Debug, Clone)]
pub struct RalphOutcome {
    /// Agent invocations in the task loop.
    pub iterations: u32,
    pub tasks_completed: u32,
    pub pr_url: Option<String>,
}

/// One task as the loop tracks it.
#[derive(Debug, Clone)]
struct TaskSlot {
    num: u32,
    title: String,
    /// Path relative to the repository root (stable across worktrees).
    rel_path: PathBuf,
}

/// A task's state as read from the worktree.
#[derive(Debug, Clone)]
struct TaskState {
    num: u32,
    title: String,
    rel_path: PathBuf,
    backpressure: String,
    depends_on: Vec<u32>,
    disk_status: TaskStatus,
    effective_status: TaskStatus,
}

/// Per-unit execution loop.
pub struct RalphLoop {
    unit_id: String,
    slots: Vec<TaskSlot>,
    workdir: PathBuf,
    branch: String,
    agent: AgentCommand,
    delegate: GitDelegate,
    events: RunEvents,
    config: Arc<Config>,
    pub iteration: u32,
    pub phase: RalphPhase,
}

impl std::fmt::Debug for RalphLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RalphLoop")
            .field("unit_id", &self.unit_id)
            .field("iteration", &self.iteration)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl RalphLoop {
    pub fn new(
        unit: &DiscoveredUnit,
        workdir: impl Into<PathBuf>,
        branch: impl Into<String>,
        agent: AgentCommand,
        delegate: GitDelegate,
        events: RunEvents,
        config: Arc<Config>,
    ) -> Self {
        let slots = unit
            .tasks
            .iter()
            .map(|t| TaskSlot {
                num: t.num(),
                title: t.title.clone(),
                rel_path: t.path.clone(),
            })
            .collect();
        Self {
            unit_id: unit.id().to_string(),
            slots,
            workdir: workdir.into(),
            branch: branch.into(),
            agent,
            delegate,
            events,
            config,
            iteration: 0,
            phase: RalphPhase::TaskSelection,
        }
    }

    pub fn total_tasks(&self) -> usize {
        self.slots.len()
    }

    /// Drive the unit to completion: task loop, baseline, push, PR.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RalphOutcome> {
        let tasks_completed = self.task_loop(cancel).await?;
        self.baseline_loop(cancel).await?;
        let pr_url = self.publish(cancel).await?;

        Ok(RalphOutcome {
            iterations: self.iteration,
            tasks_completed,
            pr_url,
        })
    }

    async fn task_loop(&mut self, cancel: &CancellationToken) -> Result<u32> {
        let mut reverted: BTreeSet<u32> = BTreeSet::new();
        let mut bp_attempts: BTreeMap<u32, u32> = BTreeMap::new();
        let mut invoke_attempts: u32 = 0;
        let mut last_invoke_error = String::from("no ready task reached status complete");
        let mut failure_context: Option<String> = None;
        let mut tasks_completed: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RalphError::Cancelled);
            }

            self.phase = RalphPhase::TaskSelection;
            let states = self.read_task_states(&reverted)?;
            let ready = select_ready(&states);

            if ready.is_empty() {
                let pending: Vec<u32> = states
                    .iter()
                    .filter(|t| t.effective_status == TaskStatus::Pending)
                    .map(|t| t.num)
                    .collect();
                if pending.is_empty() {
                    debug!(unit = %self.unit_id, "all tasks complete");
                    return Ok(tasks_completed);
                }
                return Err(RalphError::TaskDeadlock(pending));
            }

            self.phase = RalphPhase::ClaudeInvoke;
            self.iteration += 1;
            let prompt = self.task_prompt(&ready, failure_context.as_deref());

            self.events
                .emit(WireEvent::new(EventType::TaskAgentInvoke).with_unit(&self.unit_id))
                .await;
            let invoke_result = self.invoke_agent(cancel, &prompt).await;
            self.events
                .emit(WireEvent::new(EventType::TaskAgentDone).with_unit(&self.unit_id))
                .await;

            match invoke_result {
                Ok(()) => {}
                Err(AgentError::Cancelled) => return Err(RalphError::Cancelled),
                Err(e @ AgentError::NotFound(_)) => return Err(RalphError::Agent(e)),
                Err(e) => {
                    // A flaky agent exit is retried like a no-progress pass.
                    warn!(unit = %self.unit_id, error = %e, "agent invocation failed");
                    last_invoke_error = e.to_string();
                }
            }

            let ready_nums: Vec<u32> = ready.iter().map(|t| t.num).collect();
            let completed = self.detect_completed(&ready_nums)?;

            let Some(task) = completed else {
                invoke_attempts += 1;
                if invoke_attempts >= self.config.max_claude_retries {
                    return Err(RalphError::AgentExhausted {
                        attempts: invoke_attempts,
                        last: last_invoke_error,
                    });
                }
                continue;
            };
            invoke_attempts = 0;

            self.events
                .emit(
                    WireEvent::new(EventType::TaskStarted)
                        .with_unit(&self.unit_id)
                        .with_task(task.num)
                        .with_payload(&TaskPayload {
                            unit: self.unit_id.clone(),
                            task: task.num,
                        }),
                )
                .await;

            self.phase = RalphPhase::Backpressure;
            let bp = backpressure::run(
                cancel,
                &task.backpressure,
                &self.workdir,
                Duration::from_secs(self.config.backpressure_timeout_sec),
            )
            .await
            .map_err(|e| match e {
                BackpressureError::Cancelled => RalphError::Cancelled,
                BackpressureError::Io(io) => RalphError::TaskFile {
                    path: task.rel_path.clone(),
                    message: io.to_string(),
                },
            })?;

            if !bp.ok {
                let attempts = bp_attempts.entry(task.num).or_insert(0);
                *attempts += 1;
                info!(
                    unit = %self.unit_id,
                    task = task.num,
                    attempt = *attempts,
                    "backpressure failed, reverting task to pending"
                );
                if *attempts >= self.config.max_claude_retries {
                    self.events
                        .emit(
                            WireEvent::new(EventType::TaskFailed)
                                .with_unit(&self.unit_id)
                                .with_task(task.num)
                                .with_error(format!(
                                    "backpressure failed after {attempts} attempts"
                                )),
                        )
                        .await;
                    return Err(RalphError::BackpressureExhausted {
                        task: task.num,
                        attempts: *attempts,
                        output: bp.combined_output,
                    });
                }
                reverted.insert(task.num);
                failure_context = Some(format!(
                    "Your previous attempt at task #{num} did not pass validation.\n\
                     The backpressure command `{cmd}` failed with:\n{output}",
                    num = task.num,
                    cmd = task.backpressure,
                    output = bp.combined_output,
                ));
                continue;
            }

            reverted.remove(&task.num);
            bp_attempts.remove(&task.num);
            failure_context = None;

            self.phase = RalphPhase::Commit;
            let message = format!(
                "feat({unit}): complete task #{num} - {title}",
                unit = self.unit_id,
                num = task.num,
                title = task.title,
            );
            self.delegate
                .commit(
                    cancel,
                    &self.unit_id,
                    &self.workdir,
                    &format!("#{} - {}", task.num, task.title),
                    &message,
                )
                .await?;

            tasks_completed += 1;
            self.events
                .emit(
                    WireEvent::new(EventType::TaskCompleted)
                        .with_unit(&self.unit_id)
                        .with_task(task.num)
                        .with_payload(&TaskPayload {
                            unit: self.unit_id.clone(),
                            task: task.num,
                        }),
                )
                .await;
            info!(unit = %self.unit_id, task = task.num, "task completed");
        }
    }

    async fn baseline_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.config.baseline_checks.is_empty() {
            return Ok(());
        }

        let timeout = Duration::from_secs(self.config.baseline_timeout_sec);
        let mut fix_attempts: u32 = 0;

        loop {
            self.phase = RalphPhase::BaselineChecks;
            self.events
                .emit(WireEvent::new(EventType::BaselineStarted).with_unit(&self.unit_id))
                .await;
            let result = baseline::run(cancel, &self.config.baseline_checks, &self.workdir, timeout)
                .await
                .map_err(|e| match e {
                    BackpressureError::Cancelled => RalphError::Cancelled,
                    BackpressureError::Io(io) => RalphError::BaselineExhausted {
                        attempts: fix_attempts,
                        output: io.to_string(),
                    },
                })?;

            if result.all_passed {
                return Ok(());
            }

            fix_attempts += 1;
            self.events
                .emit(
                    WireEvent::new(EventType::BaselineFailed)
                        .with_unit(&self.unit_id)
                        .with_payload(&BaselineFailedPayload {
                            unit: self.unit_id.clone(),
                            attempt: fix_attempts,
                            output: result.failure_output.clone(),
                        }),
                )
                .await;

            if fix_attempts > self.config.max_baseline_retries {
                return Err(RalphError::BaselineExhausted {
                    attempts: fix_attempts - 1,
                    output: result.failure_output,
                });
            }

            self.phase = RalphPhase::BaselineFix;
            let prompt = self.baseline_fix_prompt(&result.failure_output);
            match self.invoke_agent(cancel, &prompt).await {
                Ok(()) => {}
                Err(AgentError::Cancelled) => return Err(RalphError::Cancelled),
                Err(e) => {
                    warn!(unit = %self.unit_id, error = %e, "baseline fix invocation failed");
                    continue;
                }
            }

            self.phase = RalphPhase::Commit;
            self.delegate
                .commit(
                    cancel,
                    &self.unit_id,
                    &self.workdir,
                    "baseline fixes",
                    &format!("fix({}): repair baseline checks", self.unit_id),
                )
                .await?;
        }
    }

    async fn publish(&mut self, cancel: &CancellationToken) -> Result<Option<String>> {
        if self.config.no_pr {
            debug!(unit = %self.unit_id, "no_pr set, skipping push and PR");
            return Ok(None);
        }

        self.delegate
            .push(cancel, &self.unit_id, &self.workdir, &self.branch)
            .await?;
        self.events
            .emit(
                WireEvent::new(EventType::BranchPushed)
                    .with_unit(&self.unit_id)
                    .with_payload(&BranchPushedPayload {
                        unit: self.unit_id.clone(),
                        branch: self.branch.clone(),
                    }),
            )
            .await;

        self.phase = RalphPhase::PrCreation;
        let title = format!("{}: {}", self.unit_id, self.branch);
        let body = format!(
            "Automated implementation of unit `{}` ({} tasks).",
            self.unit_id,
            self.slots.len()
        );
        let url = self
            .delegate
            .create_pr(
                cancel,
                &self.unit_id,
                &self.workdir,
                &self.branch,
                &self.config.target_branch,
                &title,
                &body,
            )
            .await?;

        let pr = delegate::pr_number(&url);
        let mut event = WireEvent::new(EventType::PrCreated)
            .with_unit(&self.unit_id)
            .with_payload(&PrCreatedPayload {
                unit: self.unit_id.clone(),
                url: url.clone(),
                pr: pr.unwrap_or(0),
            });
        if let Some(pr) = pr {
            event = event.with_pr(pr);
        }
        self.events.emit(event).await;
        info!(unit = %self.unit_id, url = %url, "pull request created");

        Ok(Some(url))
    }

    async fn invoke_agent(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> std::result::Result<(), AgentError> {
        if self.config.stream_agent_events {
            self.agent
                .invoke_streaming(cancel, prompt, &self.workdir, &self.unit_id, self.events.bus())
                .await
        } else {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let result = self
                .agent
                .invoke(cancel, prompt, &self.workdir, &mut stdout, &mut stderr)
                .await;
            if result.is_err() {
                debug!(
                    unit = %self.unit_id,
                    stdout = %String::from_utf8_lossy(&stdout),
                    stderr = %String::from_utf8_lossy(&stderr),
                    "agent output on failure"
                );
            }
            result
        }
    }

    /// Re-read every task from the worktree, applying in-memory reverts.
    fn read_task_states(&self, reverted: &BTreeSet<u32>) -> Result<Vec<TaskState>> {
        let mut states = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let path = self.workdir.join(&slot.rel_path);
            let state = read_task_state(slot, &path, reverted)?;
            states.push(state);
        }
        Ok(states)
    }

    /// First ready task whose on-disk status is now complete.
    fn detect_completed(&self, ready_nums: &[u32]) -> Result<Option<TaskState>> {
        let none = BTreeSet::new();
        for slot in &self.slots {
            if !ready_nums.contains(&slot.num) {
                continue;
            }
            let path = self.workdir.join(&slot.rel_path);
            let state = read_task_state(slot, &path, &none)?;
            if state.disk_status == TaskStatus::Complete {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    fn task_prompt(&self, ready: &[&TaskState], failure_context: Option<&str>) -> String {
        let mut prompt = format!(
            "You are implementing the unit \"{}\" in this git worktree.\n\
             The following tasks are ready (all their dependencies are complete):\n\n",
            self.unit_id
        );
        for task in ready {
            prompt.push_str(&format!(
                "- Task #{}: {} (spec: {})\n",
                task.num,
                task.title,
                task.rel_path.display()
            ));
        }
        prompt.push_str(
            "\nPick exactly ONE ready task. Read its spec file, implement only what it \
             describes, and run its declared backpressure command until it passes. \
             When the task is done, set `status: complete` in that task file's \
             front-matter. Do not start any other task. Do not commit or push.\n",
        );
        if let Some(context) = failure_context {
            prompt.push('\n');
            prompt.push_str(context);
            prompt.push('\n');
        }
        prompt
    }

    fn baseline_fix_prompt(&self, failure_output: &str) -> String {
        let mut prompt = format!(
            "All tasks in unit \"{}\" are complete, but the repo-wide baseline \
             checks failed.\n\nChecks:\n",
            self.unit_id
        );
        for check in &self.config.baseline_checks {
            prompt.push_str(&format!("- {}: `{}`\n", check.name, check.command));
        }
        prompt.push_str(&format!(
            "\nFailure output:\n{failure_output}\n\
             Apply the minimal fixes needed to make these checks pass. Do not \
             refactor unrelated code. Do not commit; the orchestrator commits.\n"
        ));
        prompt
    }
}

fn read_task_state(slot: &TaskSlot, path: &Path, reverted: &BTreeSet<u32>) -> Result<TaskState> {
    let content = std::fs::read_to_string(path).map_err(|e| RalphError::TaskFile {
        path: slot.rel_path.clone(),
        message: e.to_string(),
    })?;
    let (meta, _) = frontmatter::parse_task(&content).map_err(|e| RalphError::TaskFile {
        path: slot.rel_path.clone(),
        message: e.to_string(),
    })?;

    let effective_status = if reverted.contains(&slot.num) {
        TaskStatus::Pending
    } else {
        meta.status
    };

    Ok(TaskState {
        num: slot.num,
        title: slot.title.clone(),
        rel_path: slot.rel_path.clone(),
        backpressure: meta.backpressure,
        depends_on: meta.depends_on,
        disk_status: meta.status,
        effective_status,
    })
}

/// Pending tasks whose every dependency is effectively complete.
fn select_ready(states: &[TaskState]) -> Vec<&TaskState> {
    let complete: BTreeSet<u32> = states
        .iter()
        .filter(|t| t.effective_status == TaskStatus::Complete)
        .map(|t| t.num)
        .collect();

    states
        .iter()
        .filter(|t| t.effective_status == TaskStatus::Pending)
        .filter(|t| t.depends_on.iter().all(|d| complete.contains(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentKind;
    use crate::bus::EventBus;
    use crate::discovery;
    use crate::escalation::RecordingEscalator;
    use crate::retry::RetryPolicy;
    use crate::storage::Storage;
    use choo_core::types::{Run, RunId, RunStatus};
    use chrono::Utc;
    use std::process::Command;
    use tempfile::TempDir;

    /// The standard stub agent: commits when asked to commit, otherwise
    /// marks the first pending task complete (sorted path order).
    const STUB_AGENT: &str = r#"#!/bin/sh
prompt=$(cat)
case "$prompt" in
  *"git add -A"*)
    git add -A >/dev/null 2>&1
    git commit -q --allow-empty -m "agent work" >/dev/null 2>&1
    ;;
  *"baseline"*)
    touch fixed.txt
    ;;
  *)
    f=$(grep -rl 'status: pending' tasks 2>/dev/null | sort | head -1)
    [ -n "$f" ] && sed -i 's/status: pending/status: complete/' "$f"
    ;;
esac
exit 0
"#;

    struct Fixture {
        repo: TempDir,
        storage: Arc<Storage>,
        run_id: RunId,
        config: Arc<Config>,
        agent: AgentCommand,
        escalator: Arc<RecordingEscalator>,
    }

    fn git(repo: &Path, args: &[&str]) {
        Command::new("git").args(args).current_dir(repo).output().unwrap();
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn task_file(num: u32, status: &str, backpressure: &str, deps: &[u32]) -> String {
        let deps_line = if deps.is_empty() {
            String::new()
        } else {
            format!(
                "depends_on: [{}]\n",
                deps.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
            )
        };
        format!(
            "---\ntask: {num}\nstatus: {status}\nbackpressure: \"{backpressure}\"\n{deps_line}---\n# Task {num}\n"
        )
    }

    async fn fixture(agent_script: &str, mutate_config: impl FnOnce(&mut Config)) -> Fixture {
        let repo = TempDir::new().unwrap();
        git(repo.path(), &["init", "-b", "main"]);
        git(repo.path(), &["config", "user.email", "t@t.com"]);
        git(repo.path(), &["config", "user.name", "T"]);

        write(
            repo.path(),
            "tasks/alpha/IMPLEMENTATION_PLAN.md",
            "---\nunit: alpha\n---\n# alpha\n",
        );

        let script = repo.path().join("stub-agent.sh");
        std::fs::write(&script, agent_script).unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let storage = Storage::in_memory().await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let now = Utc::now();
        let run = Run {
            id: RunId::new(),
            feature_branch: "feat/test".to_string(),
            repo_path: repo.path().to_string_lossy().into_owned(),
            target_branch: "main".to_string(),
            tasks_dir: "tasks".to_string(),
            parallelism: 1,
            status: RunStatus::Running,
            daemon_version: "test".to_string(),
            config_json: None,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        storage.create_run(&run).await.unwrap();

        let mut config = Config::default();
        config.no_pr = true;
        config.backpressure_timeout_sec = 30;
        config.baseline_timeout_sec = 30;
        mutate_config(&mut config);

        Fixture {
            agent: AgentCommand {
                kind: AgentKind::Stdin,
                program: script.to_string_lossy().into_owned(),
                model: None,
            },
            repo,
            storage: Arc::new(storage),
            run_id: run.id,
            config: Arc::new(config),
            escalator: Arc::new(RecordingEscalator::default()),
        }
    }

    fn commit_all(repo: &Path, message: &str) {
        git(repo, &["add", "-A"]);
        git(repo, &["commit", "-q", "-m", message]);
    }

    fn ralph_for(fx: &Fixture) -> (RalphLoop, EventBus) {
        let discovery = discovery::discover(fx.repo.path(), Path::new("tasks")).unwrap();
        assert!(discovery.errors.is_empty(), "{:?}", discovery.errors);
        let unit = discovery.unit("alpha").unwrap();

        let bus = EventBus::new(64);
        let events = RunEvents::new(Arc::clone(&fx.storage), bus.clone(), fx.run_id.clone());
        let escalator_concrete = Arc::clone(&fx.escalator);
        let escalator: Arc<dyn crate::escalation::Escalator> = escalator_concrete;
        let delegate = GitDelegate::new(fx.agent.clone(), escalator)
            .with_policy(RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
                multiplier: 2,
            });
        let ralph = RalphLoop::new(
            unit,
            fx.repo.path(),
            "choo/alpha-abc123",
            fx.agent.clone(),
            delegate,
            events,
            Arc::clone(&fx.config),
        );
        (ralph, bus)
    }

    async fn event_types(fx: &Fixture) -> Vec<String> {
        fx.storage
            .list_events(&fx.run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn single_task_completes_and_commits() {
        let fx = fixture(STUB_AGENT, |_| {}).await;
        write(fx.repo.path(), "tasks/alpha/01-only.md", &task_file(1, "pending", "exit 0", &[]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let outcome = ralph.run(&cancel).await.unwrap();

        assert_eq!(outcome.tasks_completed, 1);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.pr_url.is_none());

        // seed + one task commit
        assert_eq!(crate::git::commit_count(fx.repo.path()).unwrap(), 2);

        let types = event_types(&fx).await;
        let expected = [
            "task.claude.invoke",
            "task.claude.done",
            "task.started",
            "task.completed",
        ];
        assert_eq!(types, expected);
    }

    #[tokio::test]
    async fn dependent_tasks_run_in_order() {
        let fx = fixture(STUB_AGENT, |_| {}).await;
        write(fx.repo.path(), "tasks/alpha/01-first.md", &task_file(1, "pending", "exit 0", &[]));
        write(fx.repo.path(), "tasks/alpha/02-second.md", &task_file(2, "pending", "exit 0", &[1]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let outcome = ralph.run(&cancel).await.unwrap();

        assert_eq!(outcome.tasks_completed, 2);
        assert_eq!(outcome.iterations, 2);

        // Completion events come out in dependency order.
        let events = fx.storage.list_events(&fx.run_id).await.unwrap();
        let completed: Vec<Option<u32>> = events
            .iter()
            .filter(|e| e.event_type == "task.completed")
            .map(|e| {
                e.payload_json
                    .as_deref()
                    .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
                    .and_then(|v| v["task"].as_u64().map(|t| t as u32))
            })
            .collect();
        assert_eq!(completed, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn backpressure_retry_then_success() {
        let fx = fixture(STUB_AGENT, |_| {}).await;
        // Fails the first time, passes once the marker exists.
        write(
            fx.repo.path(),
            "tasks/alpha/01-flaky.md",
            &task_file(1, "pending", "test -f bp-ok || { touch bp-ok; exit 1; }", &[]),
        );
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let outcome = ralph.run(&cancel).await.unwrap();

        assert_eq!(outcome.tasks_completed, 1);
        assert!(outcome.iterations >= 2, "expected a re-invocation, got {}", outcome.iterations);
    }

    #[tokio::test]
    async fn backpressure_exhaustion_fails_unit() {
        let fx = fixture(STUB_AGENT, |c| c.max_claude_retries = 2).await;
        write(
            fx.repo.path(),
            "tasks/alpha/01-broken.md",
            &task_file(1, "pending", "echo always bad; exit 1", &[]),
        );
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let err = ralph.run(&cancel).await.unwrap_err();

        match err {
            RalphError::BackpressureExhausted { task, output, .. } => {
                assert_eq!(task, 1);
                assert!(output.contains("always bad"));
            }
            other => panic!("expected backpressure exhaustion, got {other:?}"),
        }

        let types = event_types(&fx).await;
        assert!(types.contains(&"task.failed".to_string()));
    }

    #[tokio::test]
    async fn agent_making_no_progress_exhausts() {
        // Agent that never touches the task files.
        let fx = fixture("#!/bin/sh\ncat > /dev/null\nexit 0\n", |c| c.max_claude_retries = 2).await;
        write(fx.repo.path(), "tasks/alpha/01-only.md", &task_file(1, "pending", "exit 0", &[]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let err = ralph.run(&cancel).await.unwrap_err();
        assert!(matches!(err, RalphError::AgentExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn failed_dependency_is_task_deadlock() {
        let fx = fixture(STUB_AGENT, |_| {}).await;
        write(fx.repo.path(), "tasks/alpha/01-dead.md", &task_file(1, "failed", "exit 0", &[]));
        write(fx.repo.path(), "tasks/alpha/02-blocked.md", &task_file(2, "pending", "exit 0", &[1]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let err = ralph.run(&cancel).await.unwrap_err();
        assert!(matches!(err, RalphError::TaskDeadlock(ref pending) if pending == &vec![2]));
    }

    #[tokio::test]
    async fn already_complete_unit_exits_immediately() {
        let fx = fixture(STUB_AGENT, |_| {}).await;
        write(fx.repo.path(), "tasks/alpha/01-done.md", &task_file(1, "complete", "exit 0", &[]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let outcome = ralph.run(&cancel).await.unwrap();
        assert_eq!(outcome.tasks_completed, 0);
        assert_eq!(outcome.iterations, 0);
    }

    #[tokio::test]
    async fn baseline_failure_is_fixed_and_committed_once() {
        let fx = fixture(STUB_AGENT, |c| {
            c.baseline_checks = vec![choo_core::config::BaselineCheck {
                name: "marker".to_string(),
                command: "test -f fixed.txt".to_string(),
            }];
        })
        .await;
        write(fx.repo.path(), "tasks/alpha/01-only.md", &task_file(1, "pending", "exit 0", &[]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let outcome = ralph.run(&cancel).await.unwrap();
        assert_eq!(outcome.tasks_completed, 1);

        // seed + task commit + exactly one baseline commit.
        assert_eq!(crate::git::commit_count(fx.repo.path()).unwrap(), 3);
        assert!(fx.repo.path().join("fixed.txt").exists());

        let types = event_types(&fx).await;
        assert!(types.contains(&"baseline.started".to_string()));
        assert!(types.contains(&"baseline.failed".to_string()));
    }

    #[tokio::test]
    async fn baseline_exhaustion_fails_unit() {
        let fx = fixture(STUB_AGENT, |c| {
            c.max_baseline_retries = 1;
            c.baseline_checks = vec![choo_core::config::BaselineCheck {
                name: "impossible".to_string(),
                command: "echo bad fmt; exit 1".to_string(),
            }];
        })
        .await;
        write(fx.repo.path(), "tasks/alpha/01-only.md", &task_file(1, "pending", "exit 0", &[]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        let err = ralph.run(&cancel).await.unwrap_err();
        match err {
            RalphError::BaselineExhausted { output, .. } => {
                assert!(output.contains("=== impossible ==="));
                assert!(output.contains("bad fmt"));
            }
            other => panic!("expected baseline exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_before_start_reports_cancelled() {
        let fx = fixture(STUB_AGENT, |_| {}).await;
        write(fx.repo.path(), "tasks/alpha/01-only.md", &task_file(1, "pending", "exit 0", &[]));
        commit_all(fx.repo.path(), "seed");

        let (mut ralph, _bus) = ralph_for(&fx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ralph.run(&cancel).await.unwrap_err();
        assert!(matches!(err, RalphError::Cancelled));
    }

    #[test]
    fn phase_names_are_stable() {
        assert_eq!(RalphPhase::TaskSelection.as_str(), "task_selection");
        assert_eq!(RalphPhase::ClaudeInvoke.as_str(), "claude_invoke");
        assert_eq!(RalphPhase::BaselineFix.as_str(), "baseline_fix");
        assert_eq!(RalphPhase::PrCreation.as_str(), "pr_creation");
    }
}
