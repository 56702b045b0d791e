//! Git delegation: commit, push, and PR creation performed by the agent.
//!
//! Rather than running `git commit`/`git push`/`gh pr create` directly, the
//! orchestrator prompts the agent to do it in the worktree and then verifies
//! the side effect actually happened:
//!
//! 1. snapshot a "before" proof (commit count / remote-branch presence / none)
//! 2. build the operation prompt
//! 3. wrap the invocation in the retry core
//! 4. verify after each invocation (new commit on HEAD, branch on remote,
//!    or a PR URL in the agent's output)
//! 5. on exhaustion, emit a blocking escalation and return the last error

use crate::agent::{AgentCommand, AgentError};
use crate::escalation::{Escalation, Escalator};
use crate::git::{self, GitError};
use crate::retry::{retry, RetryError, RetryPolicy};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("verification failed: {0}")]
    VerifyFailed(String),
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: String,
    },
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DelegateError>;

/// Delegates git side effects to the agent, with verification and
/// escalation.
pub struct GitDelegate {
    agent: AgentCommand,
    escalator: Arc<dyn Escalator>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for GitDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitDelegate")
            .field("agent", &self.agent)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl GitDelegate {
    pub fn new(agent: AgentCommand, escalator: Arc<dyn Escalator>) -> Self {
        Self {
            agent,
            escalator,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ask the agent to commit the current changes, verified by a new commit
    /// appearing on HEAD.
    pub async fn commit(
        &self,
        cancel: &CancellationToken,
        unit: &str,
        workdir: &Path,
        title: &str,
        message: &str,
    ) -> Result<()> {
        let before = git::commit_count(workdir)?;
        let files = git::changed_paths(workdir)?;
        let prompt = commit_prompt(title, message, &files);

        let outcome = retry(cancel, &self.policy, |attempt| {
            let prompt = prompt.clone();
            async move {
                debug!(unit, attempt, "delegating commit to agent");
                self.agent
                    .invoke_capture(cancel, &prompt, workdir)
                    .await
                    .map_err(DelegateError::Agent)?;
                let after = git::commit_count(workdir)?;
                if after > before {
                    Ok(())
                } else {
                    Err(DelegateError::VerifyFailed(format!(
                        "no new commit on HEAD (count still {after})"
                    )))
                }
            }
        })
        .await;

        self.finish(outcome, "commit", unit, workdir).map(|_| ())
    }

    /// Ask the agent to push the unit branch, verified against the remote.
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        unit: &str,
        workdir: &Path,
        branch: &str,
    ) -> Result<()> {
        let prompt = push_prompt(branch);

        let outcome = retry(cancel, &self.policy, |attempt| {
            let prompt = prompt.clone();
            async move {
                debug!(unit, attempt, branch, "delegating push to agent");
                self.agent
                    .invoke_capture(cancel, &prompt, workdir)
                    .await
                    .map_err(DelegateError::Agent)?;
                if git::remote_branch_exists(workdir, branch)? {
                    Ok(())
                } else {
                    Err(DelegateError::VerifyFailed(format!(
                        "branch {branch} not present on origin"
                    )))
                }
            }
        })
        .await;

        self.finish(outcome, "push", unit, workdir)?;
        info!(unit, branch, "branch pushed");
        Ok(())
    }

    /// Ask the agent to open a PR, verified by a PR URL in its output.
    /// Returns the extracted URL.
    pub async fn create_pr(
        &self,
        cancel: &CancellationToken,
        unit: &str,
        workdir: &Path,
        branch: &str,
        target: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let prompt = pr_prompt(branch, target, title, body);

        let outcome = retry(cancel, &self.policy, |attempt| {
            let prompt = prompt.clone();
            async move {
                debug!(unit, attempt, branch, "delegating PR creation to agent");
                let output = self
                    .agent
                    .invoke_capture(cancel, &prompt, workdir)
                    .await
                    .map_err(DelegateError::Agent)?;
                extract_pr_url(&output).map(str::to_string).ok_or_else(|| {
                    DelegateError::VerifyFailed("no PR URL in agent output".to_string())
                })
            }
        })
        .await;

        self.finish(outcome, "pr", unit, workdir)
    }

    /// Map a retry outcome, escalating on exhaustion. Never escalates on
    /// success.
    fn finish<T>(
        &self,
        outcome: std::result::Result<crate::retry::Retried<T>, RetryError<DelegateError>>,
        operation: &'static str,
        unit: &str,
        workdir: &Path,
    ) -> Result<T> {
        match outcome {
            Ok(retried) => Ok(retried.value),
            Err(RetryError::Cancelled { .. }) => Err(DelegateError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                let escalation = Escalation::blocking(
                    unit,
                    format!("git {operation} delegation failed"),
                    last.to_string(),
                )
                .with_context("operation", operation)
                .with_context("attempts", attempts.to_string())
                .with_context("workdir", workdir.display().to_string());
                self.escalator.escalate(escalation);
                Err(DelegateError::Exhausted {
                    operation,
                    attempts,
                    last: last.to_string(),
                })
            }
        }
    }
}

fn commit_prompt(title: &str, message: &str, files: &[String]) -> String {
    let file_list = if files.is_empty() {
        "(run `git status` to see them)".to_string()
    } else {
        files.join("\n")
    };
    format!(
        "Task {title} is complete. Run `git add -A`, then create a single commit \
         with the conventional-commit message:\n\n{message}\n\nFiles changed:\n{file_list}\n\n\
         Do not push."
    )
}

fn push_prompt(branch: &str) -> String {
    format!(
        "Push the branch `{branch}` to origin with upstream tracking:\n\
         `git push --set-upstream origin {branch}`"
    )
}

fn pr_prompt(branch: &str, target: &str, title: &str, body: &str) -> String {
    format!(
        "Create a pull request from `{branch}` into `{target}` using:\n\
         `gh pr create --base {target} --head {branch} --title \"{title}\" --body \"{body}\"`\n\
         Print the PR URL."
    )
}

/// First substring matching `https://github.com/<owner>/<repo>/pull/<digits>`.
pub fn extract_pr_url(text: &str) -> Option<&str> {
    const PREFIX: &str = "https://github.com/";
    let mut search_from = 0;

    while let Some(found) = text[search_from..].find(PREFIX) {
        let start = search_from + found;
        if let Some(len) = match_pr_url(&text[start..]) {
            return Some(&text[start..start + len]);
        }
        search_from = start + PREFIX.len();
    }
    None
}

/// Length of a PR URL at the start of `text`, if present.
fn match_pr_url(text: &str) -> Option<usize> {
    const PREFIX: &str = "https://github.com/";
    let rest = text.strip_prefix(PREFIX)?;

    let owner_len = segment_len(rest)?;
    let rest = rest[owner_len..].strip_prefix('/')?;
    let repo_len = segment_len(rest)?;
    let rest = rest[repo_len..].strip_prefix("/pull/")?;

    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }

    Some(PREFIX.len() + owner_len + 1 + repo_len + "/pull/".len() + digits)
}

/// Length of a path segment: non-empty, stops at `/` or whitespace.
fn segment_len(text: &str) -> Option<usize> {
    let len = text
        .chars()
        .take_while(|c| *c != '/' && !c.is_whitespace())
        .map(char::len_utf8)
        .sum();
    if len == 0 {
        None
    } else {
        Some(len)
    }
}

/// PR number from a PR URL's trailing digits.
pub fn pr_number(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentKind;
    use crate::escalation::RecordingEscalator;
    use crate::git::testutil::setup_test_repo;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            multiplier: 2,
        }
    }

    fn script_agent(dir: &Path, script: &str) -> AgentCommand {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("agent.sh");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        AgentCommand {
            kind: AgentKind::Stdin,
            program: path.to_string_lossy().into_owned(),
            model: None,
        }
    }

    fn delegate_with(agent: AgentCommand, escalator: Arc<RecordingEscalator>) -> GitDelegate {
        GitDelegate::new(agent, escalator).with_policy(fast_policy())
    }

    #[tokio::test]
    async fn commit_succeeds_when_agent_commits() {
        let repo = setup_test_repo();
        std::fs::write(repo.path().join("new.txt"), "content").unwrap();

        // The "agent" performs the commit it was asked for.
        let scripts = tempfile::TempDir::new().unwrap();
        let agent = script_agent(
            scripts.path(),
            "#!/bin/sh\ncat > /dev/null\ngit add -A && git commit -q -m 'feat: new file'\n",
        );
        let escalator = Arc::new(RecordingEscalator::default());
        let delegate = delegate_with(agent, Arc::clone(&escalator));

        let cancel = CancellationToken::new();
        delegate
            .commit(&cancel, "alpha", repo.path(), "#1 - new file", "feat(alpha): complete task #1 - new file")
            .await
            .unwrap();

        assert_eq!(git::commit_count(repo.path()).unwrap(), 2);
        assert!(escalator.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_exhaustion_escalates() {
        let repo = setup_test_repo();
        std::fs::write(repo.path().join("new.txt"), "content").unwrap();

        // The agent claims success but commits nothing.
        let scripts = tempfile::TempDir::new().unwrap();
        let agent = script_agent(scripts.path(), "#!/bin/sh\ncat > /dev/null\nexit 0\n");
        let escalator = Arc::new(RecordingEscalator::default());
        let delegate = delegate_with(agent, Arc::clone(&escalator));

        let cancel = CancellationToken::new();
        let err = delegate
            .commit(&cancel, "alpha", repo.path(), "#1", "feat(alpha): task #1")
            .await
            .unwrap_err();

        match err {
            DelegateError::Exhausted {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "commit");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }

        let escalations = escalator.received.lock().unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].unit, "alpha");
        assert_eq!(escalations[0].context.get("attempts").unwrap(), "3");
    }

    #[tokio::test]
    async fn create_pr_returns_extracted_url_and_never_escalates() {
        let repo = setup_test_repo();
        let scripts = tempfile::TempDir::new().unwrap();
        let agent = script_agent(
            scripts.path(),
            "#!/bin/sh\ncat > /dev/null\necho 'Opened https://github.com/acme/widgets/pull/17 for review'\n",
        );
        let escalator = Arc::new(RecordingEscalator::default());
        let delegate = delegate_with(agent, Arc::clone(&escalator));

        let cancel = CancellationToken::new();
        let url = delegate
            .create_pr(&cancel, "alpha", repo.path(), "choo/alpha-123abc", "main", "alpha", "body")
            .await
            .unwrap();

        assert_eq!(url, "https://github.com/acme/widgets/pull/17");
        assert!(escalator.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_pr_without_url_exhausts() {
        let repo = setup_test_repo();
        let scripts = tempfile::TempDir::new().unwrap();
        let agent = script_agent(scripts.path(), "#!/bin/sh\ncat > /dev/null\necho no url here\n");
        let escalator = Arc::new(RecordingEscalator::default());
        let delegate = delegate_with(agent, Arc::clone(&escalator));

        let cancel = CancellationToken::new();
        let err = delegate
            .create_pr(&cancel, "alpha", repo.path(), "b", "main", "t", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, DelegateError::Exhausted { operation: "pr", .. }));
        assert_eq!(escalator.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn extract_pr_url_first_match_wins() {
        let text = "noise https://github.com/a/b/pull/12 and https://github.com/c/d/pull/34";
        assert_eq!(extract_pr_url(text), Some("https://github.com/a/b/pull/12"));
    }

    #[test]
    fn extract_pr_url_stops_at_non_digit() {
        let text = "see https://github.com/acme/repo/pull/991.";
        assert_eq!(
            extract_pr_url(text),
            Some("https://github.com/acme/repo/pull/991")
        );
    }

    #[test]
    fn extract_pr_url_skips_non_pr_github_urls() {
        let text = "clone https://github.com/acme/repo then https://github.com/acme/repo/pull/5";
        assert_eq!(
            extract_pr_url(text),
            Some("https://github.com/acme/repo/pull/5")
        );
    }

    #[test]
    fn extract_pr_url_none_when_absent() {
        assert_eq!(extract_pr_url("no urls at all"), None);
        assert_eq!(extract_pr_url("https://github.com/a/b/pull/"), None);
        assert_eq!(extract_pr_url("https://github.com//b/pull/3"), None);
    }

    #[test]
    fn pr_number_parses_trailing_digits() {
        assert_eq!(pr_number("https://github.com/a/b/pull/42"), Some(42));
        assert_eq!(pr_number("not-a-url"), None);
    }

    #[test]
    fn prompts_carry_operation_details() {
        let commit = commit_prompt("#2 - parser", "feat(core): complete task #2 - parser", &["src/parser.rs".to_string()]);
        assert!(commit.contains("git add -A"));
        assert!(commit.contains("src/parser.rs"));
        assert!(commit.contains("Do not push"));

        let push = push_prompt("choo/core-1a2b3c");
        assert!(push.contains("--set-upstream origin choo/core-1a2b3c"));

        let pr = pr_prompt("choo/core-1a2b3c", "main", "core unit", "details");
        assert!(pr.contains("gh pr create"));
        assert!(pr.contains("--base main"));
    }
}
