//! Git operations for worktree isolation and delegation proofs.
//!
//! Everything shells out to `git`; stdout/stderr are captured and folded
//! into any returned error so escalations carry the real failure text.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run_git(workdir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}{}",
            args.join(" "),
            stdout.trim(),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Detect the default branch for a repository.
///
/// Tries the remote HEAD first, then local `main`, then `master`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = run_git(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.trim().strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate)? {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo)
        .output()?;
    Ok(output.status.success())
}

/// Check if a branch exists on the `origin` remote.
pub fn remote_branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let listing = run_git(
        repo,
        &["ls-remote", "--heads", "origin", &format!("refs/heads/{branch}")],
    )?;
    Ok(!listing.trim().is_empty())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    run_git(repo, &["branch", branch, base]).map(|_| ())
}

/// Delete a local branch.
pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    run_git(repo, &["branch", "-D", branch]).map(|_| ())
}

/// Number of commits reachable from HEAD; the "before" proof for commit
/// delegation.
pub fn commit_count(workdir: &Path) -> Result<u64> {
    let output = run_git(workdir, &["rev-list", "--count", "HEAD"])?;
    output
        .trim()
        .parse()
        .map_err(|_| GitError::CommandFailed(format!("unparseable commit count: {output}")))
}

/// `true` when the working tree has no uncommitted changes.
pub fn is_working_tree_clean(workdir: &Path) -> Result<bool> {
    let status = run_git(workdir, &["status", "--porcelain"])?;
    Ok(status.trim().is_empty())
}

/// Paths changed since the last commit (staged or not), for commit prompts.
pub fn changed_paths(workdir: &Path) -> Result<Vec<String>> {
    let status = run_git(workdir, &["status", "--porcelain"])?;
    Ok(status
        .lines()
        .filter_map(|line| line.get(3..))
        .map(str::to_string)
        .collect())
}

/// Stage the given paths (or everything with `["-A"]`).
pub fn stage(workdir: &Path, paths: &[&str]) -> Result<()> {
    let mut args = vec!["add"];
    args.extend_from_slice(paths);
    run_git(workdir, &args).map(|_| ())
}

/// Commit staged changes.
pub fn commit(workdir: &Path, message: &str) -> Result<()> {
    run_git(workdir, &["commit", "-m", message]).map(|_| ())
}

/// Push a branch to origin with upstream tracking.
pub fn push(workdir: &Path, branch: &str) -> Result<()> {
    run_git(workdir, &["push", "--set-upstream", "origin", branch]).map(|_| ())
}

/// Create a git worktree at `worktree_path` for `branch`, creating the
/// branch from `base` first if it does not exist.
pub fn create_worktree(repo: &Path, worktree_path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("failed to create parent directory: {e}")))?;
    }

    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, base)?;
    }

    run_git(
        repo,
        &[
            "worktree",
            "add",
            worktree_path.to_string_lossy().as_ref(),
            branch,
        ],
    )
    .map(|_| ())
}

/// Remove a git worktree; `force` discards local changes.
pub fn remove_worktree(repo: &Path, worktree_path: &Path, force: bool) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(path.as_ref());
    run_git(repo, &args).map(|_| ())
}

/// Drop stale worktree registrations whose directories are gone.
pub fn prune_worktrees(repo: &Path) -> Result<()> {
    run_git(repo, &["worktree", "prune"]).map(|_| ())
}

/// Information about a registered git worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

/// List all git worktrees for a repository.
pub fn list_worktrees(repo: &Path) -> Result<Vec<WorktreeInfo>> {
    let stdout = run_git(repo, &["worktree", "list", "--porcelain"])?;

    let mut worktrees = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    commit,
                    branch: current_branch.take(),
                });
            }
            current_path = Some(path.to_string());
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo {
            path,
            commit,
            branch: current_branch,
        });
    }

    Ok(worktrees)
}
