//! Worktree lifecycle for unit isolation.
//!
//! Each worker gets its own worktree under `worktree_base`, on a branch
//! named `<prefix>/<unit-id>-<6-hex>` created off the target branch. Paths
//! never overlap between workers; orphans left by a crash are collected on
//! the next run for the same unit id.

use crate::git::{self, GitError};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("worktree base is not usable: {0}")]
    BadBase(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// A created worktree: branch plus checkout path.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub unit_id: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Manages worktrees for one repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo: PathBuf,
    base: PathBuf,
    branch_prefix: String,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>, base: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            base: base.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Branch name for a unit: `<prefix>/<unit-id>-<6-hex>` where the hex is
    /// a short hash over the unit id and the current time.
    pub fn branch_name(&self, unit_id: &str) -> String {
        let suffix = short_hash(unit_id, Utc::now().timestamp_millis());
        format!("{}/{}-{}", self.branch_prefix, sanitize(unit_id), suffix)
    }

    fn worktree_path(&self, unit_id: &str) -> PathBuf {
        self.base.join(sanitize(unit_id))
    }

    /// Create a worktree for a unit off `target_branch`, on a fresh branch.
    ///
    /// Any orphan worktree left at the unit's path by a previous crashed run
    /// is removed first.
    pub fn create(&self, unit_id: &str, target_branch: &str) -> Result<Worktree> {
        let branch = self.branch_name(unit_id);
        self.create_on_branch(unit_id, &branch, target_branch)
    }

    /// Create a worktree on an existing unit branch, used when re-entering a
    /// unit after a restart: committed agent work on that branch survives.
    pub fn create_on_branch(
        &self,
        unit_id: &str,
        branch: &str,
        target_branch: &str,
    ) -> Result<Worktree> {
        let path = self.worktree_path(unit_id);
        self.collect_orphan(&path)?;

        git::create_worktree(&self.repo, &path, branch, target_branch)?;
        debug!(unit = unit_id, branch = %branch, path = %path.display(), "worktree created");

        Ok(Worktree {
            unit_id: unit_id.to_string(),
            branch: branch.to_string(),
            path,
        })
    }

    /// Remove a worktree, optionally deleting its local branch.
    ///
    /// Removal is forced: agent scratch files must not keep a finished unit's
    /// worktree on disk.
    pub fn remove(&self, worktree: &Worktree, delete_branch: bool) -> Result<()> {
        git::remove_worktree(&self.repo, &worktree.path, true)?;
        if delete_branch {
            if let Err(e) = git::delete_branch(&self.repo, &worktree.branch) {
                warn!(branch = %worktree.branch, error = %e, "failed to delete unit branch");
            }
        }
        Ok(())
    }

    /// List worktrees registered for the repository.
    pub fn list(&self) -> Result<Vec<git::WorktreeInfo>> {
        Ok(git::list_worktrees(&self.repo)?)
    }

    /// Remove whatever occupies `path` from a previous run.
    fn collect_orphan(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            git::prune_worktrees(&self.repo)?;
            return Ok(());
        }
        warn!(path = %path.display(), "collecting orphan worktree");
        if let Err(e) = git::remove_worktree(&self.repo, path, true) {
            // Not a registered worktree; clear the directory directly.
            debug!(error = %e, "orphan not registered with git, removing directory");
            std::fs::remove_dir_all(path)
                .map_err(|e| WorktreeError::BadBase(format!("{}: {e}", path.display())))?;
            git::prune_worktrees(&self.repo)?;
        }
        Ok(())
    }
}

fn sanitize(unit_id: &str) -> String {
    unit_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn short_hash(unit_id: &str, now_millis: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unit_id.as_bytes());
    hasher.update(now_millis.to_le_bytes());
    let digest = hasher.finalize();
    digest[..3].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::setup_test_repo;

    fn manager_for(dir: &tempfile::TempDir) -> WorktreeManager {
        let base = dir
            .path()
            .parent()
            .unwrap()
            .join(format!(
                "wt-base-{}",
                dir.path().file_name().unwrap().to_string_lossy()
            ));
        WorktreeManager::new(dir.path(), base, "choo")
    }

    #[test]
    fn branch_name_has_prefix_unit_and_hex() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);
        let branch = manager.branch_name("storage");
        let rest = branch.strip_prefix("choo/storage-").unwrap();
        assert_eq!(rest.len(), 6);
        assert!(rest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn branch_name_sanitizes_unit_id() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);
        let branch = manager.branch_name("api/v2 client");
        assert!(branch.starts_with("choo/api-v2-client-"));
    }

    #[test]
    fn create_and_remove_worktree() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);

        let worktree = manager.create("alpha", "main").unwrap();
        assert!(worktree.path.exists());
        assert!(git::branch_exists(dir.path(), &worktree.branch).unwrap());

        manager.remove(&worktree, true).unwrap();
        assert!(!worktree.path.exists());
        assert!(!git::branch_exists(dir.path(), &worktree.branch).unwrap());
    }

    #[test]
    fn paths_do_not_overlap_between_units() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);

        let a = manager.create("alpha", "main").unwrap();
        let b = manager.create("beta", "main").unwrap();
        assert_ne!(a.path, b.path);

        manager.remove(&a, false).unwrap();
        manager.remove(&b, false).unwrap();
    }

    #[test]
    fn orphan_worktree_collected_on_recreate() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);

        // Simulate a crash: the worktree survives, nobody removed it.
        let orphan = manager.create("alpha", "main").unwrap();
        assert!(orphan.path.exists());

        let fresh = manager.create("alpha", "main").unwrap();
        assert!(fresh.path.exists());
        assert_ne!(orphan.branch, fresh.branch);

        manager.remove(&fresh, false).unwrap();
    }

    #[test]
    fn create_on_branch_reenters_existing_branch() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);

        let first = manager.create("alpha", "main").unwrap();
        // Commit some work on the unit branch, then lose the worktree.
        std::fs::write(first.path.join("work.txt"), "progress").unwrap();
        git::stage(&first.path, &["-A"]).unwrap();
        git::commit(&first.path, "wip").unwrap();
        manager.remove(&first, false).unwrap();

        let resumed = manager
            .create_on_branch("alpha", &first.branch, "main")
            .unwrap();
        assert_eq!(resumed.branch, first.branch);
        assert!(resumed.path.join("work.txt").exists());

        manager.remove(&resumed, true).unwrap();
    }

    #[test]
    fn stale_directory_without_registration_collected() {
        let dir = setup_test_repo();
        let manager = manager_for(&dir);

        let path = manager.worktree_path("alpha");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("junk.txt"), "junk").unwrap();

        let worktree = manager.create("alpha", "main").unwrap();
        assert!(worktree.path.exists());
        assert!(!worktree.path.join("junk.txt").exists());

        manager.remove(&worktree, false).unwrap();
    }
}
