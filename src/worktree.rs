//! Git worktree isolation per task.
//!
//! Each task gets exactly one worktree under the worktrees root, checked
//! out on a branch derived deterministically from the task id
//! (`overseer/task/{id}`). Creation is idempotent so a crashed flow can
//! re-invoke it after partial failure; deletion deregisters the worktree
//! from the repository even when the directory was removed externally.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, Repository};

use crate::error::{Error, Result};
use crate::task::TaskId;
use crate::{olog_debug, olog_warn};

/// Branch name prefix for task worktrees.
const BRANCH_PREFIX: &str = "overseer/task";

/// A task's worktree as reported by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch_name: String,
    /// Filled by the enriched listing; `false` otherwise.
    pub is_dirty: bool,
    /// Filled by the enriched listing; `0` otherwise.
    pub disk_usage_bytes: u64,
}

/// Existence and cleanliness of a task's worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorktreeStatus {
    pub exists: bool,
    pub has_changes: bool,
}

/// Result of a bulk cleanup pass. Per-worktree failures are collected,
/// never propagated.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates and deletes isolated git worktrees and branches per task.
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktrees_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_path: &Path, worktrees_root: &Path) -> Result<Self> {
        olog_debug!(
            "WorktreeManager::new repo={} root={}",
            repo_path.display(),
            worktrees_root.display()
        );
        let _ = Repository::discover(repo_path)?;
        std::fs::create_dir_all(worktrees_root)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_root: worktrees_root.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    /// Deterministic branch name for a task.
    pub fn branch_for(task_id: TaskId) -> String {
        format!("{}/{}", BRANCH_PREFIX, task_id)
    }

    fn worktree_name(task_id: TaskId) -> String {
        task_id.to_string()
    }

    fn worktree_path(&self, task_id: TaskId) -> PathBuf {
        self.worktrees_root.join(Self::worktree_name(task_id))
    }

    /// Degraded-capability probe. Never errors.
    pub fn verify_git_available(&self) -> bool {
        which::which("git").is_ok() || Repository::discover(&self.repo_path).is_ok()
    }

    /// Create the worktree for a task, or return the existing one.
    ///
    /// Idempotent across partial failures: a registered worktree is
    /// returned as-is; a surviving branch with a missing directory is
    /// re-attached rather than treated as a conflict.
    pub fn create_worktree(&self, task_id: TaskId) -> Result<WorktreeInfo> {
        let repo = self.repo()?;
        let name = Self::worktree_name(task_id);
        let path = self.worktree_path(task_id);
        let branch = Self::branch_for(task_id);

        if let Ok(existing) = repo.find_worktree(&name) {
            if existing.path().exists() {
                olog_debug!("Worktree for {} already exists, reusing", task_id.short());
                return Ok(WorktreeInfo {
                    task_id,
                    path: existing.path().to_path_buf(),
                    branch_name: branch,
                    is_dirty: false,
                    disk_usage_bytes: 0,
                });
            }
            // Directory vanished underneath a registered worktree; prune the
            // stale registration and fall through to recreate.
            olog_warn!(
                "Worktree {} registered but directory missing, pruning",
                name
            );
            let _ = existing.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            ));
            self.cleanup_admin_dir(&name);
        }

        let branch_ref = match repo.find_branch(&branch, git2::BranchType::Local) {
            // Partial failure left the branch behind; re-attach to it.
            Ok(existing_branch) => existing_branch.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                let head = repo.head()?;
                let commit = head.peel_to_commit()?;
                olog_debug!("Creating branch {} from commit {}", branch, commit.id());
                repo.branch(&branch, &commit, false)?.into_reference()
            }
            Err(e) => return Err(e.into()),
        };

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(&name, &path, Some(&opts))?;
        olog_debug!(
            "Worktree created for {}: {} on {}",
            task_id.short(),
            path.display(),
            branch
        );

        Ok(WorktreeInfo {
            task_id,
            path,
            branch_name: branch,
            is_dirty: false,
            disk_usage_bytes: 0,
        })
    }

    /// Remove a task's worktree and deregister it from the repository.
    ///
    /// `force=true` discards uncommitted changes; without it a dirty
    /// worktree is refused. Works even when the directory was removed
    /// externally (the admin registration is still pruned). No-op when
    /// nothing is registered.
    pub fn delete_worktree(&self, task_id: TaskId, force: bool, delete_branch: bool) -> Result<()> {
        let repo = self.repo()?;
        let name = Self::worktree_name(task_id);
        let path = self.worktree_path(task_id);

        let registered = repo.find_worktree(&name).is_ok();
        if !registered && !path.exists() {
            olog_debug!("No worktree registered for {}, nothing to delete", task_id.short());
            if delete_branch {
                self.delete_branch(&Self::branch_for(task_id));
            }
            return Ok(());
        }

        if !force && path.exists() && is_dirty(&path) {
            return Err(Error::WorktreeDirty(task_id));
        }

        if let Ok(worktree) = repo.find_worktree(&name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                olog_warn!("Worktree prune failed for '{}': {}", name, e);
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }

        // If the admin dir survives, git still thinks the branch is
        // checked out and branch deletion will fail.
        self.cleanup_admin_dir(&name);

        if delete_branch {
            self.delete_branch(&Self::branch_for(task_id));
        }

        olog_debug!("Worktree removed for {}", task_id.short());
        Ok(())
    }

    /// Clean up the git worktree admin directory (.git/worktrees/<name>).
    fn cleanup_admin_dir(&self, worktree_name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.path().join("worktrees").join(worktree_name);
            if admin_dir.exists() {
                olog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }

    /// Delete a local branch. Tolerant: missing branches and failed
    /// deletions are logged, never errors.
    fn delete_branch(&self, branch: &str) {
        let Ok(repo) = self.repo() else { return };
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    olog_warn!("Failed to delete branch '{}': {}", branch, e);
                } else {
                    olog_debug!("Branch deleted: {}", branch);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => {
                olog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        };
    }

    /// List all managed worktrees (registrations whose name is a task id).
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let repo = self.repo()?;
        let mut infos = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(task_id) = name.parse::<TaskId>() else {
                continue;
            };
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            infos.push(WorktreeInfo {
                task_id,
                path: worktree.path().to_path_buf(),
                branch_name: Self::branch_for(task_id),
                is_dirty: false,
                disk_usage_bytes: 0,
            });
        }
        Ok(infos)
    }

    /// Enriched listing with dirty flag and best-effort disk usage.
    /// Used to detect orphans (worktrees without a matching task record).
    pub fn list_worktrees_enriched(&self) -> Result<Vec<WorktreeInfo>> {
        let mut infos = self.list_worktrees()?;
        for info in &mut infos {
            info.is_dirty = is_dirty(&info.path);
            info.disk_usage_bytes = dir_size(&info.path);
        }
        Ok(infos)
    }

    pub fn get_worktree_status(&self, task_id: TaskId) -> Result<WorktreeStatus> {
        let repo = self.repo()?;
        let name = Self::worktree_name(task_id);
        let exists = repo
            .find_worktree(&name)
            .map(|w| w.path().exists())
            .unwrap_or(false);
        let has_changes = exists && is_dirty(&self.worktree_path(task_id));
        Ok(WorktreeStatus {
            exists,
            has_changes,
        })
    }

    /// Remove every managed worktree. Per-worktree failures go into the
    /// report instead of aborting the sweep.
    pub fn cleanup_all_worktrees(&self, force: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for info in self.list_worktrees()? {
            match self.delete_worktree(info.task_id, force, false) {
                Ok(()) => report.removed.push(info.path),
                Err(e) => report.failed.push((info.path, e.to_string())),
            }
        }
        Ok(report)
    }
}

/// Check a worktree for uncommitted changes (staged or unstaged).
/// Tolerant: unreadable paths count as clean.
fn is_dirty(worktree_path: &Path) -> bool {
    let Ok(repo) = Repository::open(worktree_path) else {
        return false;
    };
    repo.statuses(None)
        .map(|s| !s.is_empty())
        .unwrap_or(false)
}

/// Best-effort recursive size sum. Entries that vanish or fail to stat
/// mid-walk are skipped; no atomic snapshot is attempted.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}
