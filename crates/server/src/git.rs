//! Git runtime: repo discovery, worktree lifecycle, branch operations.
//!
//! Every operation shells out to `git` in argv form — no shell strings are
//! ever built from request input. Branch names are validated before any
//! argv is constructed. Network operations (fetch/pull) are non-fatal and
//! report `{success, output}` instead of erroring.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("invalid branch name: {0}")]
    InvalidBranch(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("git {op} failed: {output}")]
    CommandFailed { op: &'static str, output: String },

    #[error("git {0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Repo facts resolved from a working directory.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub repo_root: String,
    pub default_branch: String,
    pub current_branch: String,
}

/// Session id → worktree mapping. `actual_branch` records the branch the
/// worktree is pinned to, which differs from `branch` when the runtime had
/// to synthesize a derived branch.
#[derive(Debug, Clone)]
pub struct WorktreeMapping {
    pub repo_root: String,
    pub branch: String,
    pub actual_branch: String,
    pub worktree_path: String,
    pub created_at: String,
}

/// Result of a non-fatal network operation.
#[derive(Debug, Clone)]
pub struct NetResult {
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnsureWorktreeOptions {
    pub base_branch: Option<String>,
    pub create_branch: bool,
    pub force_new: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveWorktreeOptions {
    pub force: bool,
    pub branch_to_delete: Option<String>,
}

/// Only `[A-Za-z0-9/_.\-]+` is a legal branch name here.
pub fn validate_branch(branch: &str) -> Result<(), GitError> {
    let ok = !branch.is_empty()
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(GitError::InvalidBranch(branch.to_string()))
    }
}

pub struct GitRuntime {
    mappings: DashMap<String, WorktreeMapping>,
}

impl GitRuntime {
    pub fn new() -> Self {
        Self {
            mappings: DashMap::new(),
        }
    }

    /// Resolve repo root, default branch, and current branch for `path`.
    /// Returns None when the path is not inside a git repository.
    pub async fn repo_info(&self, path: &str) -> Option<RepoInfo> {
        let repo_root = run_git_ok(&["rev-parse", "--show-toplevel"], path).await?;
        let current_branch = run_git_ok(&["rev-parse", "--abbrev-ref", "HEAD"], path).await?;
        let default_branch = self.default_branch(&repo_root).await;
        Some(RepoInfo {
            repo_root,
            default_branch,
            current_branch,
        })
    }

    async fn default_branch(&self, repo_root: &str) -> String {
        if let Some(head) = run_git_ok(
            &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
            repo_root,
        )
        .await
        {
            if let Some(branch) = head.strip_prefix("origin/") {
                return branch.to_string();
            }
        }
        for candidate in ["main", "master"] {
            if run_git(
                &["show-ref", "--verify", &format!("refs/heads/{candidate}")],
                repo_root,
            )
            .await
            .map(|o| o.success)
            .unwrap_or(false)
            {
                return candidate.to_string();
            }
        }
        "main".to_string()
    }

    /// Create (or reuse) a worktree for `branch` off `repo_root`.
    pub async fn ensure_worktree(
        &self,
        repo_root: &str,
        branch: &str,
        opts: &EnsureWorktreeOptions,
    ) -> Result<(String, String), GitError> {
        validate_branch(branch)?;
        if let Some(ref base) = opts.base_branch {
            validate_branch(base)?;
        }

        let repo_name = Path::new(repo_root)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let slug = branch.replace('/', "-");
        let worktrees_dir = Path::new(repo_root)
            .parent()
            .unwrap_or(Path::new("/tmp"))
            .join(format!("{repo_name}-worktrees"));
        std::fs::create_dir_all(&worktrees_dir)?;

        let mut worktree_path = worktrees_dir.join(&slug);
        if opts.force_new {
            let suffix = &companion_protocol::new_id()[..8];
            worktree_path = worktrees_dir.join(format!("{slug}-{suffix}"));
        }
        let path_str = worktree_path.to_string_lossy().to_string();

        // A branch can only be checked out in one worktree; derive a new
        // name when the requested branch is already pinned elsewhere.
        let branch_in_use = run_git(&["worktree", "list", "--porcelain"], repo_root)
            .await
            .map(|o| o.stdout.contains(&format!("branch refs/heads/{branch}")))
            .unwrap_or(false);

        let actual_branch = if opts.create_branch {
            let base = opts
                .base_branch
                .clone()
                .unwrap_or_else(|| self_default(repo_root));
            let out = run_git(
                &["worktree", "add", "-b", branch, &path_str, &base],
                repo_root,
            )
            .await?;
            if out.success {
                branch.to_string()
            } else {
                // Branch already exists — derive a companion branch off it.
                let derived = format!("{branch}-wt-{}", &companion_protocol::new_id()[..6]);
                let out = run_git(
                    &["worktree", "add", "-b", &derived, &path_str, branch],
                    repo_root,
                )
                .await?;
                if !out.success {
                    return Err(GitError::CommandFailed {
                        op: "worktree add",
                        output: out.stdout,
                    });
                }
                derived
            }
        } else if branch_in_use {
            let derived = format!("{branch}-wt-{}", &companion_protocol::new_id()[..6]);
            let out = run_git(
                &["worktree", "add", "-b", &derived, &path_str, branch],
                repo_root,
            )
            .await?;
            if !out.success {
                return Err(GitError::CommandFailed {
                    op: "worktree add",
                    output: out.stdout,
                });
            }
            derived
        } else {
            let out = run_git(&["worktree", "add", &path_str, branch], repo_root).await?;
            if !out.success {
                return Err(GitError::CommandFailed {
                    op: "worktree add",
                    output: out.stdout,
                });
            }
            branch.to_string()
        };

        info!(
            component = "git",
            event = "git.worktree.created",
            repo_root = %repo_root,
            branch = %branch,
            actual_branch = %actual_branch,
            path = %path_str,
            "Worktree ready"
        );
        Ok((path_str, actual_branch))
    }

    /// Record a session's worktree mapping.
    pub fn record_mapping(&self, session_id: &str, mapping: WorktreeMapping) {
        self.mappings.insert(session_id.to_string(), mapping);
    }

    pub fn mapping_for_session(&self, session_id: &str) -> Option<WorktreeMapping> {
        self.mappings.get(session_id).map(|m| m.clone())
    }

    /// Non-fatal fetch.
    pub async fn fetch(&self, repo_root: &str) -> NetResult {
        net_op(&["fetch", "--all", "--prune"], repo_root, "fetch").await
    }

    /// Non-fatal pull.
    pub async fn pull(&self, repo_root: &str) -> NetResult {
        net_op(&["pull", "--ff-only"], repo_root, "pull").await
    }

    /// Check out `branch`, creating it off `default_branch` when asked.
    /// Fails only when both the checkout and creation paths fail.
    pub async fn checkout_or_create_branch(
        &self,
        repo_root: &str,
        branch: &str,
        create_branch: bool,
        default_branch: &str,
    ) -> Result<(), GitError> {
        validate_branch(branch)?;
        let checkout = run_git(&["checkout", branch], repo_root).await?;
        if checkout.success {
            return Ok(());
        }
        if !create_branch {
            return Err(GitError::CommandFailed {
                op: "checkout",
                output: checkout.stdout,
            });
        }
        let create = run_git(&["checkout", "-b", branch, default_branch], repo_root).await?;
        if create.success {
            Ok(())
        } else {
            Err(GitError::CommandFailed {
                op: "checkout -b",
                output: create.stdout,
            })
        }
    }

    /// Uncommitted changes (tracked or untracked) in the worktree?
    pub async fn is_worktree_dirty(&self, path: &str) -> bool {
        run_git(&["status", "--porcelain"], path)
            .await
            .map(|o| o.success && !o.stdout.trim().is_empty())
            .unwrap_or(false)
    }

    /// Remove a worktree. Dirty without `force` → `Ok(false)`.
    /// Companion-derived branches are deleted after successful removal.
    pub async fn remove_worktree(
        &self,
        repo_root: &str,
        path: &str,
        opts: &RemoveWorktreeOptions,
    ) -> Result<bool, GitError> {
        if !opts.force && self.is_worktree_dirty(path).await {
            warn!(
                component = "git",
                event = "git.worktree.dirty",
                path = %path,
                "Refusing to remove dirty worktree without force"
            );
            return Ok(false);
        }

        let mut args = vec!["worktree", "remove"];
        if opts.force {
            args.push("--force");
        }
        args.push(path);
        let out = run_git(&args, repo_root).await?;
        if !out.success {
            return Err(GitError::CommandFailed {
                op: "worktree remove",
                output: out.stdout,
            });
        }

        if let Some(ref branch) = opts.branch_to_delete {
            validate_branch(branch)?;
            let del = run_git(&["branch", "-D", branch], repo_root).await?;
            if !del.success {
                warn!(
                    component = "git",
                    event = "git.branch.delete_failed",
                    branch = %branch,
                    output = %del.stdout,
                    "Could not delete derived branch"
                );
            }
        }
        Ok(true)
    }

    /// Remove a session's worktree per its mapping. The derived branch is
    /// deleted only when it differs from the requested branch — the runtime
    /// never deletes a user-chosen branch.
    pub async fn remove_by_session(&self, session_id: &str, force: bool) -> Result<bool, GitError> {
        let Some((_, mapping)) = self.mappings.remove(session_id) else {
            return Ok(true);
        };
        let branch_to_delete = if mapping.actual_branch != mapping.branch {
            Some(mapping.actual_branch.clone())
        } else {
            None
        };
        let removed = self
            .remove_worktree(
                &mapping.repo_root,
                &mapping.worktree_path,
                &RemoveWorktreeOptions {
                    force,
                    branch_to_delete,
                },
            )
            .await?;
        if !removed {
            // Keep the mapping so a later forced removal still knows the path.
            self.mappings.insert(session_id.to_string(), mapping);
        }
        Ok(removed)
    }

    /// Ahead/behind counts against upstream, if an upstream exists.
    pub async fn ahead_behind(&self, path: &str) -> Option<(u32, u32)> {
        let out = run_git_ok(
            &["rev-list", "--left-right", "--count", "HEAD...@{upstream}"],
            path,
        )
        .await?;
        let mut parts = out.split_whitespace();
        let ahead = parts.next()?.parse().ok()?;
        let behind = parts.next()?.parse().ok()?;
        Some((ahead, behind))
    }
}

fn self_default(_repo_root: &str) -> String {
    // Synchronous fallback used when no base branch was given; the caller
    // resolved repo info earlier so this stays a plain default.
    "main".to_string()
}

struct GitOutput {
    success: bool,
    stdout: String,
}

async fn run_git(args: &[&str], cwd: &str) -> Result<GitOutput, GitError> {
    let child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = tokio::time::timeout(GIT_TIMEOUT, child)
        .await
        .map_err(|_| GitError::Timeout("command"))??;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok(GitOutput {
        success: output.status.success(),
        stdout: text.trim().to_string(),
    })
}

async fn run_git_ok(args: &[&str], cwd: &str) -> Option<String> {
    match run_git(args, cwd).await {
        Ok(out) if out.success && !out.stdout.is_empty() => Some(out.stdout),
        _ => None,
    }
}

async fn net_op(args: &[&str], repo_root: &str, op: &'static str) -> NetResult {
    match run_git(args, repo_root).await {
        Ok(out) => {
            if !out.success {
                warn!(
                    component = "git",
                    event = "git.net_op.failed",
                    op = %op,
                    output = %out.stdout,
                    "Network operation failed (non-fatal)"
                );
            }
            NetResult {
                success: out.success,
                output: out.stdout,
            }
        }
        Err(e) => NetResult {
            success: false,
            output: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_validation() {
        assert!(validate_branch("feat/x").is_ok());
        assert!(validate_branch("release-1.2_rc").is_ok());
        assert!(validate_branch("").is_err());
        assert!(validate_branch("feat x").is_err());
        assert!(validate_branch("feat;rm -rf").is_err());
        assert!(validate_branch("naïve").is_err());
    }

    #[tokio::test]
    async fn repo_info_outside_repo_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitRuntime::new();
        assert!(git
            .repo_info(&dir.path().to_string_lossy())
            .await
            .is_none());
    }

    #[test]
    fn mapping_round_trip_is_stable() {
        let git = GitRuntime::new();
        let mapping = WorktreeMapping {
            repo_root: "/r".into(),
            branch: "feat/x".into(),
            actual_branch: "feat/x-wt-abc".into(),
            worktree_path: "/r-worktrees/feat-x".into(),
            created_at: companion_protocol::now_iso(),
        };
        git.record_mapping("s1", mapping.clone());
        let first = git.mapping_for_session("s1").unwrap();
        let second = git.mapping_for_session("s1").unwrap();
        assert_eq!(first.actual_branch, second.actual_branch);
        assert_eq!(first.worktree_path, mapping.worktree_path);
    }
}
