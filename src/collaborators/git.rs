//! The git collaborator (`spec.md` §6, §9).
//!
//! `SystemGit` is grounded directly on
//! `harness::git_manager::GitManager`: the same
//! shell-out-with-retry-on-transient-errors shape
//! (`run_git`/`run_git_with_retry`, exponential backoff at
//! `RETRY_BASE_DELAY_MS * 2^attempt`), extended with the worktree and
//! merge capabilities `spec.md` needs that the teacher's `GitManager`
//! does not have.

use crate::error::{RalphError, RalphResult};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

/// The git capabilities the core consumes (`spec.md` §6): branch
/// existence, merged-branch listing, worktree lifecycle, numstat, HEAD
/// commit time, merge with strategy, conflict detection, abort.
pub trait GitCollaborator: Send + Sync {
    fn branch_exists(&self, branch: &str) -> RalphResult<bool>;
    fn branches_merged_to_main(&self) -> RalphResult<Vec<String>>;
    fn create_worktree(&self, branch: &str, path: &Path) -> RalphResult<()>;
    fn remove_worktree(&self, path: &Path) -> RalphResult<()>;
    fn numstat(&self, worktree: &Path, base_ref: &str) -> RalphResult<Vec<FileStat>>;
    fn head_commit_time(&self, worktree: &Path) -> RalphResult<DateTime<Utc>>;
    fn head_sha(&self, worktree: &Path) -> RalphResult<String>;
    fn is_ancestor(&self, worktree: &Path, ancestor: &str, descendant: &str) -> RalphResult<bool>;
    fn merge(&self, worktree: &Path, branch: &str, strategy: Option<&str>) -> RalphResult<MergeOutcome>;
    fn abort_merge(&self, worktree: &Path) -> RalphResult<()>;
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub path: String,
    pub added: u32,
    pub removed: u32,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicted: bool,
    pub commit_sha: Option<String>,
}

/// Real git, via subprocess.
pub struct SystemGit {
    max_retries: u32,
}

impl Default for SystemGit {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SystemGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn run(&self, cwd: &Path, args: &[&str]) -> RalphResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| RalphError::external("git", format!("execute {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RalphError::external("git", format!("{}: {}", args.join(" "), stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_with_retry(&self, cwd: &Path, args: &[&str]) -> RalphResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run(cwd, args) {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| RalphError::external("git", "max retries exceeded")))
    }
}

impl GitCollaborator for SystemGit {
    fn branch_exists(&self, branch: &str) -> RalphResult<bool> {
        let cwd = std::env::current_dir()?;
        let output = Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .current_dir(&cwd)
            .status()
            .map_err(|e| RalphError::external("git", e.to_string()))?;
        Ok(output.success())
    }

    fn branches_merged_to_main(&self) -> RalphResult<Vec<String>> {
        let cwd = std::env::current_dir()?;
        let output = self
            .run_with_retry(&cwd, &["branch", "--merged", "origin/main"])
            .or_else(|_| self.run_with_retry(&cwd, &["branch", "--merged", "main"]))?;
        Ok(output
            .lines()
            .map(|l| l.trim_start_matches('*').trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    fn create_worktree(&self, branch: &str, path: &Path) -> RalphResult<()> {
        let cwd = std::env::current_dir()?;
        let path_str = path.to_string_lossy().to_string();
        self.run_with_retry(&cwd, &["worktree", "add", &path_str, branch])?;
        Ok(())
    }

    fn remove_worktree(&self, path: &Path) -> RalphResult<()> {
        let cwd = std::env::current_dir()?;
        let path_str = path.to_string_lossy().to_string();
        self.run_with_retry(&cwd, &["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    fn numstat(&self, worktree: &Path, base_ref: &str) -> RalphResult<Vec<FileStat>> {
        let output = self.run(worktree, &["diff", "--numstat", base_ref])?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let added = parts.next()?;
                let removed = parts.next()?;
                let path = parts.next()?.to_string();
                Some(FileStat {
                    path,
                    added: added.parse().unwrap_or(0),
                    removed: removed.parse().unwrap_or(0),
                })
            })
            .collect())
    }

    fn head_commit_time(&self, worktree: &Path) -> RalphResult<DateTime<Utc>> {
        let output = self.run(worktree, &["log", "-1", "--format=%cI"])?;
        DateTime::parse_from_rfc3339(&output)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RalphError::external("git", format!("parse commit time: {e}")))
    }

    fn head_sha(&self, worktree: &Path) -> RalphResult<String> {
        self.run(worktree, &["rev-parse", "HEAD"])
    }

    fn is_ancestor(&self, worktree: &Path, ancestor: &str, descendant: &str) -> RalphResult<bool> {
        let status = Command::new("git")
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .current_dir(worktree)
            .status()
            .map_err(|e| RalphError::external("git", e.to_string()))?;
        Ok(status.success())
    }

    fn merge(&self, worktree: &Path, branch: &str, strategy: Option<&str>) -> RalphResult<MergeOutcome> {
        let mut args = vec!["merge", "--no-edit"];
        if let Some(strategy) = strategy {
            args.push("--strategy");
            args.push(strategy);
        }
        args.push(branch);
        match self.run(worktree, &args) {
            Ok(_) => {
                let sha = self.head_sha(worktree).ok();
                Ok(MergeOutcome {
                    success: true,
                    conflicted: false,
                    commit_sha: sha,
                })
            }
            Err(_) => Ok(MergeOutcome {
                success: false,
                conflicted: true,
                commit_sha: None,
            }),
        }
    }

    fn abort_merge(&self, worktree: &Path) -> RalphResult<()> {
        self.run(worktree, &["merge", "--abort"])?;
        Ok(())
    }
}

/// Resolve a worktree path given a project root and branch, matching
/// the convention the scheduler/reconciler expect: `<root>/.worktrees/<branch sanitized>`.
pub fn default_worktree_path(project_root: &Path, branch: &str) -> PathBuf {
    let sanitized = branch.replace('/', "-");
    project_root.join(".worktrees").join(sanitized)
}
