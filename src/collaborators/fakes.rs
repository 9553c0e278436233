//! In-memory fakes for the collaborator traits, grounded on the
//! teacher's own habit of substituting `tempfile::tempdir()` fixtures
//! and fixed struct fields instead of real external systems in tests.

use super::git::{FileStat, GitCollaborator, MergeOutcome};
use super::launcher::{AgentLauncher, LaunchOutcome};
use super::notifier::Notifier;
use super::prd::{ParsedPrd, PrdParser};
use crate::error::RalphResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeGit {
    pub existing_branches: Mutex<Vec<String>>,
    pub merged_branches: Mutex<Vec<String>>,
    pub head_commit_times: Mutex<HashMap<String, DateTime<Utc>>>,
    pub head_shas: Mutex<HashMap<String, String>>,
    pub numstats: Mutex<HashMap<String, Vec<FileStat>>>,
    pub merge_results: Mutex<HashMap<String, MergeOutcome>>,
    pub ancestor_pairs: Mutex<Vec<(String, String)>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch(self, branch: impl Into<String>) -> Self {
        self.existing_branches.lock().unwrap().push(branch.into());
        self
    }

    pub fn with_merged_branch(self, branch: impl Into<String>) -> Self {
        self.merged_branches.lock().unwrap().push(branch.into());
        self
    }

    /// Declares `ancestor` as an ancestor of `descendant` for
    /// [`GitCollaborator::is_ancestor`]; equal refs are always
    /// considered ancestors without being declared.
    pub fn with_ancestor(self, ancestor: impl Into<String>, descendant: impl Into<String>) -> Self {
        self.ancestor_pairs.lock().unwrap().push((ancestor.into(), descendant.into()));
        self
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }
}

impl GitCollaborator for FakeGit {
    fn branch_exists(&self, branch: &str) -> RalphResult<bool> {
        Ok(self.existing_branches.lock().unwrap().iter().any(|b| b == branch))
    }

    fn branches_merged_to_main(&self) -> RalphResult<Vec<String>> {
        Ok(self.merged_branches.lock().unwrap().clone())
    }

    fn create_worktree(&self, branch: &str, _path: &Path) -> RalphResult<()> {
        self.existing_branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    fn remove_worktree(&self, _path: &Path) -> RalphResult<()> {
        Ok(())
    }

    fn numstat(&self, worktree: &Path, _base_ref: &str) -> RalphResult<Vec<FileStat>> {
        Ok(self.numstats.lock().unwrap().get(&Self::key(worktree)).cloned().unwrap_or_default())
    }

    fn head_commit_time(&self, worktree: &Path) -> RalphResult<DateTime<Utc>> {
        Ok(self
            .head_commit_times
            .lock()
            .unwrap()
            .get(&Self::key(worktree))
            .copied()
            .unwrap_or_else(Utc::now))
    }

    fn head_sha(&self, worktree: &Path) -> RalphResult<String> {
        Ok(self
            .head_shas
            .lock()
            .unwrap()
            .get(&Self::key(worktree))
            .cloned()
            .unwrap_or_else(|| "deadbeef".to_string()))
    }

    fn is_ancestor(&self, _worktree: &Path, ancestor: &str, descendant: &str) -> RalphResult<bool> {
        Ok(ancestor == descendant
            || self
                .ancestor_pairs
                .lock()
                .unwrap()
                .iter()
                .any(|(a, d)| a == ancestor && d == descendant))
    }

    fn merge(&self, _worktree: &Path, branch: &str, _strategy: Option<&str>) -> RalphResult<MergeOutcome> {
        Ok(self.merge_results.lock().unwrap().get(branch).cloned().unwrap_or(MergeOutcome {
            success: true,
            conflicted: false,
            commit_sha: Some("merged-sha".to_string()),
        }))
    }

    fn abort_merge(&self, _worktree: &Path) -> RalphResult<()> {
        Ok(())
    }
}

pub struct FakeLauncher {
    pub outcome: LaunchOutcome,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            outcome: LaunchOutcome {
                success: true,
                agent_task_id: Some("task-1".to_string()),
                log_path: Some("/tmp/agent.log".to_string()),
                error: None,
            },
        }
    }
}

impl AgentLauncher for FakeLauncher {
    fn launch(&self, _prompt: &str, _cwd: &Path, _execution_id: &str) -> RalphResult<LaunchOutcome> {
        Ok(self.outcome.clone())
    }
}

#[derive(Default)]
pub struct FakePrdParser {
    pub canned: Mutex<HashMap<String, ParsedPrd>>,
}

impl FakePrdParser {
    pub fn with_prd(self, path: impl Into<String>, prd: ParsedPrd) -> Self {
        self.canned.lock().unwrap().insert(path.into(), prd);
        self
    }
}

impl PrdParser for FakePrdParser {
    fn parse(&self, path: &Path) -> RalphResult<ParsedPrd> {
        Ok(self
            .canned
            .lock()
            .unwrap()
            .get(&path.to_string_lossy().to_string())
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notified: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify_complete(&self, execution_id: &str) {
        self.notified.lock().unwrap().push(execution_id.to_string());
    }
}
