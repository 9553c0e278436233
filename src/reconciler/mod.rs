//! C4 — Reconciler (`spec.md` §4.4).
//!
//! Consumes `GitCollaborator` and the C3 stale verdict; never aborts
//! the whole pass on one execution's failure (`spec.md` §7), logging a
//! `skipped` action instead, matching the teacher's `GitManager`
//! retry-then-propagate shape applied one level up.

use crate::collaborators::git::GitCollaborator;
use crate::collaborators::prd::PrdParser;
use crate::model::{Execution, ExecutionStatus};
use crate::stale::{check_staleness, infer_task_type, LivenessSignals};
use crate::state::{ExecutionPatch, StateStore};
use chrono::{DateTime, Utc};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ReconcileAction {
    pub branch: String,
    pub previous_status: ExecutionStatus,
    pub action: String,
    pub reason: String,
}

pub struct Reconciler<'a> {
    store: &'a StateStore,
    git: &'a dyn GitCollaborator,
    prd_parser: Option<&'a dyn PrdParser>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a StateStore, git: &'a dyn GitCollaborator) -> Self {
        Self { store, git, prd_parser: None }
    }

    /// Enables step 1 (`spec.md` §4.4: "PRD frontmatter mergeSha") --
    /// without a PRD parser the reconciler still runs steps 2-6, it
    /// just never short-circuits via the frontmatter-declared
    /// `mergeSha`.
    pub fn with_prd_parser(mut self, prd_parser: &'a dyn PrdParser) -> Self {
        self.prd_parser = Some(prd_parser);
        self
    }

    /// Run one reconcile pass over all non-terminal active executions.
    pub fn reconcile(&self) -> Vec<ReconcileAction> {
        let mut actions = Vec::new();
        let executions = match self.store.list_executions() {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "reconciler could not list executions");
                return actions;
            }
        };

        for execution in executions {
            if execution.is_terminal() {
                continue;
            }
            match self.reconcile_one(&execution) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(branch = %execution.branch, error = %e, "skipping execution during reconcile");
                    actions.push(ReconcileAction {
                        branch: execution.branch.clone(),
                        previous_status: execution.status,
                        action: "skipped".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        actions
    }

    fn reconcile_one(&self, execution: &Execution) -> crate::error::RalphResult<Option<ReconcileAction>> {
        let previous_status = execution.status;

        // Step 1: PRD frontmatter mergeSha.
        if let Some(action) = self.reconcile_frontmatter_merge_sha(execution)? {
            return Ok(Some(action));
        }

        // Step 2: branch merged to main, with the ghost-merge guard.
        let merged_branches = self.git.branches_merged_to_main()?;
        if merged_branches.iter().any(|b| b == &execution.branch) {
            if let Some(worktree) = execution.worktree_path.as_deref() {
                let worktree_path = Path::new(worktree);
                if let Ok(head) = self.git.head_sha(worktree_path) {
                    if head == execution.base_commit_sha {
                        // Ghost merge: brand-new branch, no divergence yet. Skip.
                        return Ok(None);
                    }
                }
            }
            if previous_status == ExecutionStatus::Stopped {
                // Stopped executions are preserved except when the
                // merged guard fires (`spec.md` §4.4 step 3) -- which
                // it just did, so fall through to archiving.
            }
            self.archive_as(execution, ExecutionStatus::Merged, "branch_merged")?;
            return Ok(Some(ReconcileAction {
                branch: execution.branch.clone(),
                previous_status,
                action: "archived".to_string(),
                reason: "branch_merged".to_string(),
            }));
        }

        if previous_status == ExecutionStatus::Stopped {
            return Ok(None);
        }

        // Step 4: branch deleted.
        if !self.git.branch_exists(&execution.branch)? {
            self.mark_failed_and_archive(execution, "branch_deleted")?;
            return Ok(Some(ReconcileAction {
                branch: execution.branch.clone(),
                previous_status,
                action: "failed".to_string(),
                reason: "branch_deleted".to_string(),
            }));
        }

        // Step 5: worktree missing while running.
        if previous_status == ExecutionStatus::Running {
            if let Some(worktree) = &execution.worktree_path {
                if !Path::new(worktree).exists() {
                    self.store.update_execution(
                        &execution.id,
                        ExecutionPatch::reconciler()
                            .status(ExecutionStatus::Failed)
                            .worktree_path(None),
                    )?;
                    self.store.archive_execution(&execution.id)?;
                    return Ok(Some(ReconcileAction {
                        branch: execution.branch.clone(),
                        previous_status,
                        action: "failed".to_string(),
                        reason: "worktree_missing".to_string(),
                    }));
                }
            }
        }

        // Step 6: zombie running classification via C3.
        if previous_status == ExecutionStatus::Running {
            let stories = self.store.stories_for(&execution.id)?;
            let all_pass = !stories.is_empty() && stories.iter().all(|s| s.passes);

            let worktree_path = execution.worktree_path.as_deref().map(Path::new);
            let git_head_commit_ms = worktree_path
                .and_then(|p| self.git.head_commit_time(p).ok())
                .map(|dt| dt.timestamp_millis());

            let signals = LivenessSignals {
                state_updated_at_ms: Some(execution.updated_at.timestamp_millis()),
                git_head_commit_ms,
                changed_files_max_mtime_ms: None,
                log_mtime_ms: execution
                    .activity
                    .log_path
                    .as_ref()
                    .and_then(|p| std::fs::metadata(p).ok())
                    .and_then(|m| m.modified().ok())
                    .map(|t| chrono::DateTime::<Utc>::from(t).timestamp_millis()),
            };
            let task_type = infer_task_type(
                execution.activity.current_step.as_deref(),
                None,
                execution.loop_counters.last_error.as_deref(),
            );
            let verdict = check_staleness(signals, task_type, None, Utc::now());

            if verdict.is_stale {
                if all_pass {
                    self.store
                        .update_execution(&execution.id, ExecutionPatch::reconciler().status(ExecutionStatus::Completed))?;
                    return Ok(Some(ReconcileAction {
                        branch: execution.branch.clone(),
                        previous_status,
                        action: "completed".to_string(),
                        reason: "stale_but_all_stories_pass".to_string(),
                    }));
                } else {
                    self.store
                        .update_execution(&execution.id, ExecutionPatch::reconciler().status(ExecutionStatus::Interrupted))?;
                    return Ok(Some(ReconcileAction {
                        branch: execution.branch.clone(),
                        previous_status,
                        action: "interrupted".to_string(),
                        reason: format!(
                            "no liveness signal for {}ms (timeout {}ms, task {:?})",
                            verdict.idle_ms, verdict.timeout_ms, verdict.task_type
                        ),
                    }));
                }
            }
        }

        Ok(None)
    }

    fn reconcile_frontmatter_merge_sha(&self, execution: &Execution) -> crate::error::RalphResult<Option<ReconcileAction>> {
        let Some(prd_parser) = self.prd_parser else {
            return Ok(None);
        };
        let Ok(prd) = prd_parser.parse(Path::new(&execution.prd_source)) else {
            return Ok(None);
        };
        let Some(merge_sha) = prd.frontmatter.get("mergeSha").and_then(|v| v.as_str()) else {
            return Ok(None);
        };

        let repo_root = execution
            .worktree_path
            .as_deref()
            .map(Path::new)
            .unwrap_or_else(|| Path::new(&execution.project_root));

        let base_is_ancestor_of_merge = self
            .git
            .is_ancestor(repo_root, &execution.base_commit_sha, merge_sha)
            .unwrap_or(false);
        let merge_is_ancestor_of_main = self.git.is_ancestor(repo_root, merge_sha, "main").unwrap_or(false);
        if !(base_is_ancestor_of_merge && merge_is_ancestor_of_main) {
            return Ok(None);
        }

        if let Some(worktree) = &execution.worktree_path {
            let _ = self.git.remove_worktree(Path::new(worktree));
        }

        let merged_at = prd
            .frontmatter
            .get("executedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        self.store.update_execution(
            &execution.id,
            ExecutionPatch::reconciler()
                .status(ExecutionStatus::Merged)
                .worktree_path(None)
                .merge_metadata(crate::model::MergeMetadata {
                    merged_at: Some(merged_at),
                    merge_commit_sha: Some(merge_sha.to_string()),
                    reconcile_reason: Some("branch_merged".to_string()),
                }),
        )?;
        self.store.archive_execution(&execution.id)?;

        Ok(Some(ReconcileAction {
            branch: execution.branch.clone(),
            previous_status: execution.status,
            action: "archived".to_string(),
            reason: "branch_merged".to_string(),
        }))
    }

    fn archive_as(&self, execution: &Execution, status: ExecutionStatus, reason: &str) -> crate::error::RalphResult<()> {
        self.store.update_execution(
            &execution.id,
            ExecutionPatch::reconciler()
                .status(status)
                .merge_metadata(crate::model::MergeMetadata {
                    merged_at: Some(Utc::now()),
                    merge_commit_sha: None,
                    reconcile_reason: Some(reason.to_string()),
                }),
        )?;
        if let Some(worktree) = &execution.worktree_path {
            let _ = self.git.remove_worktree(Path::new(worktree));
        }
        self.store.archive_execution(&execution.id)?;
        Ok(())
    }

    fn mark_failed_and_archive(&self, execution: &Execution, reason: &str) -> crate::error::RalphResult<()> {
        self.store.update_execution(
            &execution.id,
            ExecutionPatch::reconciler()
                .status(ExecutionStatus::Failed)
                .merge_metadata(crate::model::MergeMetadata {
                    merged_at: None,
                    merge_commit_sha: None,
                    reconcile_reason: Some(reason.to_string()),
                }),
        )?;
        if let Some(worktree) = &execution.worktree_path {
            let _ = self.git.remove_worktree(Path::new(worktree));
        }
        self.store.archive_execution(&execution.id)?;
        Ok(())
    }
}
