//! C6 — Update Pipeline (`spec.md` §4.6).
//!
//! The progress-log append is grounded on
//! `harness::types::ProgressEntry`'s append-only-log convention; the
//! evidence-validation step mirrors the gate/outcome shape of the
//! teacher's `verifier` module adapted from compiler-error gates to
//! `spec.md`'s `{typecheck, build}` hard gates plus free-form AC
//! evidence.

mod evidence;
mod progress_log;
mod scope;

pub use evidence::{validate_evidence, EvidenceInput, HardGateResult};
pub use progress_log::append_progress_entry;
pub use scope::{check_scope, DiffReconciliation, ScopeVerdict};

use crate::collaborators::git::GitCollaborator;
use crate::collaborators::notifier::Notifier;
use crate::collaborators::prd::PrdParser;
use crate::dependency::resolve_dependencies;
use crate::error::{RalphError, RalphResult};
use crate::model::{AcEvidence, Activity, ExecutionStatus};
use crate::stagnation::{record_loop_result, ExternalProgressSignals, StagnationOptions, StagnationVerdict};
use crate::state::{ExecutionPatch, StateStore, StoryPatch};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;

/// The `update(...)` RPC's input (`spec.md` §4.6).
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub branch: String,
    pub story_id: String,
    pub passes: bool,
    pub notes: Option<String>,
    pub files_changed: Option<u32>,
    pub error: Option<String>,
    pub step: Option<String>,
    pub ac_evidence: Option<HashMap<String, AcEvidence>>,
    pub hard_gates: Option<HardGateResult>,
    pub skip_hard_gates: bool,
    pub expected_files: Option<Vec<String>>,
    pub unexpected_file_explanation: Option<String>,
    pub scope_explanation: Option<String>,
    pub skip_scope_check: bool,
    /// Override for C2's no-progress timeout (`spec.md` §4.2: "optional
    /// overrides for thresholds and a 'no-progress timeout'"). Distinct
    /// from C3's per-task-type stale timeout -- `None` here means "no
    /// timeout configured", so the no-progress verdict fires on loop
    /// count alone, as spec.md's end-to-end stagnation scenario assumes.
    pub no_progress_timeout_ms: Option<i64>,
}

/// What `update(...)` returns: either the ordinary mutation result or
/// an early-return domain verdict (`spec.md` §7: "StagnationDetected
/// ... returned as a domain result").
#[derive(Debug)]
pub enum UpdateOutcome {
    Applied {
        execution_status: ExecutionStatus,
        story_passes: bool,
        promoted_dependents: Vec<PromotedDependent>,
    },
    Stagnant(crate::stagnation::StagnationKind),
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct PromotedDependent {
    pub branch: String,
    pub prompt: String,
}

pub struct UpdatePipeline<'a> {
    store: &'a StateStore,
    git: &'a dyn GitCollaborator,
    prd_parser: &'a dyn PrdParser,
    notifier: &'a dyn Notifier,
    branch_prefix: String,
    prd_dir: std::path::PathBuf,
    tasks_dir: std::path::PathBuf,
}

impl<'a> UpdatePipeline<'a> {
    pub fn new(
        store: &'a StateStore,
        git: &'a dyn GitCollaborator,
        prd_parser: &'a dyn PrdParser,
        notifier: &'a dyn Notifier,
        branch_prefix: impl Into<String>,
        prd_dir: impl Into<std::path::PathBuf>,
        tasks_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            store,
            git,
            prd_parser,
            notifier,
            branch_prefix: branch_prefix.into(),
            prd_dir: prd_dir.into(),
            tasks_dir: tasks_dir.into(),
        }
    }

    pub fn update(&self, request: UpdateRequest) -> RalphResult<UpdateOutcome> {
        // Step 1: find by branch, restoring from the archive if needed.
        let mut execution = match self.store.find_by_branch(&request.branch)? {
            Some(exec) => exec,
            None => self.store.restore_archived_execution_by_branch(&request.branch)?,
        };

        // Step 2: activity tracking.
        let default_step = if request.passes { "verifying" } else { "implementing" };
        let new_step = request.step.clone().unwrap_or_else(|| default_step.to_string());
        let step_changed = execution.activity.current_step.as_deref() != Some(new_step.as_str());
        let mut activity = execution.activity.clone();
        activity.current_story_id = Some(request.story_id.clone());
        activity.current_step = Some(new_step);
        if step_changed {
            activity.step_started_at = Some(Utc::now());
        }
        execution.activity = activity.clone();
        self.store
            .update_execution(&execution.id, ExecutionPatch::new().activity(activity))?;

        // Step 3: stagnation check.
        let stories = self.store.stories_for(&execution.id)?;
        let pending_story_count = stories.iter().filter(|s| !s.passes).count().max(1) as u32;
        let all_stories_pass_before = !stories.is_empty() && stories.iter().all(|s| s.passes);

        let worktree = execution.worktree_path.as_deref().map(Path::new);
        let git_head_commit_ms = worktree.and_then(|w| self.git.head_commit_time(w).ok()).map(|d| d.timestamp_millis());
        let log_mtime_ms = execution
            .activity
            .log_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<Utc>::from(t).timestamp_millis());

        let recorded = record_loop_result(
            &execution,
            request.files_changed.unwrap_or(0),
            request.error.as_deref(),
            all_stories_pass_before,
            pending_story_count,
            ExternalProgressSignals {
                git_head_commit_ms,
                changed_files_max_mtime_ms: None,
                log_mtime_ms,
            },
            StagnationOptions {
                no_progress_timeout_ms: request.no_progress_timeout_ms,
                ..StagnationOptions::default()
            },
        );

        self.persist_loop_result(&execution, &recorded)?;
        if let StagnationVerdict::Stagnant(kind) = recorded.verdict {
            return Ok(UpdateOutcome::Stagnant(kind));
        }

        // Step 4: scope guardrail.
        if request.passes && !request.skip_scope_check {
            if let Some(worktree) = worktree {
                let stats = self.git.numstat(worktree, &execution.base_commit_sha)?;
                let verdict = check_scope(&stats, request.scope_explanation.as_deref());
                if let ScopeVerdict::Hard { reason } = &verdict {
                    return Ok(UpdateOutcome::Rejected(reason.clone()));
                }
                if let ScopeVerdict::WarnUnexplained { reason } = &verdict {
                    return Ok(UpdateOutcome::Rejected(reason.clone()));
                }

                // Step 5: diff reconciliation against declared expected files.
                if let Some(expected) = &request.expected_files {
                    let actual: Vec<String> = stats.iter().map(|s| s.path.clone()).collect();
                    let reconciliation = DiffReconciliation::compute(expected, &actual);
                    if !reconciliation.unexpected.is_empty() && request.unexpected_file_explanation.is_none() {
                        return Ok(UpdateOutcome::Rejected(format!(
                            "unexpected files changed without explanation: {}",
                            reconciliation.unexpected.join(", ")
                        )));
                    }
                    if reconciliation.divergence_ratio() > 0.5 {
                        return Ok(UpdateOutcome::Rejected(
                            "more than half of changed files diverge from expected scope; please re-scope".to_string(),
                        ));
                    }
                }
            }
        }

        // Step 6: evidence validation.
        let story = stories
            .iter()
            .find(|s| s.story_id == request.story_id)
            .cloned()
            .ok_or_else(|| RalphError::StoryNotFound {
                execution_id: execution.id.clone(),
                story_id: request.story_id.clone(),
            })?;

        let evidence_outcome = validate_evidence(EvidenceInput {
            declared_passes: request.passes,
            skip_hard_gates: request.skip_hard_gates,
            hard_gates: request.hard_gates.clone(),
            acceptance_criteria: &story.acceptance_criteria,
            ac_evidence: request.ac_evidence.clone().unwrap_or_default(),
        });

        // Step 7: persist the story.
        self.store.update_story(
            &execution.id,
            &request.story_id,
            StoryPatch::new()
                .passes(evidence_outcome.effective_passes)
                .notes(request.notes.clone().unwrap_or_default())
                .ac_evidence(evidence_outcome.merged_evidence),
        )?;

        // Step 8: progress log.
        if evidence_outcome.effective_passes {
            if let Some(worktree) = worktree {
                let _ = append_progress_entry(
                    worktree,
                    &request.story_id,
                    request.notes.as_deref().unwrap_or(""),
                );
            }
        }

        // Step 9: recompute completion.
        let stories_after = self.store.stories_for(&execution.id)?;
        let all_complete = !stories_after.is_empty() && stories_after.iter().all(|s| s.passes);
        let new_status = if all_complete { ExecutionStatus::Completed } else { ExecutionStatus::Running };
        let mut patch = ExecutionPatch::new().status(new_status);
        if all_complete {
            patch = patch.activity(Activity::default());
        }
        self.store.update_execution(&execution.id, patch)?;

        // Step 10: enqueue merge.
        if all_complete && execution.auto_merge {
            self.store.enqueue_merge(&execution.id)?;
        }

        // Step 11: promote dependents.
        let mut promoted_dependents = Vec::new();
        if all_complete {
            promoted_dependents = self.promote_dependents(&execution)?;
        }

        // Step 12: notification.
        if all_complete && execution.notify_on_complete {
            self.notifier.notify_complete(&execution.id);
        }

        Ok(UpdateOutcome::Applied {
            execution_status: new_status,
            story_passes: evidence_outcome.effective_passes,
            promoted_dependents,
        })
    }

    fn persist_loop_result(&self, execution: &crate::model::Execution, recorded: &crate::stagnation::RecordedLoop) -> RalphResult<()> {
        let mut patch = ExecutionPatch::new()
            .loop_counters(recorded.loop_counters.clone())
            .last_progress_at(recorded.last_progress_at);
        if let Some(status) = recorded.new_status {
            patch = patch.status(status);
        }
        self.store.update_execution(&execution.id, patch)?;
        Ok(())
    }

    fn promote_dependents(&self, _completed: &crate::model::Execution) -> RalphResult<Vec<PromotedDependent>> {
        let active = self.store.list_executions()?;
        let archived = self.store.list_archived_executions()?;

        // Every pending execution goes through the same normalizing
        // resolver C7 itself uses (`spec.md` §4.7) rather than a raw
        // substring pre-filter against the just-completed branch --
        // a dependent declaring an unnormalized token (e.g.
        // `"feature-a.md"`) against a completed branch
        // (`"ralph/feature-a"`) must still be found satisfied here.
        let mut promoted = Vec::new();
        for dependent in active.iter().filter(|e| e.status == ExecutionStatus::Pending) {
            let resolution = resolve_dependencies(
                dependent,
                &self.branch_prefix,
                &self.prd_dir,
                &self.tasks_dir,
                self.prd_parser,
                &active,
                &archived,
            );
            if !resolution.satisfied {
                continue;
            }
            let sync_ok = dependent
                .worktree_path
                .as_deref()
                .map(Path::new)
                .map(|w| self.git.merge(w, "main", None).map(|o| o.success).unwrap_or(false))
                .unwrap_or(true);

            if sync_ok {
                self.store
                    .update_execution(&dependent.id, ExecutionPatch::new().status(ExecutionStatus::Ready))?;
                promoted.push(PromotedDependent {
                    branch: dependent.branch.clone(),
                    prompt: format!("Dependencies satisfied; continue work on {}", dependent.branch),
                });
            } else {
                self.store.update_execution(
                    &dependent.id,
                    ExecutionPatch::new().activity({
                        let mut activity = dependent.activity.clone();
                        activity.current_step = Some("blocked: sync from main failed".to_string());
                        activity
                    }),
                )?;
            }
        }
        Ok(promoted)
    }
}
