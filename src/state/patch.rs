//! `updateExecution`'s "patch object" (`spec.md` §9 design note:
//! "expose it as an explicit builder or option struct with one
//! optional field per allowed attribute, plus a shared side-channel to
//! request `skipTransitionValidation`").

use crate::model::{Activity, ConflictStrategy, ExecutionStatus, LaunchRecovery, LoopCounters, MergeMetadata, Priority};
use chrono::{DateTime, Utc};

/// One optional field per mutable `Execution` attribute. `None` means
/// "leave unchanged". `status` is the only field subject to transition
/// validation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub worktree_path: Option<Option<String>>,
    pub agent_task_id: Option<Option<String>>,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub auto_merge: Option<bool>,
    pub notify_on_complete: Option<bool>,
    pub dependencies: Option<Vec<String>>,
    pub loop_counters: Option<LoopCounters>,
    pub last_progress_at: Option<Option<DateTime<Utc>>>,
    pub activity: Option<Activity>,
    pub launch_recovery: Option<LaunchRecovery>,
    pub merge_metadata: Option<MergeMetadata>,
    pub priority: Option<Priority>,
    /// Privileged side-channel. `spec.md` §9: "reimplementers should
    /// make `skipTransitionValidation` a privileged option used
    /// exclusively by the reconciler." Enforced by construction: the
    /// only public constructor that sets this is
    /// [`ExecutionPatch::reconciler`].
    pub(crate) skip_transition_validation: bool,
}

impl ExecutionPatch {
    /// A patch usable by ordinary callers (Update Pipeline, Scheduler,
    /// RPC handlers). Transition validation always applies.
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch that may skip transition validation. Only the
    /// reconciler should construct one of these (`spec.md` §9).
    pub fn reconciler() -> Self {
        Self {
            skip_transition_validation: true,
            ..Self::default()
        }
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn worktree_path(mut self, path: Option<String>) -> Self {
        self.worktree_path = Some(path);
        self
    }

    pub fn agent_task_id(mut self, id: Option<String>) -> Self {
        self.agent_task_id = Some(id);
        self
    }

    pub fn auto_merge(mut self, value: bool) -> Self {
        self.auto_merge = Some(value);
        self
    }

    pub fn dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = Some(deps);
        self
    }

    pub fn loop_counters(mut self, counters: LoopCounters) -> Self {
        self.loop_counters = Some(counters);
        self
    }

    pub fn last_progress_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_progress_at = Some(at);
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn launch_recovery(mut self, recovery: LaunchRecovery) -> Self {
        self.launch_recovery = Some(recovery);
        self
    }

    pub fn merge_metadata(mut self, metadata: MergeMetadata) -> Self {
        self.merge_metadata = Some(metadata);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Patch for `UserStory`; identity fields (`execution_id`, `story_id`)
/// are deliberately absent, matching `spec.md` §4.1's "cannot change
/// identity fields".
#[derive(Debug, Clone, Default)]
pub struct StoryPatch {
    pub passes: Option<bool>,
    pub notes: Option<String>,
    pub ac_evidence: Option<std::collections::HashMap<String, crate::model::AcEvidence>>,
}

impl StoryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passes(mut self, passes: bool) -> Self {
        self.passes = Some(passes);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn ac_evidence(mut self, evidence: std::collections::HashMap<String, crate::model::AcEvidence>) -> Self {
        self.ac_evidence = Some(evidence);
        self
    }
}
