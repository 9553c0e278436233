//! Domain entities (`spec.md` §3): the document `state.json` holds a
//! collection of each of these.

mod execution;
mod merge_queue;
mod runner_config;
mod user_story;

pub use execution::{Activity, ExecutionStatus, LaunchRecovery, LoopCounters, MergeMetadata, Priority};
pub use merge_queue::{MergeQueueItem, MergeQueueStatus};
pub use runner_config::RunnerConfig;
pub use user_story::{AcEvidence, UserStory};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An execution record, active or archived. The archived shape is
/// identical (`spec.md` §3: "same shapes as their active counterparts");
/// archival is a move between two collections in the one document, not
/// a distinct type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub description: String,
    pub prd_source: String,
    pub project_root: String,
    pub worktree_path: Option<String>,
    /// Branch HEAD at creation time; immutable after creation (`spec.md` §3).
    pub base_commit_sha: String,
    pub status: ExecutionStatus,
    pub agent_task_id: Option<String>,
    pub conflict_strategy: ConflictStrategy,
    pub auto_merge: bool,
    pub notify_on_complete: bool,
    pub dependencies: Vec<String>,
    #[serde(flatten)]
    pub loop_counters: LoopCounters,
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activity: Activity,
    #[serde(flatten)]
    pub launch_recovery: LaunchRecovery,
    #[serde(flatten)]
    pub merge_metadata: MergeMetadata,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Unknown fields round-trip through this map rather than being
    /// dropped on re-serialization.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        project: impl Into<String>,
        branch: impl Into<String>,
        prd_source: impl Into<String>,
        project_root: impl Into<String>,
        base_commit_sha: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            project: project.into(),
            branch: branch.into(),
            description: String::new(),
            prd_source: prd_source.into(),
            project_root: project_root.into(),
            worktree_path: None,
            base_commit_sha: base_commit_sha.into(),
            status: ExecutionStatus::Pending,
            agent_task_id: None,
            conflict_strategy: ConflictStrategy::Notify,
            auto_merge: false,
            notify_on_complete: false,
            dependencies: Vec::new(),
            loop_counters: LoopCounters::default(),
            last_progress_at: None,
            activity: Activity::default(),
            launch_recovery: LaunchRecovery::default(),
            merge_metadata: MergeMetadata::default(),
            priority: Priority::default(),
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_auto_merge(mut self, auto_merge: bool) -> Self {
        self.auto_merge = auto_merge;
        self
    }

    pub fn with_notify_on_complete(mut self, notify: bool) -> Self {
        self.notify_on_complete = notify;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ExecutionStatus::Merged)
    }

    pub fn is_active_occupant(&self) -> bool {
        matches!(self.status, ExecutionStatus::Running | ExecutionStatus::Starting)
    }
}

/// How conflicts during an eventual merge should be handled. External
/// to this crate's own algorithms, but persisted with the execution so
/// the merge worker collaborator can consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    AutoTheirs,
    AutoOurs,
    Notify,
    Agent,
}
