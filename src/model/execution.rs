use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The nine-state transition table lives in `crate::state::transitions`;
/// this is just the tagged union itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Ready,
    Starting,
    Running,
    Interrupted,
    Completed,
    Failed,
    Stopped,
    Merging,
    Merged,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Merging => "merging",
            Self::Merged => "merged",
        };
        write!(f, "{s}")
    }
}

/// Execution priority; P0 sorts before P1 sorts before P2 (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Default for Priority {
    fn default() -> Self {
        Self::P1
    }
}

/// Loop bookkeeping consumed and mutated by the Stagnation Detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopCounters {
    #[serde(default)]
    pub loop_count: u32,
    #[serde(default)]
    pub consecutive_no_progress: u32,
    #[serde(default)]
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_files_changed: u32,
}

/// What the execution is currently doing, as reported through updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Activity {
    pub current_story_id: Option<String>,
    pub current_step: Option<String>,
    pub step_started_at: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
}

/// Launch-attempt bookkeeping so a crashed claimer does not grant an
/// unbounded number of retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchRecovery {
    pub launch_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub launch_attempts: u32,
}

/// Terminal merge bookkeeping, populated by the reconciler or the merge
/// queue worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub reconcile_reason: Option<String>,
}
