use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeQueueStatus {
    Pending,
    Merging,
    Completed,
    Failed,
}

/// FIFO-with-position entry; ordering is by `(position, id)` ascending
/// (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueItem {
    pub id: i64,
    pub execution_id: String,
    pub position: i64,
    pub status: MergeQueueStatus,
    pub created_at: DateTime<Utc>,
}
