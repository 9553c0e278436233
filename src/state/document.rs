//! The persisted document shape (`spec.md` §6).

use crate::model::{Execution, MergeQueueItem, RunnerConfig, UserStory};
use serde::{Deserialize, Serialize};

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub executions: Vec<Execution>,
    #[serde(default)]
    pub user_stories: Vec<UserStory>,
    #[serde(default)]
    pub merge_queue: Vec<MergeQueueItem>,
    #[serde(default)]
    pub archived_executions: Vec<Execution>,
    #[serde(default)]
    pub archived_user_stories: Vec<UserStory>,
    pub runner_config: Option<RunnerConfig>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

impl StateDocument {
    pub fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            executions: Vec::new(),
            user_stories: Vec::new(),
            merge_queue: Vec::new(),
            archived_executions: Vec::new(),
            archived_user_stories: Vec::new(),
            runner_config: None,
        }
    }
}
