use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-acceptance-criterion evidence, keyed by `AC-N` on the owning
/// `UserStory`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcEvidence {
    pub passes: bool,
    pub evidence: Option<String>,
    pub command: Option<String>,
    pub output: Option<String>,
    pub blocked_reason: Option<String>,
}

/// Composite-keyed by `(execution_id, story_id)` (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStory {
    pub execution_id: String,
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub ac_evidence: HashMap<String, AcEvidence>,
}

impl UserStory {
    pub fn new(
        execution_id: impl Into<String>,
        story_id: impl Into<String>,
        title: impl Into<String>,
        acceptance_criteria: Vec<String>,
        priority: u32,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            story_id: story_id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria,
            priority,
            passes: false,
            notes: String::new(),
            ac_evidence: HashMap::new(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.execution_id.clone(), self.story_id.clone())
    }
}
