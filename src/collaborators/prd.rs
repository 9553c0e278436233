//! The PRD parser collaborator (`spec.md` §6, §7). Out of scope to
//! implement for real; only the shape it produces is defined here.

use crate::error::RalphResult;
use crate::model::Priority;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ParsedUserStory {
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPrd {
    pub title: String,
    pub description: String,
    pub branch_name: String,
    pub priority: Priority,
    pub user_stories: Vec<ParsedUserStory>,
    pub dependencies: Vec<String>,
    /// Raw frontmatter, preserved for C7's `status`/`id`/`slug`/
    /// `aliases`/`branch`/`branchName`/`mergeSha`/`executedAt` lookups.
    pub frontmatter: serde_json::Map<String, serde_json::Value>,
}

pub trait PrdParser: Send + Sync {
    fn parse(&self, path: &Path) -> RalphResult<ParsedPrd>;
}
