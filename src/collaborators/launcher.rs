//! The agent launcher collaborator (`spec.md` §6): "spawns a child
//! process, returns a task id and log path." Out of scope to
//! implement for real; the core depends only on this trait.

use crate::error::RalphResult;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub success: bool,
    pub agent_task_id: Option<String>,
    pub log_path: Option<String>,
    pub error: Option<String>,
}

pub trait AgentLauncher: Send + Sync {
    fn launch(&self, prompt: &str, cwd: &Path, execution_id: &str) -> RalphResult<LaunchOutcome>;
}
