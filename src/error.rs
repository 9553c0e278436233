//! Error taxonomy for the orchestrator core.
//!
//! Maps the six surface categories onto `thiserror` variants, in the
//! same spirit as a harness distinguishing retryable subprocess/IO
//! failures from precondition violations the caller must fix.

use std::collections::HashMap;
use std::fmt;

/// Result alias used throughout the crate.
pub type RalphResult<T> = Result<T, RalphError>;

/// Errors surfaced by the orchestrator core.
#[derive(Debug, thiserror::Error)]
pub enum RalphError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("branch {branch} already has an active execution")]
    BranchExists { branch: String },

    #[error("execution {branch} is not ready (status is {actual}, expected ready)")]
    NotReady { branch: String, actual: String },

    #[error("global concurrency limit reached {running}/{max}")]
    ConcurrencyLimitReached { running: u32, max: u32 },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("story not found: {execution_id}/{story_id}")]
    StoryNotFound {
        execution_id: String,
        story_id: String,
    },

    #[error("merge queue item not found: {0}")]
    MergeQueueItemNotFound(i64),

    #[error("scope guardrail rejected: {reason}")]
    GuardrailRejected { reason: String },

    #[error("{subsystem} failed: {message}")]
    ExternalFailure { subsystem: String, message: String },

    #[error("state document is corrupt: {message}")]
    Corruption { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RalphError {
    pub fn external(subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalFailure {
            subsystem: subsystem.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation might succeed without caller
    /// intervention (transient IO/subprocess failures), as opposed to a
    /// precondition the caller must fix before retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::ExternalFailure { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock") || lower.contains("timeout") || lower.contains("connection")
            }
            _ => false,
        }
    }

    /// Which of the six surface categories this error belongs to.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. }
            | Self::BranchExists { .. }
            | Self::NotReady { .. }
            | Self::ConcurrencyLimitReached { .. } => "precondition_failed",
            Self::ExecutionNotFound(_) | Self::StoryNotFound { .. } | Self::MergeQueueItemNotFound(_) => {
                "not_found"
            }
            Self::GuardrailRejected { .. } => "guardrail_rejected",
            Self::ExternalFailure { .. } | Self::Io(_) => "external_failure",
            Self::Corruption { .. } | Self::Json(_) => "corruption",
        }
    }

    /// Render as a machine-readable structured error for RPC surfaces
    /// that want a code/message/context triple instead of a Display string.
    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: self.category().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            context: HashMap::new(),
        }
    }
}

/// Machine-friendly rendering of a `RalphError`, suitable for embedding
/// in an RPC response body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StructuredError {
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
