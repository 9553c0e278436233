//! C3 — Stale/Interrupt Detector (`spec.md` §4.3).
//!
//! Grounded on `escalation::state::TurnPolicy::for_tier`'s pattern of
//! looking up a timeout from a small enum rather than hard-coding it
//! inline, generalized from "tier" to "inferred task type". The git
//! signal itself is grounded on
//! `harness::git_manager::GitManager::recent_commits`'s committer-date
//! extraction.

use chrono::{DateTime, Utc};

/// Task type inferred from `currentStep` plus free text, each with its
/// own timeout. Ordering is the one thing `spec.md` §9's Open Question
/// pins down: "implementing < building < testing < verifying".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Implementing,
    Building,
    Testing,
    Verifying,
    Unknown,
}

impl TaskType {
    /// Chosen empirically per `spec.md` §9's Open Question; only the
    /// relative ordering is mandated by the spec, these absolute
    /// values are a deployment default meant to be overridden.
    pub fn default_timeout(self) -> Duration {
        match self {
            TaskType::Implementing => Duration::from_secs(10 * 60),
            TaskType::Building => Duration::from_secs(15 * 60),
            TaskType::Testing => Duration::from_secs(20 * 60),
            TaskType::Verifying => Duration::from_secs(25 * 60),
            // Falls back to the longest configured timeout so an
            // unrecognized step never times out prematurely.
            TaskType::Unknown => Duration::from_secs(25 * 60),
        }
    }
}

use std::time::Duration;

/// Infer a task type from the free-text activity fields an execution
/// reports. Falls back to `Unknown` when nothing matches.
pub fn infer_task_type(current_step: Option<&str>, notes: Option<&str>, last_error: Option<&str>) -> TaskType {
    let haystack = [current_step, notes, last_error]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if haystack.contains("verify") {
        TaskType::Verifying
    } else if haystack.contains("test") {
        TaskType::Testing
    } else if haystack.contains("build") || haystack.contains("compil") {
        TaskType::Building
    } else if haystack.contains("implement") || haystack.contains("writing") || haystack.contains("coding") {
        TaskType::Implementing
    } else {
        TaskType::Unknown
    }
}

/// The four reduced liveness signals (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessSignals {
    pub state_updated_at_ms: Option<i64>,
    pub git_head_commit_ms: Option<i64>,
    pub changed_files_max_mtime_ms: Option<i64>,
    pub log_mtime_ms: Option<i64>,
}

/// What the detector decided, plus enough detail for a caller (status
/// RPC, reconciler) to explain itself.
#[derive(Debug, Clone)]
pub struct StaleVerdict {
    pub is_stale: bool,
    pub idle_ms: i64,
    pub timeout_ms: i64,
    pub task_type: TaskType,
    pub signals: LivenessSignals,
}

/// Pure decision function; never mutates anything (`spec.md` §4.3:
/// "it never mutates state; the reconciler consumes the decision").
pub fn check_staleness(
    signals: LivenessSignals,
    task_type: TaskType,
    timeout_override_ms: Option<i64>,
    now: DateTime<Utc>,
) -> StaleVerdict {
    let liveness_ms = [
        signals.state_updated_at_ms,
        signals.git_head_commit_ms,
        signals.changed_files_max_mtime_ms,
        signals.log_mtime_ms,
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(0);

    let idle_ms = now.timestamp_millis() - liveness_ms;
    let timeout_ms = timeout_override_ms.unwrap_or_else(|| task_type.default_timeout().as_millis() as i64);

    StaleVerdict {
        is_stale: idle_ms >= timeout_ms,
        idle_ms,
        timeout_ms,
        task_type,
        signals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn infers_verifying_over_implementing_when_both_mentioned() {
        let task_type = infer_task_type(Some("implementing then verifying"), None, None);
        assert_eq!(task_type, TaskType::Verifying);
    }

    #[test]
    fn unknown_falls_back_to_longest_timeout() {
        let unknown_timeout = TaskType::Unknown.default_timeout();
        let verifying_timeout = TaskType::Verifying.default_timeout();
        assert_eq!(unknown_timeout, verifying_timeout);
        assert!(unknown_timeout >= TaskType::Implementing.default_timeout());
        assert!(unknown_timeout >= TaskType::Building.default_timeout());
        assert!(unknown_timeout >= TaskType::Testing.default_timeout());
    }

    #[test]
    fn stale_fires_at_exact_boundary() {
        let now = Utc::now();
        let stale_since = now - ChronoDuration::milliseconds(1000);
        let signals = LivenessSignals {
            state_updated_at_ms: Some(stale_since.timestamp_millis()),
            ..Default::default()
        };
        let verdict = check_staleness(signals, TaskType::Unknown, Some(1000), now);
        assert!(verdict.is_stale);
    }

    #[test]
    fn not_stale_just_under_timeout() {
        let now = Utc::now();
        let recent = now - ChronoDuration::milliseconds(999);
        let signals = LivenessSignals {
            state_updated_at_ms: Some(recent.timestamp_millis()),
            ..Default::default()
        };
        let verdict = check_staleness(signals, TaskType::Unknown, Some(1000), now);
        assert!(!verdict.is_stale);
    }
}
