//! C2 — Stagnation Detector (`spec.md` §4.2).
//!
//! Grounded on `escalation::state::EscalationState::record_iteration`'s
//! progress rule ("progress if error count decreased OR categories
//! changed; first iteration always counts") and its capped sliding
//! window of recent error categories. Here there is a single error
//! string rather than a category list, so the "changed" comparison is
//! a simple inequality, but the advance-only-if-improved shape is the
//! same.

use crate::model::{Execution, ExecutionStatus, LoopCounters};
use chrono::{DateTime, Utc};

/// Default threshold for `consecutiveNoProgress` (`spec.md` §4.2 step 7).
pub const DEFAULT_NO_PROGRESS_THRESHOLD: u32 = 3;
/// Default threshold for `consecutiveErrors` (`spec.md` §4.2 step 8).
pub const DEFAULT_SAME_ERROR_THRESHOLD: u32 = 5;
/// Default multiplier for the max-loops verdict (`spec.md` §4.2 step 9).
pub const DEFAULT_MAX_LOOPS_PER_STORY: u32 = 10;

/// Why an execution was judged stagnant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagnationKind {
    NoProgress,
    RepeatedError,
    MaxLoops,
}

/// Non-exceptional outcome of a loop-result recording, per `spec.md`
/// §7: "returned as a domain result (not an exception)".
#[derive(Debug, Clone)]
pub enum StagnationVerdict {
    Progressing,
    Completed,
    Stagnant(StagnationKind),
}

/// External, already-reduced liveness signals the caller gathers from
/// git/filesystem/log sources (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalProgressSignals {
    pub git_head_commit_ms: Option<i64>,
    pub changed_files_max_mtime_ms: Option<i64>,
    pub log_mtime_ms: Option<i64>,
}

/// Per-call overrides for thresholds and the no-progress timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagnationOptions {
    pub no_progress_threshold: Option<u32>,
    pub same_error_threshold: Option<u32>,
    pub max_loops_per_story: Option<u32>,
    pub no_progress_timeout_ms: Option<i64>,
}

/// `recordLoopResult`'s effect on an execution, expressed as the
/// post-mutation loop counters/timestamp plus the verdict, so callers
/// can decide how to persist it (the detector itself is pure -- see
/// module doc).
pub struct RecordedLoop {
    pub loop_counters: LoopCounters,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub new_status: Option<ExecutionStatus>,
    pub verdict: StagnationVerdict,
}

/// `checkStagnation` is a read-only evaluator (`spec.md` §4.2
/// "Purity"); dashboards use it without mutating anything.
pub fn check_stagnation(
    execution: &Execution,
    pending_story_count: u32,
    options: StagnationOptions,
) -> StagnationVerdict {
    let no_progress_threshold = options.no_progress_threshold.unwrap_or(DEFAULT_NO_PROGRESS_THRESHOLD);
    let same_error_threshold = options.same_error_threshold.unwrap_or(DEFAULT_SAME_ERROR_THRESHOLD);
    let max_loops_per_story = options.max_loops_per_story.unwrap_or(DEFAULT_MAX_LOOPS_PER_STORY);

    let counters = &execution.loop_counters;
    if counters.consecutive_no_progress >= no_progress_threshold {
        let timeout_ok = match options.no_progress_timeout_ms {
            None => true,
            Some(timeout_ms) => match execution.last_progress_at {
                Some(last) => Utc::now().signed_duration_since(last).num_milliseconds() >= timeout_ms,
                None => true,
            },
        };
        if timeout_ok {
            return StagnationVerdict::Stagnant(StagnationKind::NoProgress);
        }
    }
    if counters.consecutive_errors >= same_error_threshold {
        return StagnationVerdict::Stagnant(StagnationKind::RepeatedError);
    }
    if counters.loop_count >= max_loops_per_story * pending_story_count.max(1) {
        return StagnationVerdict::Stagnant(StagnationKind::MaxLoops);
    }
    StagnationVerdict::Progressing
}

/// `recordLoopResult`: the mutator. `files_changed`/`error`/`signals`
/// come from the caller's loop report; `all_stories_pass` is computed
/// by the caller from the current story set so this function stays
/// free of any store dependency.
#[allow(clippy::too_many_arguments)]
pub fn record_loop_result(
    execution: &Execution,
    files_changed: u32,
    error: Option<&str>,
    all_stories_pass: bool,
    pending_story_count: u32,
    signals: ExternalProgressSignals,
    options: StagnationOptions,
) -> RecordedLoop {
    let now = Utc::now();
    let now_ms = now.timestamp_millis();

    let mut counters = execution.loop_counters.clone();
    counters.loop_count += 1;
    counters.last_files_changed = files_changed;

    let signal_ms = [
        if files_changed > 0 { now_ms } else { 0 },
        signals.git_head_commit_ms.unwrap_or(0),
        signals.changed_files_max_mtime_ms.unwrap_or(0),
        signals.log_mtime_ms.unwrap_or(0),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    let previous_last_progress_at = execution.last_progress_at;
    let previous_ms = previous_last_progress_at.map(|d| d.timestamp_millis());

    let new_last_progress_at = match previous_last_progress_at {
        None => Some(ms_to_datetime(if signal_ms > 0 { signal_ms } else { now_ms })),
        Some(previous) => {
            if signal_ms > previous.timestamp_millis() {
                Some(ms_to_datetime(signal_ms))
            } else {
                Some(previous)
            }
        }
    };

    let progressed = match previous_ms {
        None => true,
        Some(previous) => signal_ms > previous,
    };
    if progressed {
        counters.consecutive_no_progress = 0;
    } else {
        counters.consecutive_no_progress += 1;
    }

    match error {
        Some(err) => {
            if counters.last_error.as_deref() == Some(err) {
                counters.consecutive_errors += 1;
            } else {
                counters.consecutive_errors = 1;
                counters.last_error = Some(err.to_string());
            }
        }
        None => {
            counters.consecutive_errors = 0;
            counters.last_error = None;
        }
    }

    if all_stories_pass {
        return RecordedLoop {
            loop_counters: counters,
            last_progress_at: new_last_progress_at,
            new_status: Some(ExecutionStatus::Completed),
            verdict: StagnationVerdict::Completed,
        };
    }

    let mut synthetic = execution.clone();
    synthetic.loop_counters = counters.clone();
    synthetic.last_progress_at = new_last_progress_at;
    let verdict = check_stagnation(&synthetic, pending_story_count, options);

    let new_status = match verdict {
        StagnationVerdict::Stagnant(_) => Some(ExecutionStatus::Failed),
        _ => None,
    };

    RecordedLoop {
        loop_counters: counters,
        last_progress_at: new_last_progress_at,
        new_status,
        verdict,
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Execution;

    fn execution() -> Execution {
        Execution::new("e1", "proj", "ralph/a", "prd.md", "/repo", "abc", Utc::now())
    }

    #[test]
    fn first_loop_always_counts_as_progress() {
        let exec = execution();
        let recorded = record_loop_result(
            &exec,
            0,
            None,
            false,
            1,
            ExternalProgressSignals::default(),
            StagnationOptions::default(),
        );
        assert_eq!(recorded.loop_counters.consecutive_no_progress, 0);
        assert!(matches!(recorded.verdict, StagnationVerdict::Progressing));
    }

    #[test]
    fn three_no_progress_loops_trip_the_verdict() {
        let mut exec = execution();
        for i in 0..3 {
            let recorded = record_loop_result(
                &exec,
                0,
                None,
                false,
                1,
                ExternalProgressSignals::default(),
                StagnationOptions::default(),
            );
            exec.loop_counters = recorded.loop_counters.clone();
            exec.last_progress_at = recorded.last_progress_at;
            if i == 2 {
                assert!(matches!(
                    recorded.verdict,
                    StagnationVerdict::Stagnant(StagnationKind::NoProgress)
                ));
                assert_eq!(recorded.new_status, Some(ExecutionStatus::Failed));
            }
        }
    }

    #[test]
    fn repeated_identical_errors_trip_repeated_error_verdict() {
        let mut exec = execution();
        let mut recorded = None;
        for _ in 0..5 {
            let r = record_loop_result(
                &exec,
                1,
                Some("boom"),
                false,
                1,
                ExternalProgressSignals::default(),
                StagnationOptions::default(),
            );
            exec.loop_counters = r.loop_counters.clone();
            exec.last_progress_at = r.last_progress_at;
            recorded = Some(r);
        }
        assert!(matches!(
            recorded.unwrap().verdict,
            StagnationVerdict::Stagnant(StagnationKind::RepeatedError)
        ));
    }

    #[test]
    fn all_stories_pass_short_circuits_to_completed() {
        let exec = execution();
        let recorded = record_loop_result(
            &exec,
            3,
            None,
            true,
            0,
            ExternalProgressSignals::default(),
            StagnationOptions::default(),
        );
        assert!(matches!(recorded.verdict, StagnationVerdict::Completed));
        assert_eq!(recorded.new_status, Some(ExecutionStatus::Completed));
    }

    #[test]
    fn loop_count_never_below_either_counter() {
        let mut exec = execution();
        for _ in 0..4 {
            let r = record_loop_result(
                &exec,
                0,
                Some("boom"),
                false,
                1,
                ExternalProgressSignals::default(),
                StagnationOptions::default(),
            );
            exec.loop_counters = r.loop_counters.clone();
            exec.last_progress_at = r.last_progress_at;
        }
        assert!(exec.loop_counters.loop_count >= exec.loop_counters.consecutive_no_progress);
        assert!(exec.loop_counters.loop_count >= exec.loop_counters.consecutive_errors);
    }
}
