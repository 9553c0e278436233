//! C5 — Scheduler / Claimer (`spec.md` §4.5).
//!
//! Selection ordering is a plain derived `sort_by_key` over a tuple
//! rather than a bespoke `Ord` impl, matching the teacher's preference
//! for deriving comparisons from timestamp fields directly
//! (`state::types`'s session listings) rather than introducing a
//! comparator type for a one-off sort.

use crate::collaborators::launcher::AgentLauncher;
use crate::error::RalphResult;
use crate::model::{Execution, ExecutionStatus, Priority};
use crate::state::{ExecutionPatch, StateStore};
use std::path::Path;

/// Maximum launch attempts before an execution is given up on and
/// moved to `failed` (`spec.md` §4.5, §8).
pub const MAX_LAUNCH_ATTEMPTS: u32 = 3;

/// Estimates how many more agents the host can run concurrently,
/// independent of the configured cap (`spec.md` §4.5: "memory-aware
/// effective cap"). A narrow interface the same way git/launcher are,
/// so tests can substitute a fixed value instead of reading `/proc`.
pub trait MemoryEstimator: Send + Sync {
    fn estimated_capacity(&self) -> u32;
}

/// Reads `/proc/meminfo` on Linux; elsewhere (or on read failure)
/// reports an optimistic uncapped estimate so memory pressure is only
/// ever a Linux-specific guardrail, not a portability hazard.
pub struct ProcMeminfoEstimator {
    pub reserve_mb: u64,
    pub per_agent_mb: u64,
}

impl Default for ProcMeminfoEstimator {
    fn default() -> Self {
        Self {
            reserve_mb: 512,
            per_agent_mb: 512,
        }
    }
}

impl MemoryEstimator for ProcMeminfoEstimator {
    #[cfg(target_os = "linux")]
    fn estimated_capacity(&self) -> u32 {
        let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
            return u32::MAX;
        };
        let available_kb = contents
            .lines()
            .find(|l| l.starts_with("MemAvailable:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok());
        let Some(available_kb) = available_kb else {
            return u32::MAX;
        };
        let available_mb = available_kb / 1024;
        let usable_mb = available_mb.saturating_sub(self.reserve_mb);
        (usable_mb / self.per_agent_mb.max(1)) as u32
    }

    #[cfg(not(target_os = "linux"))]
    fn estimated_capacity(&self) -> u32 {
        u32::MAX
    }
}

fn priority_weight(priority: Priority) -> u8 {
    match priority {
        Priority::P0 => 0,
        Priority::P1 => 1,
        Priority::P2 => 2,
    }
}

/// Select `ready` executions in claim order (priority, createdAt,
/// branch), optionally filtered by project.
pub fn select_candidates(executions: &[Execution], project: Option<&str>) -> Vec<Execution> {
    let mut candidates: Vec<Execution> = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Ready)
        .filter(|e| project.map_or(true, |p| e.project == p))
        .cloned()
        .collect();
    candidates.sort_by(|a, b| {
        priority_weight(a.priority)
            .cmp(&priority_weight(b.priority))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.branch.cmp(&b.branch))
    });
    candidates
}

pub struct Scheduler<'a> {
    store: &'a StateStore,
    launcher: &'a dyn AgentLauncher,
    memory: &'a dyn MemoryEstimator,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a StateStore, launcher: &'a dyn AgentLauncher, memory: &'a dyn MemoryEstimator) -> Self {
        Self { store, launcher, memory }
    }

    /// Effective concurrency: the smaller of the memory-derived cap and
    /// the configured cap. Zero means the scheduler is paused.
    pub fn effective_concurrency(&self) -> RalphResult<u32> {
        let runner_config = self.store.runner_config()?;
        Ok(runner_config.max_concurrency.min(self.memory.estimated_capacity()))
    }

    /// One scheduling pass: claim and launch as many ready executions
    /// as capacity allows, in priority+FIFO order.
    pub fn tick(&self, project: Option<&str>) -> RalphResult<Vec<String>> {
        if self.effective_concurrency()? == 0 {
            return Ok(Vec::new());
        }

        let executions = self.store.list_executions()?;
        let candidates = select_candidates(&executions, project);

        let mut launched = Vec::new();
        for candidate in candidates {
            match self.store.claim_ready_execution(&candidate.branch) {
                Ok(claimed) => {
                    self.launch_claimed(claimed)?;
                    launched.push(candidate.branch.clone());
                }
                Err(crate::error::RalphError::ConcurrencyLimitReached { .. }) => break,
                Err(crate::error::RalphError::NotReady { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(launched)
    }

    fn launch_claimed(&self, execution: Execution) -> RalphResult<()> {
        let cwd = execution
            .worktree_path
            .clone()
            .unwrap_or_else(|| execution.project_root.clone());
        let prompt = format!("Continue work on {}", execution.branch);
        match self.launcher.launch(&prompt, Path::new(&cwd), &execution.id) {
            Ok(outcome) if outcome.success => {
                let mut activity = execution.activity.clone();
                activity.log_path = outcome.log_path;
                self.store.update_execution(
                    &execution.id,
                    ExecutionPatch::new()
                        .status(ExecutionStatus::Running)
                        .agent_task_id(outcome.agent_task_id)
                        .activity(activity),
                )?;
            }
            Ok(outcome) => self.handle_launch_failure(&execution, outcome.error)?,
            Err(e) => self.handle_launch_failure(&execution, Some(e.to_string()))?,
        }
        Ok(())
    }

    fn handle_launch_failure(&self, execution: &Execution, error: Option<String>) -> RalphResult<()> {
        tracing::warn!(branch = %execution.branch, error = ?error, "agent launch failed");
        if execution.launch_recovery.launch_attempts >= MAX_LAUNCH_ATTEMPTS {
            self.store
                .update_execution(&execution.id, ExecutionPatch::new().status(ExecutionStatus::Failed))?;
        } else {
            self.store
                .update_execution(&execution.id, ExecutionPatch::new().status(ExecutionStatus::Ready))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeLauncher;
    use crate::config::Config;
    use crate::model::RunnerConfig;
    use chrono::Utc;
    use tempfile::tempdir;

    struct FixedMemory(u32);
    impl MemoryEstimator for FixedMemory {
        fn estimated_capacity(&self) -> u32 {
            self.0
        }
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        (dir, StateStore::open(config).unwrap())
    }

    #[test]
    fn picks_p0_before_p1_before_p2() {
        let now = Utc::now();
        let mut low = Execution::new("1", "proj", "ralph/low", "p", "/r", "s", now);
        low.status = ExecutionStatus::Ready;
        low.priority = Priority::P2;
        let mut high = Execution::new("2", "proj", "ralph/high", "p", "/r", "s", now);
        high.status = ExecutionStatus::Ready;
        high.priority = Priority::P0;

        let ordered = select_candidates(&[low, high], None);
        assert_eq!(ordered[0].branch, "ralph/high");
    }

    #[test]
    fn tick_launches_ready_executions_up_to_cap() {
        let (_dir, store) = store();
        store.set_runner_config(RunnerConfig::new(1, Utc::now(), None)).unwrap();
        let mut exec = Execution::new("1", "proj", "ralph/a", "p", "/repo", "s", Utc::now());
        exec.status = ExecutionStatus::Pending;
        let inserted = store.insert_execution(exec).unwrap();
        store
            .update_execution(&inserted.id, ExecutionPatch::new().status(ExecutionStatus::Ready))
            .unwrap();

        let launcher = FakeLauncher::default();
        let memory = FixedMemory(u32::MAX);
        let scheduler = Scheduler::new(&store, &launcher, &memory);
        let launched = scheduler.tick(None).unwrap();
        assert_eq!(launched, vec!["ralph/a".to_string()]);
        let after = store.find_by_branch("ralph/a").unwrap().unwrap();
        assert_eq!(after.status, ExecutionStatus::Running);
    }

    #[test]
    fn zero_effective_concurrency_pauses_scheduling() {
        let (_dir, store) = store();
        let launcher = FakeLauncher::default();
        let memory = FixedMemory(0);
        let scheduler = Scheduler::new(&store, &launcher, &memory);
        let launched = scheduler.tick(None).unwrap();
        assert!(launched.is_empty());
    }
}
