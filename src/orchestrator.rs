//! The RPC surface (`spec.md` §6): a thin façade binding the seven
//! core components together behind the eight transport-agnostic
//! operations a caller (CLI, RPC server, whatever) drives this crate
//! through. None of the components above know about each other except
//! through this module.

use crate::collaborators::git::GitCollaborator;
use crate::collaborators::launcher::AgentLauncher;
use crate::collaborators::notifier::Notifier;
use crate::collaborators::prd::PrdParser;
use crate::dependency::resolve_dependencies;
use crate::error::{RalphError, RalphResult};
use crate::model::{ConflictStrategy, Execution, ExecutionStatus, MergeQueueItem, MergeQueueStatus, UserStory};
use crate::pipeline::{UpdateOutcome, UpdatePipeline, UpdateRequest};
use crate::reconciler::{ReconcileAction, Reconciler};
use crate::scheduler::{MemoryEstimator, Scheduler};
use crate::stale::{check_staleness, infer_task_type, LivenessSignals};
use crate::state::StateStore;
use chrono::Utc;
use std::path::{Path, PathBuf};

pub struct StartRequest {
    pub project: String,
    pub prd_path: PathBuf,
    pub project_root: PathBuf,
    pub worktree: Option<PathBuf>,
    pub on_conflict: ConflictStrategy,
    pub auto_merge: bool,
    pub notify_on_complete: bool,
}

pub struct StartResponse {
    pub execution_id: String,
    pub branch: String,
    pub stories: Vec<UserStory>,
}

#[derive(Default)]
pub struct StatusRequest {
    pub project: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub reconcile: bool,
    pub history_limit: usize,
}

pub struct ExecutionView {
    pub execution: Execution,
    pub stories: Vec<UserStory>,
}

pub struct StatusResponse {
    pub executions: Vec<ExecutionView>,
    pub pending_count: usize,
    pub running_count: usize,
    pub completed_count: usize,
    pub recent_archive: Vec<Execution>,
    pub reconcile_actions: Vec<ReconcileAction>,
}

pub enum MergeAction {
    List,
    Enqueue { execution_id: String },
    Process { id: i64 },
    Remove { id: i64 },
}

pub enum MergeResponse {
    List(Vec<MergeQueueItem>),
    Item(MergeQueueItem),
    Removed,
}

/// Binds the state store and every external collaborator. Construct
/// once per process; every RPC method borrows `self`.
pub struct Orchestrator<'a> {
    store: &'a StateStore,
    git: &'a dyn GitCollaborator,
    launcher: &'a dyn AgentLauncher,
    prd_parser: &'a dyn PrdParser,
    notifier: &'a dyn Notifier,
    memory: &'a dyn MemoryEstimator,
    branch_prefix: String,
    prd_dir: PathBuf,
    tasks_dir: PathBuf,
}

impl<'a> Orchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a StateStore,
        git: &'a dyn GitCollaborator,
        launcher: &'a dyn AgentLauncher,
        prd_parser: &'a dyn PrdParser,
        notifier: &'a dyn Notifier,
        memory: &'a dyn MemoryEstimator,
        branch_prefix: impl Into<String>,
        prd_dir: impl Into<PathBuf>,
        tasks_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            git,
            launcher,
            prd_parser,
            notifier,
            memory,
            branch_prefix: branch_prefix.into(),
            prd_dir: prd_dir.into(),
            tasks_dir: tasks_dir.into(),
        }
    }

    fn pipeline(&self) -> UpdatePipeline<'_> {
        UpdatePipeline::new(
            self.store,
            self.git,
            self.prd_parser,
            self.notifier,
            self.branch_prefix.clone(),
            self.prd_dir.clone(),
            self.tasks_dir.clone(),
        )
    }

    /// `start(...)` (`spec.md` §6): parse the PRD, create the
    /// execution and its stories atomically, and (dependencies
    /// permitting) stand up a worktree.
    pub fn start(&self, request: StartRequest) -> RalphResult<StartResponse> {
        let prd = self.prd_parser.parse(&request.prd_path)?;
        let branch = if prd.branch_name.is_empty() {
            format!("{}/{}", self.branch_prefix, request.prd_path.file_stem().and_then(|s| s.to_str()).unwrap_or("execution"))
        } else {
            prd.branch_name.clone()
        };

        if self.store.find_by_branch(&branch)?.is_some() {
            return Err(RalphError::BranchExists { branch });
        }

        let base_commit_sha = self.git.head_sha(&request.project_root).unwrap_or_default();
        let now = Utc::now();
        let id = format!("{}-{}", request.project, branch.replace('/', "-"));

        let mut execution = Execution::new(
            id.as_str(),
            request.project.as_str(),
            branch.as_str(),
            request.prd_path.to_string_lossy().into_owned(),
            request.project_root.to_string_lossy().into_owned(),
            base_commit_sha,
            now,
        )
            .with_description(prd.description.clone())
            .with_auto_merge(request.auto_merge)
            .with_notify_on_complete(request.notify_on_complete)
            .with_priority(prd.priority)
            .with_dependencies(prd.dependencies.clone());
        execution.conflict_strategy = request.on_conflict;

        let worktree_path = request
            .worktree
            .clone()
            .unwrap_or_else(|| crate::collaborators::git::default_worktree_path(&request.project_root, &branch));

        let resolution = resolve_dependencies(&execution, &self.branch_prefix, &self.prd_dir, &self.tasks_dir, self.prd_parser, &self.store.list_executions()?, &[]);

        if resolution.satisfied {
            self.git.create_worktree(&branch, &worktree_path)?;
            execution.worktree_path = Some(worktree_path.to_string_lossy().to_string());
            execution.status = ExecutionStatus::Ready;
        }

        let stories: Vec<UserStory> = prd
            .user_stories
            .iter()
            .map(|s| UserStory::new(execution.id.as_str(), s.story_id.as_str(), s.title.as_str(), s.acceptance_criteria.clone(), s.priority))
            .collect();
        let (inserted, stories) = self.store.insert_execution_atomic(execution, stories)?;

        Ok(StartResponse {
            execution_id: inserted.id,
            branch: inserted.branch,
            stories,
        })
    }

    /// `status(...)` (`spec.md` §6): optionally reconcile first, then
    /// return the filtered per-execution view plus summary counts.
    pub fn status(&self, request: StatusRequest) -> RalphResult<StatusResponse> {
        let reconcile_actions = if request.reconcile {
            Reconciler::new(self.store, self.git).with_prd_parser(self.prd_parser).reconcile()
        } else {
            Vec::new()
        };

        let all = self.store.list_executions()?;
        let filtered: Vec<&Execution> = all
            .iter()
            .filter(|e| request.project.as_deref().map_or(true, |p| e.project == p))
            .filter(|e| request.status.map_or(true, |s| e.status == s))
            .collect();

        let mut executions = Vec::with_capacity(filtered.len());
        for execution in filtered {
            let stories = self.store.stories_for(&execution.id)?;
            executions.push(ExecutionView {
                execution: execution.clone(),
                stories,
            });
        }

        let pending_count = all.iter().filter(|e| e.status == ExecutionStatus::Pending).count();
        let running_count = all.iter().filter(|e| e.status == ExecutionStatus::Running).count();
        let completed_count = all.iter().filter(|e| e.status == ExecutionStatus::Completed).count();

        let history_limit = if request.history_limit == 0 { 10 } else { request.history_limit };
        let recent_archive = self
            .store
            .list_archived_executions()?
            .into_iter()
            .take(history_limit)
            .collect::<Vec<_>>();

        Ok(StatusResponse {
            executions,
            pending_count,
            running_count,
            completed_count,
            recent_archive,
            reconcile_actions,
        })
    }

    /// `update(...)` (`spec.md` §4.6): delegates entirely to C6.
    pub fn update(&self, request: UpdateRequest) -> RalphResult<UpdateOutcome> {
        self.pipeline().update(request)
    }

    /// `stop({branch, deleteRecord?})` (`spec.md` §6).
    pub fn stop(&self, branch: &str, delete_record: bool) -> RalphResult<()> {
        let execution = self
            .store
            .find_by_branch(branch)?
            .ok_or_else(|| RalphError::ExecutionNotFound(branch.to_string()))?;
        self.store
            .update_execution(&execution.id, crate::state::ExecutionPatch::new().status(ExecutionStatus::Stopped))?;
        if delete_record {
            self.store.archive_execution(&execution.id)?;
        }
        Ok(())
    }

    /// `retry({branch, hint?})` (`spec.md` §6): only valid from
    /// `failed`/`stopped`/`interrupted`, resets stagnation counters.
    pub fn retry(&self, branch: &str, hint: Option<String>) -> RalphResult<Execution> {
        let execution = self
            .store
            .find_by_branch(branch)?
            .ok_or_else(|| RalphError::ExecutionNotFound(branch.to_string()))?;
        if !matches!(
            execution.status,
            ExecutionStatus::Failed | ExecutionStatus::Stopped | ExecutionStatus::Interrupted
        ) {
            return Err(RalphError::NotReady {
                branch: branch.to_string(),
                actual: execution.status.to_string(),
            });
        }
        let mut activity = execution.activity.clone();
        if let Some(hint) = hint {
            activity.current_step = Some(hint);
        }
        self.store.update_execution(
            &execution.id,
            crate::state::ExecutionPatch::new()
                .status(ExecutionStatus::Ready)
                .loop_counters(crate::model::LoopCounters::default())
                .activity(activity),
        )
    }

    /// `merge({action, ...})` (`spec.md` §6): list/enqueue/process/remove.
    pub fn merge(&self, action: MergeAction) -> RalphResult<MergeResponse> {
        match action {
            MergeAction::List => Ok(MergeResponse::List(self.store.list_merge_queue()?)),
            MergeAction::Enqueue { execution_id } => Ok(MergeResponse::Item(self.store.enqueue_merge(&execution_id)?)),
            MergeAction::Remove { id } => {
                self.store.remove_from_merge_queue(id)?;
                Ok(MergeResponse::Removed)
            }
            MergeAction::Process { id } => {
                let item = self.store.set_merge_queue_status(id, MergeQueueStatus::Merging)?;
                let execution = self
                    .store
                    .find_by_id(&item.execution_id)?
                    .ok_or_else(|| RalphError::ExecutionNotFound(item.execution_id.clone()))?;
                // `completed -> merging -> merged` is the only legal path
                // through the transition table; this call is what moves
                // the execution into `merging` before attempting the merge.
                self.store
                    .update_execution(&execution.id, crate::state::ExecutionPatch::new().status(ExecutionStatus::Merging))?;
                let worktree = execution
                    .worktree_path
                    .as_deref()
                    .map(Path::new)
                    .ok_or_else(|| RalphError::external("merge", "execution has no worktree"))?;
                let outcome = self.git.merge(worktree, "main", None)?;
                if outcome.success {
                    self.store.update_execution(
                        &execution.id,
                        crate::state::ExecutionPatch::new()
                            .status(ExecutionStatus::Merged)
                            .merge_metadata(crate::model::MergeMetadata {
                                merged_at: Some(Utc::now()),
                                merge_commit_sha: outcome.commit_sha,
                                reconcile_reason: None,
                            }),
                    )?;
                    self.store.archive_execution(&execution.id)?;
                    let processed = self.store.set_merge_queue_status(id, MergeQueueStatus::Completed)?;
                    Ok(MergeResponse::Item(processed))
                } else {
                    self.store
                        .update_execution(&execution.id, crate::state::ExecutionPatch::new().status(ExecutionStatus::Failed))?;
                    let _ = self.git.abort_merge(worktree);
                    let failed = self.store.set_merge_queue_status(id, MergeQueueStatus::Failed)?;
                    Ok(MergeResponse::Item(failed))
                }
            }
        }
    }

    /// `claimReady({branch})` (`spec.md` §6): exposed so an external
    /// runner can CAS directly without going through `tick`.
    pub fn claim_ready(&self, branch: &str) -> RalphResult<Execution> {
        self.store.claim_ready_execution(branch)
    }

    /// Run one scheduling pass, launching as many ready executions as
    /// capacity allows (`spec.md` §4.5). Not itself one of the eight
    /// named RPCs, but the operation the orchestrator's own scheduling
    /// loop drives.
    pub fn tick(&self, project: Option<&str>) -> RalphResult<Vec<String>> {
        Scheduler::new(self.store, self.launcher, self.memory).tick(project)
    }

    /// Drive reconcile + scheduling on a fixed interval until `stop` is
    /// set (`spec.md` §5: "Scheduling model: cooperative within a
    /// single orchestrator process (task-based)"). Grounded on the
    /// teacher's `slurm::Endpoint::wait_for_ready` poll loop
    /// (`tokio::time::sleep` between checks), generalized from
    /// wait-until-ready into a perpetual reconcile-then-tick loop --
    /// the one place this otherwise synchronous core actually suspends
    /// cooperatively between passes rather than blocking a caller.
    pub async fn run_scheduling_loop(
        &self,
        project: Option<&str>,
        interval: std::time::Duration,
        stop: &std::sync::atomic::AtomicBool,
    ) {
        use std::sync::atomic::Ordering;
        while !stop.load(Ordering::Relaxed) {
            Reconciler::new(self.store, self.git).with_prd_parser(self.prd_parser).reconcile();
            if let Err(e) = self.tick(project) {
                tracing::warn!(error = %e, "scheduling tick failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// `shutdown({force?})` (`spec.md` §6): refuses while any execution
    /// is `running` unless forced.
    pub fn shutdown(&self, force: bool) -> RalphResult<()> {
        if !force {
            let running = self
                .store
                .list_executions()?
                .into_iter()
                .filter(|e| e.status == ExecutionStatus::Running)
                .map(|e| e.branch)
                .collect::<Vec<_>>();
            if !running.is_empty() {
                return Err(RalphError::external(
                    "shutdown",
                    format!("executions still running: {}", running.join(", ")),
                ));
            }
        }
        Ok(())
    }

    /// Liveness view for a single execution, used by `status` callers
    /// that want the raw verdict rather than a reconciled side effect.
    pub fn staleness_of(&self, execution: &Execution) -> crate::stale::StaleVerdict {
        let worktree = execution.worktree_path.as_deref().map(Path::new);
        let git_head_commit_ms = worktree.and_then(|w| self.git.head_commit_time(w).ok()).map(|d| d.timestamp_millis());
        let signals = LivenessSignals {
            state_updated_at_ms: Some(execution.updated_at.timestamp_millis()),
            git_head_commit_ms,
            changed_files_max_mtime_ms: None,
            log_mtime_ms: None,
        };
        let task_type = infer_task_type(execution.activity.current_step.as_deref(), None, execution.loop_counters.last_error.as_deref());
        check_staleness(signals, task_type, None, Utc::now())
    }
}
