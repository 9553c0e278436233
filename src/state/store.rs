//! Durable, lock-guarded state store (`spec.md` §4.1).
//!
//! The in-process mutex plus the cross-process `StateLock` give the
//! ordering guarantees of `spec.md` §5: every read-or-write operation
//! takes both. The write protocol (validate, backup, temp-write,
//! rename, bounded retry, bounded backup retention) is grounded on
//! `feature_registry.rs::save`/`load_with_recovery`, extended from a
//! single `.backup` sibling to an N-file rotation.

use crate::config::Config;
use crate::error::{RalphError, RalphResult};
use crate::model::*;
use crate::state::document::StateDocument;
use crate::state::lock::StateLock;
use crate::state::patch::{ExecutionPatch, StoryPatch};
use crate::state::transitions::can_transition;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const MAX_WRITE_RETRIES: u32 = 6;
const WRITE_RETRY_BASE_DELAY_MS: u64 = 20;

pub struct StateStore {
    config: Config,
    document: Mutex<StateDocument>,
}

impl StateStore {
    /// Open (or create) the store at `config.data_dir`, recovering from
    /// a corrupt primary file via the newest valid backup, per
    /// `spec.md` §7's Corruption handling: "default-empty state is
    /// returned, original file is preserved via backup".
    pub fn open(config: Config) -> RalphResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let _lock = StateLock::acquire(config.lock_path())?;
        let document = Self::load_with_recovery(&config.state_path());
        Ok(Self {
            config,
            document: Mutex::new(document),
        })
    }

    fn load_with_recovery(path: &Path) -> StateDocument {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(doc) => return doc,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "state document corrupt, falling back to backups");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StateDocument::empty(),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "could not read state document");
            }
        }

        for backup in Self::backups_newest_first(path) {
            if let Ok(contents) = std::fs::read_to_string(&backup) {
                if let Ok(doc) = serde_json::from_str::<StateDocument>(&contents) {
                    tracing::warn!(backup = %backup.display(), "recovered state document from backup");
                    return doc;
                }
            }
        }

        tracing::error!(path = %path.display(), "no valid state document or backup found, starting empty");
        StateDocument::empty()
    }

    fn backups_newest_first(state_path: &Path) -> Vec<PathBuf> {
        let dir = match state_path.parent() {
            Some(d) => d,
            None => return Vec::new(),
        };
        let stem = state_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state.json")
            .to_string();
        let prefix = format!("{stem}.backup-");
        let mut backups: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let suffix = name.strip_prefix(&prefix)?;
                let millis: u64 = suffix.parse().ok()?;
                Some((millis, entry.path()))
            })
            .collect();
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        backups.into_iter().map(|(_, path)| path).collect()
    }

    /// Run `f` with exclusive access to the document, persisting the
    /// result if `f` returns `Ok`. On a persistence failure the
    /// in-memory mutation is rolled back by reloading from disk
    /// (`spec.md` §7: "State Store always rolls back in-memory
    /// mutations if the persistent write fails").
    fn with_write<T>(&self, f: impl FnOnce(&mut StateDocument) -> RalphResult<T>) -> RalphResult<T> {
        let _lock = StateLock::acquire(self.config.lock_path())?;
        let mut guard = self.document.lock().expect("state mutex poisoned");
        let mut working = guard.clone();
        let result = f(&mut working)?;
        match self.persist(&working) {
            Ok(()) => {
                *guard = working;
                Ok(result)
            }
            Err(e) => {
                *guard = Self::load_with_recovery(&self.config.state_path());
                Err(e)
            }
        }
    }

    fn with_read<T>(&self, f: impl FnOnce(&StateDocument) -> T) -> RalphResult<T> {
        let _lock = StateLock::acquire(self.config.lock_path())?;
        let guard = self.document.lock().expect("state mutex poisoned");
        Ok(f(&guard))
    }

    fn persist(&self, document: &StateDocument) -> RalphResult<()> {
        let content = serde_json::to_string_pretty(document)?;
        // Validate before touching anything on disk.
        serde_json::from_str::<StateDocument>(&content)?;

        let state_path = self.config.state_path();
        self.backup_if_parseable(&state_path)?;

        let temp_path = state_path.with_extension("json.tmp");
        let mut attempt = 0;
        loop {
            match std::fs::write(&temp_path, &content).and_then(|_| std::fs::rename(&temp_path, &state_path)) {
                Ok(()) => break,
                Err(e) if attempt < MAX_WRITE_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(WRITE_RETRY_BASE_DELAY_MS * (1 << attempt)));
                    tracing::warn!(error = %e, attempt, "retrying state document write");
                }
                Err(e) => return Err(RalphError::Io(e)),
            }
        }

        self.evict_old_backups(&state_path)?;
        Ok(())
    }

    fn backup_if_parseable(&self, state_path: &Path) -> RalphResult<()> {
        let Ok(contents) = std::fs::read_to_string(state_path) else {
            return Ok(());
        };
        if serde_json::from_str::<StateDocument>(&contents).is_err() {
            return Ok(());
        }
        let millis = Utc::now().timestamp_millis();
        let backup_name = format!(
            "{}.backup-{}",
            state_path.file_name().and_then(|n| n.to_str()).unwrap_or("state.json"),
            millis
        );
        let backup_path = state_path.with_file_name(backup_name);
        if let Err(e) = std::fs::write(&backup_path, &contents) {
            tracing::warn!(error = %e, "failed to write state document backup, continuing anyway");
        }
        Ok(())
    }

    fn evict_old_backups(&self, state_path: &Path) -> RalphResult<()> {
        let backups = Self::backups_newest_first(state_path);
        for stale in backups.into_iter().skip(self.config.max_backups) {
            let _ = std::fs::remove_file(stale);
        }
        Ok(())
    }

    // ---- reads ----

    pub fn list_executions(&self) -> RalphResult<Vec<Execution>> {
        self.with_read(|doc| doc.executions.clone())
    }

    pub fn find_by_branch(&self, branch: &str) -> RalphResult<Option<Execution>> {
        self.with_read(|doc| doc.executions.iter().find(|e| e.branch == branch).cloned())
    }

    pub fn find_by_id(&self, id: &str) -> RalphResult<Option<Execution>> {
        self.with_read(|doc| doc.executions.iter().find(|e| e.id == id).cloned())
    }

    pub fn stories_for(&self, execution_id: &str) -> RalphResult<Vec<UserStory>> {
        self.with_read(|doc| {
            doc.user_stories
                .iter()
                .filter(|s| s.execution_id == execution_id)
                .cloned()
                .collect()
        })
    }

    pub fn find_archived_by_branch(&self, branch: &str) -> RalphResult<Option<Execution>> {
        self.with_read(|doc| doc.archived_executions.iter().find(|e| e.branch == branch).cloned())
    }

    /// Archived executions, most-recently-updated first.
    pub fn list_archived_executions(&self) -> RalphResult<Vec<Execution>> {
        self.with_read(|doc| {
            let mut archived = doc.archived_executions.clone();
            archived.sort_by_key(|e| std::cmp::Reverse(e.updated_at));
            archived
        })
    }

    pub fn list_merge_queue(&self) -> RalphResult<Vec<MergeQueueItem>> {
        self.with_read(|doc| {
            let mut items = doc.merge_queue.clone();
            items.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
            items
        })
    }

    pub fn runner_config(&self) -> RalphResult<RunnerConfig> {
        self.with_read(|doc| doc.runner_config.clone().unwrap_or_default())
    }

    pub fn set_runner_config(&self, runner_config: RunnerConfig) -> RalphResult<()> {
        self.with_write(|doc| {
            doc.runner_config = Some(runner_config.clone());
            Ok(())
        })
    }

    // ---- execution writes ----

    pub fn insert_execution(&self, execution: Execution) -> RalphResult<Execution> {
        self.with_write(|doc| {
            if doc.executions.iter().any(|e| e.branch == execution.branch) {
                return Err(RalphError::BranchExists {
                    branch: execution.branch.clone(),
                });
            }
            doc.executions.push(execution.clone());
            Ok(execution)
        })
    }

    /// Single write: execution plus all its stories appear together or
    /// not at all (`spec.md` §4.1).
    pub fn insert_execution_atomic(
        &self,
        execution: Execution,
        stories: Vec<UserStory>,
    ) -> RalphResult<(Execution, Vec<UserStory>)> {
        self.with_write(|doc| {
            if doc.executions.iter().any(|e| e.branch == execution.branch) {
                return Err(RalphError::BranchExists {
                    branch: execution.branch.clone(),
                });
            }
            doc.executions.push(execution.clone());
            doc.user_stories.extend(stories.clone());
            Ok((execution, stories))
        })
    }

    pub fn update_execution(&self, id: &str, patch: ExecutionPatch) -> RalphResult<Execution> {
        self.with_write(|doc| {
            let exec = doc
                .executions
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| RalphError::ExecutionNotFound(id.to_string()))?;
            apply_patch(exec, patch)?;
            exec.updated_at = Utc::now();
            Ok(exec.clone())
        })
    }

    /// The only path into `starting`: atomic CAS gated on both the
    /// `ready` precondition and the global concurrency cap
    /// (`spec.md` §4.5, §8).
    pub fn claim_ready_execution(&self, branch: &str) -> RalphResult<Execution> {
        self.with_write(|doc| {
            let max_concurrency = doc.runner_config.clone().unwrap_or_default().max_concurrency;
            let occupied = doc.executions.iter().filter(|e| e.is_active_occupant()).count() as u32;
            if occupied >= max_concurrency {
                return Err(RalphError::ConcurrencyLimitReached {
                    running: occupied,
                    max: max_concurrency,
                });
            }
            let exec = doc
                .executions
                .iter_mut()
                .find(|e| e.branch == branch)
                .ok_or_else(|| RalphError::ExecutionNotFound(branch.to_string()))?;
            if exec.status != ExecutionStatus::Ready {
                return Err(RalphError::NotReady {
                    branch: branch.to_string(),
                    actual: exec.status.to_string(),
                });
            }
            let now = Utc::now();
            exec.status = ExecutionStatus::Starting;
            exec.launch_recovery.launch_attempt_at = Some(now);
            exec.launch_recovery.launch_attempts += 1;
            exec.updated_at = now;
            Ok(exec.clone())
        })
    }

    // ---- story writes ----

    pub fn upsert_story(&self, story: UserStory) -> RalphResult<UserStory> {
        self.with_write(|doc| {
            if let Some(existing) = doc
                .user_stories
                .iter_mut()
                .find(|s| s.execution_id == story.execution_id && s.story_id == story.story_id)
            {
                *existing = story.clone();
            } else {
                doc.user_stories.push(story.clone());
            }
            Ok(story)
        })
    }

    pub fn update_story(&self, execution_id: &str, story_id: &str, patch: StoryPatch) -> RalphResult<UserStory> {
        self.with_write(|doc| {
            let story = doc
                .user_stories
                .iter_mut()
                .find(|s| s.execution_id == execution_id && s.story_id == story_id)
                .ok_or_else(|| RalphError::StoryNotFound {
                    execution_id: execution_id.to_string(),
                    story_id: story_id.to_string(),
                })?;
            if let Some(passes) = patch.passes {
                story.passes = passes;
            }
            if let Some(notes) = patch.notes {
                story.notes = notes;
            }
            if let Some(evidence) = patch.ac_evidence {
                story.ac_evidence.extend(evidence);
            }
            Ok(story.clone())
        })
    }

    // ---- merge queue writes ----

    pub fn enqueue_merge(&self, execution_id: &str) -> RalphResult<MergeQueueItem> {
        self.with_write(|doc| {
            if let Some(existing) = doc.merge_queue.iter().find(|m| m.execution_id == execution_id) {
                return Ok(existing.clone());
            }
            let next_id = doc.merge_queue.iter().map(|m| m.id).max().unwrap_or(0) + 1;
            let next_position = doc.merge_queue.iter().map(|m| m.position).max().unwrap_or(0) + 1;
            let item = MergeQueueItem {
                id: next_id,
                execution_id: execution_id.to_string(),
                position: next_position,
                status: MergeQueueStatus::Pending,
                created_at: Utc::now(),
            };
            doc.merge_queue.push(item.clone());
            Ok(item)
        })
    }

    pub fn set_merge_queue_status(&self, id: i64, status: MergeQueueStatus) -> RalphResult<MergeQueueItem> {
        self.with_write(|doc| {
            let item = doc
                .merge_queue
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(RalphError::MergeQueueItemNotFound(id))?;
            item.status = status;
            Ok(item.clone())
        })
    }

    pub fn remove_from_merge_queue(&self, id: i64) -> RalphResult<()> {
        self.with_write(|doc| {
            let before = doc.merge_queue.len();
            doc.merge_queue.retain(|m| m.id != id);
            if doc.merge_queue.len() == before {
                return Err(RalphError::MergeQueueItemNotFound(id));
            }
            Ok(())
        })
    }

    // ---- archive writes ----

    /// Moves the execution and its stories into the archive, dropping
    /// any merge-queue entry, then evicts oldest archived executions
    /// past the retention cap (`spec.md` §3, §8).
    pub fn archive_execution(&self, id: &str) -> RalphResult<Execution> {
        self.with_write(|doc| {
            let idx = doc
                .executions
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| RalphError::ExecutionNotFound(id.to_string()))?;
            let execution = doc.executions.remove(idx);

            let mut moved_stories = Vec::new();
            doc.user_stories.retain(|s| {
                if s.execution_id == id {
                    moved_stories.push(s.clone());
                    false
                } else {
                    true
                }
            });
            doc.archived_user_stories.extend(moved_stories);
            doc.merge_queue.retain(|m| m.execution_id != id);
            doc.archived_executions.push(execution.clone());

            evict_archive_overflow(doc, self.config.max_archived_executions);
            Ok(execution)
        })
    }

    /// Restores a `failed`/`stopped` archived execution back into the
    /// active set, used when an update arrives for an already-archived
    /// branch (`spec.md` §4.1, §4.6 step 1).
    pub fn restore_archived_execution_by_branch(&self, branch: &str) -> RalphResult<Execution> {
        self.with_write(|doc| {
            let mut candidates: Vec<usize> = doc
                .archived_executions
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.branch == branch && matches!(e.status, ExecutionStatus::Failed | ExecutionStatus::Stopped)
                })
                .map(|(i, _)| i)
                .collect();
            candidates.sort_by(|&a, &b| {
                let ea = &doc.archived_executions[a];
                let eb = &doc.archived_executions[b];
                // Prefer failed over stopped, then most recent updatedAt.
                let rank = |e: &Execution| if e.status == ExecutionStatus::Failed { 0 } else { 1 };
                rank(ea).cmp(&rank(eb)).then(eb.updated_at.cmp(&ea.updated_at))
            });
            let idx = *candidates
                .first()
                .ok_or_else(|| RalphError::ExecutionNotFound(branch.to_string()))?;
            let execution = doc.archived_executions.remove(idx);

            let mut restored_stories = Vec::new();
            doc.archived_user_stories.retain(|s| {
                if s.execution_id == execution.id {
                    restored_stories.push(s.clone());
                    false
                } else {
                    true
                }
            });
            doc.user_stories.extend(restored_stories);
            doc.executions.push(execution.clone());
            Ok(execution)
        })
    }
}

fn evict_archive_overflow(doc: &mut StateDocument, cap: usize) {
    if doc.archived_executions.len() <= cap {
        return;
    }
    doc.archived_executions.sort_by_key(|e| {
        e.merge_metadata
            .merged_at
            .unwrap_or(e.updated_at)
    });
    let overflow = doc.archived_executions.len() - cap;
    let evicted: Vec<String> = doc
        .archived_executions
        .drain(0..overflow)
        .map(|e| e.id)
        .collect();
    doc.archived_user_stories
        .retain(|s| !evicted.contains(&s.execution_id));
}

fn apply_patch(exec: &mut Execution, patch: ExecutionPatch) -> RalphResult<()> {
    if let Some(status) = patch.status {
        if status != exec.status
            && !patch.skip_transition_validation
            && !can_transition(exec.status, status)
        {
            return Err(RalphError::InvalidTransition {
                from: exec.status.to_string(),
                to: status.to_string(),
            });
        }
        exec.status = status;
    }
    if let Some(path) = patch.worktree_path {
        exec.worktree_path = path;
    }
    if let Some(task_id) = patch.agent_task_id {
        exec.agent_task_id = task_id;
    }
    if let Some(strategy) = patch.conflict_strategy {
        exec.conflict_strategy = strategy;
    }
    if let Some(auto_merge) = patch.auto_merge {
        exec.auto_merge = auto_merge;
    }
    if let Some(notify) = patch.notify_on_complete {
        exec.notify_on_complete = notify;
    }
    if let Some(deps) = patch.dependencies {
        exec.dependencies = deps;
    }
    if let Some(counters) = patch.loop_counters {
        exec.loop_counters = counters;
    }
    if let Some(at) = patch.last_progress_at {
        exec.last_progress_at = at;
    }
    if let Some(activity) = patch.activity {
        exec.activity = activity;
    }
    if let Some(recovery) = patch.launch_recovery {
        exec.launch_recovery = recovery;
    }
    if let Some(metadata) = patch.merge_metadata {
        exec.merge_metadata = metadata;
    }
    if let Some(priority) = patch.priority {
        exec.priority = priority;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = StateStore::open(config).unwrap();
        (dir, store)
    }

    fn sample_execution(branch: &str) -> Execution {
        Execution::new("exec-1", "proj", branch, "prd.md", "/repo", "abc123", Utc::now())
    }

    #[test]
    fn insert_and_find_by_branch() {
        let (_dir, store) = store();
        store.insert_execution(sample_execution("ralph/a")).unwrap();
        let found = store.find_by_branch("ralph/a").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn duplicate_branch_is_rejected() {
        let (_dir, store) = store();
        store.insert_execution(sample_execution("ralph/a")).unwrap();
        let err = store.insert_execution(sample_execution("ralph/a")).unwrap_err();
        assert!(matches!(err, RalphError::BranchExists { .. }));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let (_dir, store) = store();
        let exec = store.insert_execution(sample_execution("ralph/a")).unwrap();
        let err = store
            .update_execution(&exec.id, ExecutionPatch::new().status(ExecutionStatus::Merged))
            .unwrap_err();
        assert!(matches!(err, RalphError::InvalidTransition { .. }));
    }

    #[test]
    fn claim_ready_execution_is_cas() {
        let (_dir, store) = store();
        let exec = store.insert_execution(sample_execution("ralph/a")).unwrap();
        store
            .update_execution(&exec.id, ExecutionPatch::new().status(ExecutionStatus::Ready))
            .unwrap();
        let claimed = store.claim_ready_execution("ralph/a").unwrap();
        assert_eq!(claimed.status, ExecutionStatus::Starting);
        assert_eq!(claimed.launch_recovery.launch_attempts, 1);

        let err = store.claim_ready_execution("ralph/a").unwrap_err();
        assert!(matches!(err, RalphError::NotReady { .. }));
    }

    #[test]
    fn claim_respects_concurrency_cap() {
        let (_dir, store) = store();
        store
            .update_execution(
                &store.insert_execution(sample_execution("ralph/occupied")).unwrap().id,
                ExecutionPatch::new().status(ExecutionStatus::Ready),
            )
            .unwrap();
        // Set cap to 1 and occupy it with a running execution.
        store
            .with_write(|doc| {
                doc.runner_config = Some(RunnerConfig::new(1, Utc::now(), None));
                Ok(())
            })
            .unwrap();
        store.claim_ready_execution("ralph/occupied").unwrap();
        store
            .update_execution(
                &store.find_by_branch("ralph/occupied").unwrap().unwrap().id,
                ExecutionPatch::new().status(ExecutionStatus::Running),
            )
            .unwrap();

        let second = store.insert_execution(sample_execution("ralph/b")).unwrap();
        store
            .update_execution(&second.id, ExecutionPatch::new().status(ExecutionStatus::Ready))
            .unwrap();
        let err = store.claim_ready_execution("ralph/b").unwrap_err();
        assert!(matches!(err, RalphError::ConcurrencyLimitReached { running: 1, max: 1 }));
    }

    #[test]
    fn archive_and_restore_round_trips_stories() {
        let (_dir, store) = store();
        let exec = store.insert_execution(sample_execution("ralph/a")).unwrap();
        store
            .upsert_story(UserStory::new(&exec.id, "US-001", "first", vec!["AC-1".into()], 1))
            .unwrap();
        store
            .update_execution(&exec.id, ExecutionPatch::new().status(ExecutionStatus::Failed))
            .unwrap();
        store.archive_execution(&exec.id).unwrap();
        assert!(store.find_by_branch("ralph/a").unwrap().is_none());
        assert!(store.find_archived_by_branch("ralph/a").unwrap().is_some());

        let restored = store.restore_archived_execution_by_branch("ralph/a").unwrap();
        assert_eq!(restored.status, ExecutionStatus::Failed);
        let stories = store.stories_for(&restored.id).unwrap();
        assert_eq!(stories.len(), 1);
    }

    #[test]
    fn archive_retention_cap_evicts_oldest() {
        let (_dir, store) = store();
        let config = Config {
            max_archived_executions: 2,
            data_dir: store_data_dir(&store),
            ..Config::default()
        };
        let capped_store = StateStore::open(config).unwrap();
        for i in 0..3 {
            let branch = format!("ralph/{i}");
            let exec = capped_store.insert_execution(sample_execution(&branch)).unwrap();
            capped_store
                .update_execution(&exec.id, ExecutionPatch::new().status(ExecutionStatus::Failed))
                .unwrap();
            capped_store.archive_execution(&exec.id).unwrap();
        }
        let remaining = capped_store.with_read(|doc| doc.archived_executions.len()).unwrap();
        assert_eq!(remaining, 2);
    }

    fn store_data_dir(store: &StateStore) -> PathBuf {
        store.config.data_dir.clone()
    }

    #[test]
    fn merge_queue_orders_by_position_then_id() {
        let (_dir, store) = store();
        let a = store.insert_execution(sample_execution("ralph/a")).unwrap();
        let b = store.insert_execution(sample_execution("ralph/b")).unwrap();
        store.enqueue_merge(&a.id).unwrap();
        store.enqueue_merge(&b.id).unwrap();
        let items = store.list_merge_queue().unwrap();
        assert_eq!(items[0].execution_id, a.id);
        assert_eq!(items[1].execution_id, b.id);
    }
}
