//! End-to-end scenarios driving the public `Orchestrator` facade through
//! its collaborator fakes, grounded on
//! `TheFermiSea-beefcake-swarm/coordination/tests/harness_e2e.rs`'s
//! tempdir-plus-fakes setup convention (one scenario per test, a small
//! per-test fixture builder rather than a shared global harness).

use ralph_core::collaborators::fakes::{FakeGit, FakeLauncher, FakePrdParser, RecordingNotifier};
use ralph_core::collaborators::prd::{ParsedPrd, ParsedUserStory};
use ralph_core::config::Config;
use ralph_core::model::{AcEvidence, ConflictStrategy, ExecutionStatus, MergeQueueStatus, Priority, RunnerConfig};
use ralph_core::orchestrator::{MergeAction, MergeResponse, Orchestrator, StartRequest, StatusRequest};
use ralph_core::pipeline::{HardGateResult, UpdateOutcome, UpdateRequest};
use ralph_core::scheduler::MemoryEstimator;
use ralph_core::state::{ExecutionPatch, StateStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

struct UncappedMemory;
impl MemoryEstimator for UncappedMemory {
    fn estimated_capacity(&self) -> u32 {
        u32::MAX
    }
}

fn store_in(dir: &tempfile::TempDir) -> StateStore {
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    StateStore::open(config).unwrap()
}

fn evidence(text: &str) -> AcEvidence {
    AcEvidence {
        evidence: Some(text.to_string()),
        ..Default::default()
    }
}

fn passing_update(branch: &str, story_id: &str) -> UpdateRequest {
    let mut ac = HashMap::new();
    ac.insert("AC-1".to_string(), evidence("ran it"));
    UpdateRequest {
        branch: branch.to_string(),
        story_id: story_id.to_string(),
        passes: true,
        files_changed: Some(1),
        ac_evidence: Some(ac),
        hard_gates: Some(HardGateResult {
            typecheck_clean: true,
            build_clean: true,
        }),
        skip_scope_check: true,
        ..Default::default()
    }
}

fn two_story_prd(branch: &str) -> ParsedPrd {
    ParsedPrd {
        title: "Sample PRD".to_string(),
        description: "a two-story execution".to_string(),
        branch_name: branch.to_string(),
        priority: Priority::P1,
        user_stories: vec![
            ParsedUserStory {
                story_id: "US-001".into(),
                title: "first".into(),
                description: String::new(),
                acceptance_criteria: vec!["AC-1".into()],
                priority: 1,
            },
            ParsedUserStory {
                story_id: "US-002".into(),
                title: "second".into(),
                description: String::new(),
                acceptance_criteria: vec!["AC-1".into()],
                priority: 2,
            },
        ],
        dependencies: Vec::new(),
        frontmatter: serde_json::Map::new(),
    }
}

/// Scenario: a branch's two stories both pass, the execution completes,
/// auto-merge enqueues it, processing the queue merges and archives it,
/// and the completion notification fires exactly once.
#[test]
fn completion_flows_through_merge_queue_to_archive() {
    let dir = tempdir().unwrap();
    let store = store_in(&dir);

    let prd_path = PathBuf::from("/prds/ralph-a.md");
    let parser = FakePrdParser::default().with_prd(prd_path.to_string_lossy().to_string(), two_story_prd("ralph/a"));
    let git = FakeGit::new();
    let launcher = FakeLauncher::default();
    let notifier = RecordingNotifier::default();
    let memory = UncappedMemory;

    let orchestrator = Orchestrator::new(
        &store,
        &git,
        &launcher,
        &parser,
        &notifier,
        &memory,
        "ralph",
        PathBuf::from("/prds"),
        PathBuf::from("/tasks"),
    );

    let started = orchestrator
        .start(StartRequest {
            project: "proj".into(),
            prd_path: prd_path.clone(),
            project_root: PathBuf::from("/repo"),
            worktree: None,
            on_conflict: ConflictStrategy::Notify,
            auto_merge: true,
            notify_on_complete: true,
        })
        .unwrap();
    assert_eq!(started.stories.len(), 2);

    for story_id in ["US-001", "US-002"] {
        let outcome = orchestrator.update(passing_update("ralph/a", story_id)).unwrap();
        match outcome {
            UpdateOutcome::Applied { story_passes, .. } => assert!(story_passes),
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    let exec = store.find_by_branch("ralph/a").unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);

    let queue = match orchestrator.merge(MergeAction::List).unwrap() {
        MergeResponse::List(items) => items,
        _ => panic!("expected a list response"),
    };
    assert_eq!(queue.len(), 1);
    let id = queue[0].id;

    let processed = orchestrator.merge(MergeAction::Process { id }).unwrap();
    match processed {
        MergeResponse::Item(item) => assert_eq!(item.status, MergeQueueStatus::Completed),
        _ => panic!("expected an item response"),
    }

    let archived = store.find_archived_by_branch("ralph/a").unwrap().unwrap();
    assert_eq!(archived.status, ExecutionStatus::Merged);
    assert!(store.find_by_branch("ralph/a").unwrap().is_none());
    assert_eq!(notifier.notified.lock().unwrap().len(), 1);
}

/// Scenario: a dependent execution stays `pending` until its dependency
/// completes, at which point it is promoted straight to `ready` without
/// a separate poll -- the dependency resolver has no persisted graph,
/// so this only happens as a side effect of the dependency's own update.
#[test]
fn dependent_execution_is_promoted_once_dependency_completes() {
    let dir = tempdir().unwrap();
    let store = store_in(&dir);

    let parser = FakePrdParser::default()
        .with_prd("/prds/ralph-a.md", two_story_prd("ralph/a"))
        .with_prd(
            "/prds/ralph-b.md",
            ParsedPrd {
                branch_name: "ralph/b".to_string(),
                dependencies: vec!["ralph/a".to_string()],
                user_stories: vec![ParsedUserStory {
                    story_id: "US-001".into(),
                    title: "depends on a".into(),
                    description: String::new(),
                    acceptance_criteria: vec!["AC-1".into()],
                    priority: 1,
                }],
                ..Default::default()
            },
        );
    let git = FakeGit::new();
    let launcher = FakeLauncher::default();
    let notifier = RecordingNotifier::default();
    let memory = UncappedMemory;

    let orchestrator = Orchestrator::new(
        &store,
        &git,
        &launcher,
        &parser,
        &notifier,
        &memory,
        "ralph",
        PathBuf::from("/prds"),
        PathBuf::from("/tasks"),
    );

    orchestrator
        .start(StartRequest {
            project: "proj".into(),
            prd_path: PathBuf::from("/prds/ralph-a.md"),
            project_root: PathBuf::from("/repo"),
            worktree: None,
            on_conflict: ConflictStrategy::Notify,
            auto_merge: false,
            notify_on_complete: false,
        })
        .unwrap();

    orchestrator
        .start(StartRequest {
            project: "proj".into(),
            prd_path: PathBuf::from("/prds/ralph-b.md"),
            project_root: PathBuf::from("/repo"),
            worktree: None,
            on_conflict: ConflictStrategy::Notify,
            auto_merge: false,
            notify_on_complete: false,
        })
        .unwrap();

    let dependent = store.find_by_branch("ralph/b").unwrap().unwrap();
    assert_eq!(dependent.status, ExecutionStatus::Pending, "unresolved dependency keeps the dependent pending");

    let mut last_outcome = None;
    for story_id in ["US-001", "US-002"] {
        last_outcome = Some(orchestrator.update(passing_update("ralph/a", story_id)).unwrap());
    }

    match last_outcome.unwrap() {
        UpdateOutcome::Applied { promoted_dependents, .. } => {
            assert_eq!(promoted_dependents.len(), 1);
            assert_eq!(promoted_dependents[0].branch, "ralph/b");
        }
        other => panic!("expected Applied, got {other:?}"),
    }

    let dependent = store.find_by_branch("ralph/b").unwrap().unwrap();
    assert_eq!(dependent.status, ExecutionStatus::Ready);
}

/// Scenario: the scheduler claims and launches a `ready` execution
/// within a running `run_scheduling_loop`, stamping `running` plus the
/// launcher-reported `logPath` before the loop is asked to stop.
#[tokio::test]
async fn scheduling_loop_launches_ready_executions() {
    let dir = tempdir().unwrap();
    let store = store_in(&dir);
    store.set_runner_config(RunnerConfig::new(1, chrono::Utc::now(), None)).unwrap();

    let mut exec = ralph_core::model::Execution::new("e1", "proj", "ralph/x", "prd.md", "/repo", "sha", chrono::Utc::now());
    exec.status = ExecutionStatus::Pending;
    let inserted = store.insert_execution(exec).unwrap();
    store
        .update_execution(&inserted.id, ExecutionPatch::new().status(ExecutionStatus::Ready))
        .unwrap();

    let git = FakeGit::new();
    let launcher = FakeLauncher::default();
    let parser = FakePrdParser::default();
    let notifier = RecordingNotifier::default();
    let memory = UncappedMemory;

    let orchestrator = Orchestrator::new(
        &store,
        &git,
        &launcher,
        &parser,
        &notifier,
        &memory,
        "ralph",
        PathBuf::from("/prds"),
        PathBuf::from("/tasks"),
    );

    let stop = AtomicBool::new(false);
    tokio::select! {
        _ = orchestrator.run_scheduling_loop(None, std::time::Duration::from_millis(5), &stop) => {}
        _ = tokio::time::sleep(std::time::Duration::from_millis(30)) => {
            stop.store(true, Ordering::Relaxed);
        }
    }

    let after = store.find_by_branch("ralph/x").unwrap().unwrap();
    assert_eq!(after.status, ExecutionStatus::Running);
    assert_eq!(after.activity.log_path.as_deref(), Some("/tmp/agent.log"));

    let status = orchestrator.status(StatusRequest::default()).unwrap();
    assert_eq!(status.running_count, 1);
}
