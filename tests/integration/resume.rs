//! Checkpoint and resume integration tests.
//!
//! A round observer checkpoints engine state after every round. These
//! tests interrupt a run, then resume it in a fresh engine from the
//! checkpoint, using the test repository's HEAD as the state marker.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use conductor::config::Config;
use conductor::core::{NodeStatus, TaskGraph, TaskNode};
use conductor::orchestration::{
    AdaptiveTiming, ExecutionEngine, RoundSummary, SupervisedExecutor, TaskOutcome,
};
use conductor::state::{
    collect_checkpoint_state, restore_checkpoint_state, validate_checkpoint, CheckpointState,
    CheckpointStore, LiveState, RestoreTargets, StateMarker, CHECKPOINT_VERSION,
};

use crate::fixtures::{mission_graph, ScriptedExecutor, TestRepo};

/// Round observer state that writes a checkpoint after every round.
struct Checkpointer<'a> {
    store: &'a CheckpointStore,
    marker: String,
    timing: Arc<Mutex<AdaptiveTiming>>,
    round_log: Vec<RoundSummary>,
    empty_rounds: HashMap<String, u32>,
}

impl<'a> Checkpointer<'a> {
    fn new(store: &'a CheckpointStore, marker: String, timing: Arc<Mutex<AdaptiveTiming>>) -> Self {
        Self {
            store,
            marker,
            timing,
            round_log: Vec::new(),
            empty_rounds: HashMap::new(),
        }
    }

    fn record(&mut self, summary: &RoundSummary, graph: &TaskGraph) {
        self.round_log.push(summary.clone());
        let timing = self.timing.try_lock().expect("timing is idle between rounds");
        let state = collect_checkpoint_state(&LiveState {
            round: summary.round,
            external_state_marker: Some(self.marker.as_str()),
            graph: Some(graph),
            timing: &*timing,
            round_log: &self.round_log,
            consecutive_empty_rounds: &self.empty_rounds,
        });
        assert!(self.store.write_checkpoint(&state));
    }
}

/// Executor that finishes `plan` and hangs on everything else.
fn hangs_after_plan(node: TaskNode) -> Pin<Box<dyn Future<Output = TaskOutcome>>> {
    Box::pin(async move {
        if node.id != "plan" {
            std::future::pending::<()>().await;
        }
        Ok(json!(format!("{} done", node.id)))
    })
}

/// Test: crash and resume
/// Given a run interrupted during its second round
/// When a new engine resumes from the round-1 checkpoint
/// Then completed work is kept and only the remaining nodes run
#[tokio::test(start_paused = true)]
async fn test_resume_after_interrupted_round() {
    let repo = TestRepo::new();
    let store = repo.checkpoint_store();
    let marker = repo.marker().current_marker().unwrap();
    let config = Config::default();

    // First process: crashes while api and ui are in flight.
    {
        let timing = Arc::new(Mutex::new(AdaptiveTiming::new(config.default_timeout())));
        let executor =
            SupervisedExecutor::new(hangs_after_plan, config.clone(), Arc::clone(&timing));
        let mut checkpointer = Checkpointer::new(&store, marker.clone(), timing);
        let mut observer =
            |summary: &RoundSummary, graph: &mut TaskGraph| checkpointer.record(summary, graph);

        let mut engine = ExecutionEngine::new(mission_graph(0));
        let run = engine.execute_with(&executor, &mut observer);
        let interrupted = tokio::time::timeout(Duration::from_secs(60), run).await;
        assert!(interrupted.is_err(), "second round should still be running");
        assert_eq!(engine.graph().get("api").unwrap().status, NodeStatus::Running);
    }

    // Second process: resumes from disk.
    let checkpoint = store.load_valid(&marker).expect("checkpoint should be valid");
    assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
    assert_eq!(checkpoint.state.round, 1);

    let graph = checkpoint.graph().unwrap().expect("checkpoint stores the graph");
    assert_eq!(graph.get("plan").unwrap().status, NodeStatus::Completed);
    assert_eq!(graph.get("api").unwrap().status, NodeStatus::Pending);

    let mut timing = AdaptiveTiming::new(config.default_timeout());
    let mut round_log = Vec::new();
    let mut empty_rounds = HashMap::new();
    let round = restore_checkpoint_state(
        &checkpoint,
        RestoreTargets {
            timing: &mut timing,
            round_log: &mut round_log,
            consecutive_empty_rounds: &mut empty_rounds,
        },
    );
    assert_eq!(round_log.len(), 1);
    assert_eq!(timing.runtime_history("planner").len(), 1);

    let inner = ScriptedExecutor::new();
    let mut engine = ExecutionEngine::new(graph).starting_round(round);
    let report = engine.execute(&inner).await.unwrap();

    assert!(report.success);
    assert_eq!(report.results["plan"], json!("plan done"));
    assert_eq!(inner.calls_for("plan"), 0);
    assert_eq!(inner.calls().len(), 3);
    assert_eq!(report.rounds.first().map(|r| r.round), Some(2));

    store.clear_checkpoint().unwrap();
    assert!(store.load_checkpoint().is_none());
}

/// Test: moved marker
/// Given a checkpoint taken at one commit
/// When the repository gains a new commit
/// Then the checkpoint is rejected and the run starts cold
#[test]
fn test_new_commit_invalidates_checkpoint() {
    let repo = TestRepo::new();
    let store = repo.checkpoint_store();
    let before = repo.marker().current_marker().unwrap();

    let graph = mission_graph(0);
    let timing = AdaptiveTiming::default();
    let state = collect_checkpoint_state(&LiveState {
        round: 2,
        external_state_marker: Some(before.as_str()),
        graph: Some(&graph),
        timing: &timing,
        round_log: &[],
        consecutive_empty_rounds: &HashMap::new(),
    });
    assert!(store.write_checkpoint(&state));
    assert!(store.load_valid(&before).is_some());

    let after = repo.create_and_commit("notes.md", "moved on\n", "Keep working");
    assert_ne!(before, after);
    assert_eq!(repo.marker().current_marker().unwrap(), after);

    let loaded = store.load_checkpoint();
    let validation = validate_checkpoint(loaded.as_ref(), &after);
    assert!(!validation.valid);
    assert_eq!(
        validation.reason,
        Some(format!("marker mismatch: checkpoint={} current={}", before, after))
    );
    assert!(store.load_valid(&after).is_none());
}

/// Test: checkpoint without marker
/// Given a checkpoint written without an external marker
/// When it is validated
/// Then it is rejected as missing its marker
#[test]
fn test_checkpoint_without_marker_starts_cold() {
    let repo = TestRepo::new();
    let store = repo.checkpoint_store();
    assert!(store.write_checkpoint(&CheckpointState {
        round: 1,
        ..Default::default()
    }));

    let marker = repo.marker().current_marker().unwrap();
    let validation = validate_checkpoint(store.load_checkpoint().as_ref(), &marker);
    assert_eq!(validation.reason.as_deref(), Some("checkpoint missing marker"));
}

/// Test: outdated checkpoint format
/// Given a checkpoint file from another version
/// When it is loaded
/// Then it is ignored rather than treated as an error
#[test]
fn test_outdated_checkpoint_version_is_ignored() {
    let repo = TestRepo::new();
    let store = repo.checkpoint_store();
    let marker = repo.marker().current_marker().unwrap();
    fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    fs::write(
        store.path(),
        json!({
            "version": CHECKPOINT_VERSION + 1,
            "timestamp": "2026-01-01T00:00:00Z",
            "round": 7,
            "externalStateMarker": marker,
        })
        .to_string(),
    )
    .unwrap();

    assert!(store.load_checkpoint().is_none());
    assert!(store.load_valid(&marker).is_none());
}

/// Test: interrupted node in a checkpoint
/// Given a checkpointed graph with a node still marked running
/// When the run resumes
/// Then that node is recovered to pending and executed again
#[tokio::test]
async fn test_running_node_in_checkpoint_is_rerun() {
    let repo = TestRepo::new();
    let store = repo.checkpoint_store();
    let marker = repo.marker().current_marker().unwrap();

    let mut graph = mission_graph(0);
    graph.start("plan").unwrap();
    graph.complete("plan", json!("planned")).unwrap();
    graph.start("api").unwrap();

    let timing = AdaptiveTiming::default();
    store.write_checkpoint(&collect_checkpoint_state(&LiveState {
        round: 1,
        external_state_marker: Some(marker.as_str()),
        graph: Some(&graph),
        timing: &timing,
        round_log: &[],
        consecutive_empty_rounds: &HashMap::new(),
    }));

    let checkpoint = store.load_valid(&marker).unwrap();
    let graph = checkpoint.graph().unwrap().unwrap();
    assert_eq!(graph.get("api").unwrap().status, NodeStatus::Running);

    let inner = ScriptedExecutor::new();
    let mut engine = ExecutionEngine::new(graph).starting_round(checkpoint.state.round);
    let report = engine.execute(&inner).await.unwrap();

    assert!(report.success);
    assert_eq!(inner.calls_for("api"), 1);
    assert_eq!(inner.calls_for("plan"), 0);
    assert_eq!(report.results["plan"], json!("planned"));
}
