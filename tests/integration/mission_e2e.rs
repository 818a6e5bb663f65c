//! End-to-end mission integration tests.
//!
//! These tests build mission graphs from node specs and run them through
//! the execution engine, mostly behind a supervised executor, checking
//! ordering, retries, failure cascades and concurrency control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use conductor::config::Config;
use conductor::core::{NodeSpec, NodeStatus, TaskGraph};
use conductor::orchestration::{
    AdaptiveTiming, EngineEvent, ExecutionEngine, RoundSummary, SupervisedExecutor, TaskFailure,
};
use conductor::Error;

use crate::fixtures::{independent_graph, mission_graph, sleeping_executor, ScriptedExecutor};

fn supervised(inner: ScriptedExecutor) -> SupervisedExecutor<ScriptedExecutor> {
    let config = Config::default();
    let timing = Arc::new(Mutex::new(AdaptiveTiming::new(config.default_timeout())));
    SupervisedExecutor::new(inner, config, timing)
}

// ========== Graph analysis ==========

/// Test: mission analysis
/// Given the four-node mission
/// When it is analyzed before execution
/// Then ordering, layering and the critical path follow the dependencies
#[test]
fn test_mission_analysis() {
    let graph = mission_graph(0);
    assert!(graph.validate().valid);
    let order = graph.topological_sort().unwrap();
    assert_eq!(order.first().map(String::as_str), Some("plan"));
    assert_eq!(order.last().map(String::as_str), Some("review"));
    assert_eq!(
        graph.levels().unwrap(),
        vec![vec!["plan"], vec!["api", "ui"], vec!["review"]]
    );
    let critical = graph.critical_path().unwrap();
    assert_eq!(critical.path, vec!["plan", "api", "review"]);
    assert_eq!(critical.length, 3);
    assert_eq!(graph.get("review").unwrap().metadata["strict"], json!(true));
}

// ========== Execution ==========

/// Test: happy path
/// Given the mission and an executor that always succeeds
/// When the engine runs it
/// Then every node completes in dependency order over three rounds
#[tokio::test]
async fn test_mission_happy_path() {
    let inner = ScriptedExecutor::new();
    let executor = supervised(inner.clone());
    let mut engine = ExecutionEngine::new(mission_graph(0));

    let report = engine.execute(&executor).await.unwrap();

    assert!(report.success);
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.results["review"], json!({ "node": "review" }));
    assert_eq!(report.rounds.len(), 3);
    let calls = inner.calls();
    assert_eq!(calls.first().map(String::as_str), Some("plan"));
    assert_eq!(calls.last().map(String::as_str), Some("review"));
    assert_eq!(engine.graph().progress().percent_complete, 100);
}

/// Test: transient failure
/// Given a node whose first attempt hits a 503
/// When the supervised executor runs it
/// Then the node is retried after backoff and the mission succeeds
#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_within_node() {
    let inner = ScriptedExecutor::new().script(
        "api",
        vec![
            Err(TaskFailure::new("503 service unavailable")),
            Ok(json!("api v2")),
        ],
    );
    let executor = supervised(inner.clone());
    let mut engine = ExecutionEngine::new(mission_graph(0));

    let report = engine.execute(&executor).await.unwrap();

    assert!(report.success);
    assert_eq!(report.results["api"], json!("api v2"));
    assert_eq!(inner.calls_for("api"), 2);
    assert_eq!(inner.calls_for("ui"), 1);
}

/// Test: fatal failure cascade
/// Given a builder node that fails with a permission error
/// When the mission runs
/// Then the node fails without retry, its sibling still completes,
/// and the reviewer is skipped with the failed dependency named
#[tokio::test(start_paused = true)]
async fn test_fatal_failure_cascades_to_dependents() {
    let inner = ScriptedExecutor::new().always_fail("api", "permission denied");
    let executor = supervised(inner.clone());
    let mut engine = ExecutionEngine::new(mission_graph(0));

    let report = engine.execute(&executor).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.failed, vec!["api"]);
    assert_eq!(report.skipped, vec!["review"]);
    assert!(report.results.contains_key("ui"));
    assert_eq!(inner.calls_for("api"), 1);
    assert_eq!(inner.calls_for("review"), 0);

    let graph = engine.graph();
    assert!(graph
        .get("api")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("permission denied"));
    assert_eq!(
        graph.get("review").unwrap().skip_reason.as_deref(),
        Some("dependency 'api' failed")
    );
}

/// Test: retries exhausted
/// Given a node that keeps timing out at the network layer
/// When the retry budget runs out
/// Then the node fails after max_retries + 1 attempts
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_node() {
    let inner = ScriptedExecutor::new().always_fail("ui", "ETIMEDOUT");
    let executor = supervised(inner.clone());
    let mut engine = ExecutionEngine::new(mission_graph(0));

    let report = engine.execute(&executor).await.unwrap();

    assert_eq!(report.failed, vec!["ui"]);
    assert_eq!(inner.calls_for("ui"), 4);
    assert!(executor.consecutive_failures().await >= 1);
}

/// Test: invalid mission
/// Given specs with a dangling dependency and a cycle
/// When execution is requested
/// Then it fails before any node is dispatched
#[tokio::test]
async fn test_invalid_mission_is_rejected() {
    let specs: Vec<NodeSpec> = serde_json::from_value(json!([
        { "id": "a", "agent_kind": "builder", "task": "a", "depends_on": ["b"] },
        { "id": "b", "agent_kind": "builder", "task": "b", "depends_on": ["a"] },
        { "id": "c", "agent_kind": "builder", "task": "c", "depends_on": ["missing"] }
    ]))
    .unwrap();
    let graph = TaskGraph::from_specs(&specs, 0).unwrap();
    let inner = ScriptedExecutor::new();

    let mut engine = ExecutionEngine::new(graph);
    let err = engine.execute(&inner).await.unwrap_err();

    match err {
        Error::InvalidGraph { errors } => {
            assert!(errors.iter().any(|e| e.contains("missing")));
            assert!(errors.iter().any(|e| e.starts_with("Cycle detected")));
        }
        other => panic!("expected InvalidGraph, got {:?}", other),
    }
    assert!(inner.calls().is_empty());
}

/// Test: event stream
/// Given an event channel attached to the engine
/// When the mission runs
/// Then every node reports start and completion and the stream ends with Finished
#[tokio::test]
async fn test_event_stream_covers_every_node() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut engine = ExecutionEngine::new(mission_graph(0)).with_events(tx);
    engine.execute(&ScriptedExecutor::new()).await.unwrap();
    drop(engine);

    let mut started = 0;
    let mut completed = 0;
    let mut rounds = 0;
    let mut last = None;
    while let Some(event) = rx.recv().await {
        match &event {
            EngineEvent::NodeStarted { .. } => started += 1,
            EngineEvent::NodeCompleted { .. } => completed += 1,
            EngineEvent::RoundCompleted(_) => rounds += 1,
            _ => {}
        }
        last = Some(event);
    }
    assert_eq!(started, 4);
    assert_eq!(completed, 4);
    assert_eq!(rounds, 3);
    assert_eq!(last, Some(EngineEvent::Finished { success: true }));
}

// ========== Concurrency ==========

/// Test: bounded rounds
/// Given five independent nodes and max_concurrency 2
/// When the engine runs them
/// Then they are dispatched in rounds of 2, 2 and 1
#[tokio::test(start_paused = true)]
async fn test_max_concurrency_bounds_each_round() {
    let executor = sleeping_executor(HashMap::new());
    let mut engine = ExecutionEngine::new(independent_graph(5, 2));

    let report = engine.execute(&executor).await.unwrap();

    let sizes: Vec<usize> = report.rounds.iter().map(|r| r.dispatched.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(report.success);
}

/// Test: dynamic concurrency
/// Given two agent kinds where one runs four times slower
/// When an observer feeds the timing model's suggestion back between rounds
/// Then the engine widens from one slot to two
#[tokio::test(start_paused = true)]
async fn test_dynamic_concurrency_widens_between_rounds() {
    let durations = HashMap::from([
        ("fast", Duration::from_secs(10)),
        ("slow", Duration::from_secs(40)),
    ]);
    let config = Config {
        max_concurrency: 1,
        ..Config::default()
    };
    let timing = Arc::new(Mutex::new(AdaptiveTiming::new(config.default_timeout())));
    let executor = SupervisedExecutor::new(
        sleeping_executor(durations),
        config.clone(),
        Arc::clone(&timing),
    );

    let shared = Arc::clone(&timing);
    let mut observer = |_summary: &RoundSummary, graph: &mut TaskGraph| {
        let suggested = shared
            .try_lock()
            .expect("timing is idle between rounds")
            .dynamic_concurrency(config.max_concurrency);
        graph.set_max_concurrency(suggested);
    };

    let mut engine = ExecutionEngine::new(independent_graph(6, config.max_concurrency));
    let report = engine.execute_with(&executor, &mut observer).await.unwrap();

    let sizes: Vec<usize> = report.rounds.iter().map(|r| r.dispatched.len()).collect();
    assert_eq!(sizes, vec![1, 1, 2, 2]);
    assert!(report.success);

    let timing = timing.lock().await;
    assert_eq!(timing.runtime_history("fast").len(), 3);
    assert_eq!(timing.runtime_history("slow").len(), 3);
}

/// Test: operator skip
/// Given an observer that descopes the ui node after the first round
/// When the mission runs
/// Then ui and the reviewer are skipped and nothing fails
#[tokio::test]
async fn test_skip_between_rounds_descopes_branch() {
    let inner = ScriptedExecutor::new();
    let mut observer = |summary: &RoundSummary, graph: &mut TaskGraph| {
        if summary.round == 1 {
            graph.skip("ui", Some("descoped by operator")).unwrap();
        }
    };
    let mut engine = ExecutionEngine::new(mission_graph(0));
    let report = engine.execute_with(&inner, &mut observer).await.unwrap();

    assert!(report.success);
    assert_eq!(report.skipped, vec!["ui", "review"]);
    assert_eq!(
        engine.graph().get("review").unwrap().skip_reason.as_deref(),
        Some("descoped by operator")
    );
    assert_eq!(engine.graph().get("ui").unwrap().status, NodeStatus::Skipped);
    assert_eq!(inner.calls(), vec!["plan", "api"]);
}
