//! Execution engine for bounded-parallel graph draining.
//!
//! The engine owns the [`TaskGraph`] for the duration of a run and drives
//! it in rounds. Each round dispatches the ready nodes (up to the graph's
//! `max_concurrency`) to an injected [`TaskExecutor`], waits for all of
//! them to settle, and applies every outcome back into the graph before
//! the next ready set is computed.
//!
//! All graph mutation happens on the loop that polls the executor
//! futures. Executors receive an owned copy of their node and never touch
//! the graph, so no lock is held across an executor call.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{NodeStatus, Progress, TaskGraph, TaskNode};
use crate::error::{Error, Result};
use crate::orchestration::retry::ClassifiedError;
use crate::{clog, clog_debug, clog_error, clog_trace, clog_warn};

/// Skip reason for pending nodes whose dependencies can no longer complete.
pub const STRANDED_REASON: &str = "dependency did not complete";

/// Failure reported by an executor for one node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for TaskFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TaskFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<ClassifiedError> for TaskFailure {
    fn from(err: ClassifiedError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<Error> for TaskFailure {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Outcome of running one node.
pub type TaskOutcome = std::result::Result<serde_json::Value, TaskFailure>;

/// Performs the work of a node.
///
/// Implemented for any `Fn(TaskNode) -> impl Future<Output = TaskOutcome>`.
pub trait TaskExecutor {
    type Future: Future<Output = TaskOutcome>;

    fn execute(&self, node: TaskNode) -> Self::Future;
}

impl<F, Fut> TaskExecutor for F
where
    F: Fn(TaskNode) -> Fut,
    Fut: Future<Output = TaskOutcome>,
{
    type Future = Fut;

    fn execute(&self, node: TaskNode) -> Fut {
        self(node)
    }
}

/// What happened in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    pub round: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub dispatched: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Dependents skipped because a node failed this round.
    pub skipped: Vec<String>,
    /// Graph progress after the round's outcomes were applied.
    pub progress: Progress,
}

/// Called at every round boundary, after outcomes are applied.
///
/// This is where callers checkpoint. The graph may be adjusted here
/// (skip nodes, change `max_concurrency`); no node is running at this point.
pub trait RoundObserver {
    fn on_round(&mut self, summary: &RoundSummary, graph: &mut TaskGraph);
}

impl<F> RoundObserver for F
where
    F: FnMut(&RoundSummary, &mut TaskGraph),
{
    fn on_round(&mut self, summary: &RoundSummary, graph: &mut TaskGraph) {
        self(summary, graph)
    }
}

/// Events emitted by the engine for node lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    NodeStarted {
        round: u32,
        id: String,
        agent_id: String,
    },
    NodeCompleted {
        round: u32,
        id: String,
    },
    NodeFailed {
        round: u32,
        id: String,
        error: String,
    },
    NodeSkipped {
        id: String,
        reason: Option<String>,
    },
    RoundCompleted(RoundSummary),
    /// The graph has no pending or running nodes left.
    Finished {
        success: bool,
    },
}

/// Result of [`ExecutionEngine::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// True iff no node failed.
    pub success: bool,
    /// Results of every completed node, including ones completed before a resume.
    pub results: BTreeMap<String, serde_json::Value>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    /// Rounds run by this call.
    pub rounds: Vec<RoundSummary>,
}

/// Drives a [`TaskGraph`] to completion.
///
/// # Example
///
/// ```ignore
/// use conductor::core::TaskGraph;
/// use conductor::orchestration::{ExecutionEngine, TaskFailure};
///
/// let mut engine = ExecutionEngine::new(graph);
/// let report = engine
///     .execute(&|node: TaskNode| async move { Ok::<_, TaskFailure>(serde_json::json!(node.id)) })
///     .await?;
/// ```
pub struct ExecutionEngine {
    graph: TaskGraph,
    /// Last round number used; rounds are numbered from 1.
    round: u32,
    event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl ExecutionEngine {
    pub fn new(graph: TaskGraph) -> Self {
        Self {
            graph,
            round: 0,
            event_tx: None,
        }
    }

    /// Emit [`EngineEvent`]s on `tx`. Send failures are ignored.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Continue round numbering after `round`, e.g. when resuming from a checkpoint.
    pub fn starting_round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TaskGraph {
        &mut self.graph
    }

    pub fn into_graph(self) -> TaskGraph {
        self.graph
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run the graph to completion without a round observer.
    pub async fn execute<E: TaskExecutor>(&mut self, executor: &E) -> Result<ExecutionReport> {
        self.execute_with(executor, &mut |_: &RoundSummary, _: &mut TaskGraph| {})
            .await
    }

    /// Run the graph to completion, calling `observer` after every round.
    ///
    /// # Errors
    /// `Error::InvalidGraph` if validation fails; no node is dispatched.
    pub async fn execute_with<E, O>(
        &mut self,
        executor: &E,
        observer: &mut O,
    ) -> Result<ExecutionReport>
    where
        E: TaskExecutor,
        O: RoundObserver,
    {
        let validation = self.graph.validate();
        if !validation.valid {
            clog_error!(
                "Refusing to execute invalid graph: {}",
                validation.errors.join("; ")
            );
            return Err(Error::InvalidGraph {
                errors: validation.errors,
            });
        }

        let recovered = self.graph.recover_interrupted();
        if !recovered.is_empty() {
            clog_warn!(
                "Recovered {} interrupted node(s): {}",
                recovered.len(),
                recovered.join(", ")
            );
        }

        clog!(
            "Executing graph: {} nodes, max_concurrency={}, starting after round {}",
            self.graph.len(),
            self.graph.max_concurrency(),
            self.round
        );

        let mut rounds = Vec::new();
        while self.graph.has_active() {
            let Some(summary) = self.run_round(executor).await? else {
                break;
            };
            observer.on_round(&summary, &mut self.graph);
            self.emit(EngineEvent::RoundCompleted(summary.clone()));
            rounds.push(summary);
        }

        let results: BTreeMap<String, serde_json::Value> = self
            .graph
            .nodes()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| (n.id.clone(), n.result.clone().unwrap_or(serde_json::Value::Null)))
            .collect();
        let failed = self.graph.ids_with_status(NodeStatus::Failed);
        let skipped = self.graph.ids_with_status(NodeStatus::Skipped);
        let success = failed.is_empty();

        clog!(
            "Execution finished: success={} completed={} failed={} skipped={} rounds={}",
            success,
            results.len(),
            failed.len(),
            skipped.len(),
            rounds.len()
        );
        self.emit(EngineEvent::Finished { success });

        Ok(ExecutionReport {
            success,
            results,
            failed,
            skipped,
            rounds,
        })
    }

    /// Dispatch one batch of ready nodes and apply their outcomes.
    ///
    /// The round stays open until its slowest node settles. Slots freed by
    /// faster nodes sit idle until then, even if their dependents became
    /// ready, so wall time per round is the maximum of the batch. In return
    /// every observer call and checkpoint sees a graph with nothing running.
    ///
    /// Returns `None` when nothing could be dispatched.
    async fn run_round<E: TaskExecutor>(&mut self, executor: &E) -> Result<Option<RoundSummary>> {
        let limit = match self.graph.max_concurrency() {
            0 => usize::MAX,
            n => n,
        };
        let batch: Vec<String> = self
            .graph
            .ready_nodes()
            .into_iter()
            .take(limit)
            .map(|n| n.id.clone())
            .collect();

        if batch.is_empty() {
            self.skip_stranded()?;
            return Ok(None);
        }

        self.round += 1;
        let round = self.round;
        let started_at = Utc::now();
        let clock = Instant::now();
        clog_trace!("Round {} ready set: {}", round, batch.join(", "));

        let mut in_flight = FuturesUnordered::new();
        for id in &batch {
            self.graph.start(id)?;
            let node = self
                .graph
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NodeNotFound(id.clone()))?;
            clog_debug!("Round {} dispatch node={} agent={}", round, id, node.agent_id);
            self.emit(EngineEvent::NodeStarted {
                round,
                id: id.clone(),
                agent_id: node.agent_id.clone(),
            });

            let id = id.clone();
            in_flight.push(async move {
                let outcome = executor.execute(node).await;
                (id, outcome)
            });
        }

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        while let Some((id, outcome)) = in_flight.next().await {
            match outcome {
                Ok(result) => {
                    self.graph.complete(&id, result)?;
                    clog_debug!("Round {} node={} completed", round, id);
                    self.emit(EngineEvent::NodeCompleted {
                        round,
                        id: id.clone(),
                    });
                    completed.push(id);
                }
                Err(failure) => {
                    let cascaded = self.graph.fail(&id, &failure.message)?;
                    clog_warn!(
                        "Round {} node={} failed: {} (skipping {} dependent(s))",
                        round,
                        id,
                        failure.message,
                        cascaded.len()
                    );
                    self.emit(EngineEvent::NodeFailed {
                        round,
                        id: id.clone(),
                        error: failure.message,
                    });
                    for skipped_id in &cascaded {
                        self.emit_skipped(skipped_id);
                    }
                    failed.push(id);
                    skipped.extend(cascaded);
                }
            }
        }

        let summary = RoundSummary {
            round,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            dispatched: batch,
            completed,
            failed,
            skipped,
            progress: self.graph.progress(),
        };
        clog!(
            "Round {} done: dispatched={} completed={} failed={} progress={}%",
            round,
            summary.dispatched.len(),
            summary.completed.len(),
            summary.failed.len(),
            summary.progress.percent_complete
        );
        Ok(Some(summary))
    }

    /// Skip pending nodes that can never become ready.
    ///
    /// Only reachable when a graph was restored or edited with a failed or
    /// skipped dependency whose dependents were never cascaded.
    fn skip_stranded(&mut self) -> Result<()> {
        let stranded = self.graph.ids_with_status(NodeStatus::Pending);
        if stranded.is_empty() {
            return Ok(());
        }
        clog_warn!(
            "No ready nodes but {} pending; skipping: {}",
            stranded.len(),
            stranded.join(", ")
        );
        for id in stranded {
            for skipped_id in self.graph.skip(&id, Some(STRANDED_REASON))? {
                self.emit_skipped(&skipped_id);
            }
        }
        Ok(())
    }

    fn emit_skipped(&self, id: &str) {
        let reason = self.graph.get(id).and_then(|n| n.skip_reason.clone());
        self.emit(EngineEvent::NodeSkipped {
            id: id.to_string(),
            reason,
        });
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("graph", &self.graph)
            .field("round", &self.round)
            .finish()
    }
}
