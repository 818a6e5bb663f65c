//! Task node data model for the execution graph.
//!
//! A node is one unit of work assigned to an agent kind. It tracks its
//! lifecycle status, timing and the opaque result handed back by the
//! executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Opaque key/value bag attached to a node.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Node status in its lifecycle.
///
/// Transitions are monotonic: pending -> running -> completed | failed,
/// or pending -> skipped. Only [`TaskNode::reset`] moves a node back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Completed, failed and skipped nodes never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// A single node in the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    /// Unique identifier within the graph.
    pub id: String,
    /// Agent kind that performs this node.
    pub agent_id: String,
    /// Opaque task description handed to the executor.
    pub task: String,
    /// Ids of nodes that must complete first. Ordered, without duplicates.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Executor error message captured when the node failed.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

impl TaskNode {
    /// Create a pending node. Duplicate dependency ids are dropped.
    pub fn new(
        id: &str,
        agent_id: &str,
        task: &str,
        dependencies: &[String],
        metadata: &Metadata,
    ) -> Self {
        let mut deps: Vec<String> = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        Self {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            task: task.to_string(),
            dependencies: deps,
            metadata: metadata.clone(),
            status: NodeStatus::Pending,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            skip_reason: None,
        }
    }

    /// Elapsed time between start and end, if both are recorded.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Pending with every dependency in `completed`.
    pub fn is_ready(&self, completed: &HashSet<&str>) -> bool {
        self.status == NodeStatus::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
    }

    pub fn start(&mut self) {
        self.status = NodeStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub fn complete(&mut self, result: serde_json::Value) {
        self.status = NodeStatus::Completed;
        self.result = Some(result);
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = NodeStatus::Failed;
        self.error = Some(error.to_string());
        self.end_time = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = NodeStatus::Skipped;
        self.skip_reason = reason;
    }

    /// Back to pending with all run state cleared.
    pub fn reset(&mut self) {
        self.status = NodeStatus::Pending;
        self.start_time = None;
        self.end_time = None;
        self.result = None;
        self.error = None;
        self.skip_reason = None;
    }
}

/// One entry of a caller-supplied mission: the input to
/// [`TaskGraph::from_specs`](crate::core::TaskGraph::from_specs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(alias = "agentKind")]
    pub agent_kind: String,
    pub task: String,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}
