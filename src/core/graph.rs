//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph` owns every [`TaskNode`] of a mission and answers the
//! scheduling questions the engine asks between rounds: which nodes are
//! ready, in what order they may run, how deep the graph is, and which
//! nodes must be skipped when something upstream fails.
//!
//! Edges are stored on the nodes themselves (each node lists the ids it
//! depends on), so a graph may temporarily reference nodes that do not
//! exist yet. [`TaskGraph::validate`] is the authority on whether the
//! structure is runnable.

use crate::core::node::{Metadata, NodeSpec, NodeStatus, TaskNode};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Outcome of [`TaskGraph::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Longest dependency chain, measured in nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CriticalPath {
    pub path: Vec<String>,
    pub length: usize,
}

/// Per-status node counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Completed plus skipped over total, rounded to a whole percent.
    pub percent_complete: u32,
}

/// Serialized form of a graph (structure plus run state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    #[serde(default)]
    pub max_concurrency: usize,
    pub nodes: Vec<TaskNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    White,
    Gray,
    Black,
}

/// The task dependency graph.
///
/// Nodes keep insertion order, which is also the tie-break order for
/// every analysis that has to choose between equals.
#[derive(Clone, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    /// Index mapping from node id to position in `nodes`.
    index: HashMap<String, usize>,
    /// Upper bound on in-flight nodes; 0 means unlimited.
    max_concurrency: usize,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Self::default()
        }
    }

    /// Build a graph from mission entries. The result is not validated.
    pub fn from_specs(specs: &[NodeSpec], max_concurrency: usize) -> Result<Self> {
        let mut graph = Self::with_max_concurrency(max_concurrency);
        for spec in specs {
            graph.add_node(
                &spec.id,
                &spec.agent_kind,
                &spec.task,
                &spec.depends_on,
                &spec.metadata,
            )?;
        }
        Ok(graph)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.max_concurrency = max_concurrency;
    }

    /// Add a pending node.
    ///
    /// # Errors
    /// Returns `Error::DuplicateNode` if a node with `id` already exists.
    pub fn add_node(
        &mut self,
        id: &str,
        agent_id: &str,
        task: &str,
        dependencies: &[String],
        metadata: &Metadata,
    ) -> Result<&TaskNode> {
        if self.index.contains_key(id) {
            return Err(Error::DuplicateNode(id.to_string()));
        }
        let position = self.nodes.len();
        self.nodes
            .push(TaskNode::new(id, agent_id, task, dependencies, metadata));
        self.index.insert(id.to_string(), position);
        Ok(&self.nodes[position])
    }

    /// Record that `to` depends on `from`. Adding an existing edge is a no-op.
    ///
    /// # Errors
    /// Returns `Error::NodeNotFound` if either node is missing.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.index.contains_key(from) {
            return Err(Error::NodeNotFound(from.to_string()));
        }
        let to_idx = self.position(to)?;
        let deps = &mut self.nodes[to_idx].dependencies;
        if !deps.iter().any(|d| d == from) {
            deps.push(from.to_string());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of the nodes that list `id` as a direct dependency.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.iter().any(|d| d == id))
            .map(|n| n.id.as_str())
            .collect()
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Positions of the known dependencies of the node at `position`.
    fn dependency_positions(&self, position: usize) -> impl Iterator<Item = usize> + '_ {
        self.nodes[position]
            .dependencies
            .iter()
            .filter_map(|dep| self.index.get(dep).copied())
    }

    /// Reverse adjacency: for each position, the positions depending on it.
    fn dependent_positions(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for position in 0..self.nodes.len() {
            for dep in self.dependency_positions(position) {
                dependents[dep].push(position);
            }
        }
        dependents
    }

    // ========== Structural analysis ==========

    /// Check that every dependency resolves and that the graph is acyclic.
    ///
    /// Never fails; callers must check `valid`.
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();

        for node in &self.nodes {
            for dep in &node.dependencies {
                if !self.index.contains_key(dep) {
                    errors.push(format!(
                        "Node '{}' has unknown node '{}' in dependency list",
                        node.id, dep
                    ));
                }
            }
        }

        // Iterative DFS; reaching a gray node means a back edge.
        let mut color = vec![Visit::White; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if color[start] != Visit::White {
                continue;
            }
            color[start] = Visit::Gray;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let (position, next) = *frame;
                let deps = &self.nodes[position].dependencies;
                if next == deps.len() {
                    color[position] = Visit::Black;
                    stack.pop();
                    continue;
                }
                frame.1 += 1;

                let Some(&dep) = self.index.get(&deps[next]) else {
                    continue;
                };
                match color[dep] {
                    Visit::Gray => errors.push(format!(
                        "Cycle detected between '{}' and '{}'",
                        self.nodes[position].id, self.nodes[dep].id
                    )),
                    Visit::White => {
                        color[dep] = Visit::Gray;
                        stack.push((dep, 0));
                    }
                    Visit::Black => {}
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Build a petgraph view with edges pointing from dependency to dependent.
    fn dependency_graph(&self) -> Result<DiGraph<usize, ()>> {
        let edge_count = self.nodes.iter().map(|n| n.dependencies.len()).sum();
        let mut graph = DiGraph::with_capacity(self.nodes.len(), edge_count);
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();

        for (position, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                let dep_position = self.position(dep)?;
                graph.add_edge(indices[dep_position], indices[position], ());
            }
        }
        Ok(graph)
    }

    fn topological_positions(&self) -> Result<Vec<usize>> {
        let graph = self.dependency_graph()?;
        let sorted = toposort(&graph, None).map_err(|cycle| {
            Error::CyclicGraph(self.nodes[graph[cycle.node_id()]].id.clone())
        })?;
        Ok(sorted.into_iter().map(|ix| graph[ix]).collect())
    }

    /// Node ids ordered so that every dependency precedes its dependents.
    ///
    /// # Errors
    /// `Error::CyclicGraph` if the graph has a cycle, `Error::NodeNotFound`
    /// if a dependency references a missing node.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        Ok(self
            .topological_positions()?
            .into_iter()
            .map(|i| self.nodes[i].id.clone())
            .collect())
    }

    /// Longest-path layering: a node sits one level below its deepest dependency.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let order = self.topological_positions()?;
        let mut level = vec![0usize; self.nodes.len()];
        for &position in &order {
            let depth = self
                .dependency_positions(position)
                .map(|dep| level[dep] + 1)
                .max()
                .unwrap_or(0);
            level[position] = depth;
        }

        let depth = level.iter().max().map_or(0, |deepest| deepest + 1);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); depth];
        for (position, node) in self.nodes.iter().enumerate() {
            levels[level[position]].push(node.id.clone());
        }
        Ok(levels)
    }

    /// The longest chain of nodes under the dependency order.
    ///
    /// Ties go to whichever candidate was seen first.
    pub fn critical_path(&self) -> Result<CriticalPath> {
        let order = self.topological_positions()?;
        let mut length = vec![0usize; self.nodes.len()];
        let mut previous: Vec<Option<usize>> = vec![None; self.nodes.len()];

        for &position in &order {
            let mut best = 0;
            for dep in self.dependency_positions(position) {
                if length[dep] > best {
                    best = length[dep];
                    previous[position] = Some(dep);
                }
            }
            length[position] = best + 1;
        }

        let mut end = None;
        let mut longest = 0;
        for (position, &len) in length.iter().enumerate() {
            if len > longest {
                longest = len;
                end = Some(position);
            }
        }

        let mut path = Vec::with_capacity(longest);
        let mut cursor = end;
        while let Some(position) = cursor {
            path.push(self.nodes[position].id.clone());
            cursor = previous[position];
        }
        path.reverse();

        Ok(CriticalPath {
            path,
            length: longest,
        })
    }

    // ========== Scheduling state ==========

    pub fn completed_ids(&self) -> HashSet<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Pending nodes whose dependencies have all completed.
    ///
    /// Skipped or failed dependencies never satisfy readiness.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        let completed = self.completed_ids();
        self.nodes
            .iter()
            .filter(|n| n.is_ready(&completed))
            .collect()
    }

    /// True while any node is pending or running.
    pub fn has_active(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Running))
    }

    pub fn ids_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.nodes.len(),
            ..Progress::default()
        };
        for node in &self.nodes {
            match node.status {
                NodeStatus::Pending => progress.pending += 1,
                NodeStatus::Running => progress.running += 1,
                NodeStatus::Completed => progress.completed += 1,
                NodeStatus::Failed => progress.failed += 1,
                NodeStatus::Skipped => progress.skipped += 1,
            }
        }
        if progress.total > 0 {
            let done = (progress.completed + progress.skipped) as f64;
            progress.percent_complete = (100.0 * done / progress.total as f64).round() as u32;
        }
        progress
    }

    // ========== Transitions ==========

    /// Mark a pending node running and stamp its start time.
    pub fn start(&mut self, id: &str) -> Result<()> {
        let position = self.position(id)?;
        let node = &mut self.nodes[position];
        if node.status != NodeStatus::Pending {
            return Err(Error::InvalidState {
                id: id.to_string(),
                reason: format!("cannot start a {} node", node.status),
            });
        }
        node.start();
        Ok(())
    }

    /// Store the result of a running node.
    pub fn complete(&mut self, id: &str, result: serde_json::Value) -> Result<()> {
        let position = self.position(id)?;
        let node = &mut self.nodes[position];
        if node.status != NodeStatus::Running {
            return Err(Error::InvalidState {
                id: id.to_string(),
                reason: format!("cannot complete a {} node", node.status),
            });
        }
        node.complete(result);
        Ok(())
    }

    /// Fail a running node and skip everything downstream of it.
    ///
    /// Returns the ids of the dependents that were skipped.
    pub fn fail(&mut self, id: &str, error: &str) -> Result<Vec<String>> {
        let position = self.position(id)?;
        let node = &mut self.nodes[position];
        if node.status != NodeStatus::Running {
            return Err(Error::InvalidState {
                id: id.to_string(),
                reason: format!("cannot fail a {} node", node.status),
            });
        }
        node.fail(error);
        Ok(self.cascade_skip(position, &format!("dependency '{}' failed", id)))
    }

    /// Skip a node and, transitively, every pending node that depends on it.
    ///
    /// Terminal nodes are left alone. Returns every id that was skipped,
    /// starting with `id` itself.
    ///
    /// # Errors
    /// `Error::InvalidState` if the node is running.
    pub fn skip(&mut self, id: &str, reason: Option<&str>) -> Result<Vec<String>> {
        let position = self.position(id)?;
        match self.nodes[position].status {
            NodeStatus::Running => Err(Error::InvalidState {
                id: id.to_string(),
                reason: "cannot skip a running node".to_string(),
            }),
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped => Ok(Vec::new()),
            NodeStatus::Pending => {
                self.nodes[position].skip(reason.map(str::to_string));
                let inherited = reason
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("dependency '{}' was skipped", id));
                let mut skipped = vec![id.to_string()];
                skipped.extend(self.cascade_skip(position, &inherited));
                Ok(skipped)
            }
        }
    }

    fn cascade_skip(&mut self, root: usize, reason: &str) -> Vec<String> {
        let dependents = self.dependent_positions();
        let mut skipped = Vec::new();
        let mut stack = dependents[root].clone();

        while let Some(position) = stack.pop() {
            let node = &mut self.nodes[position];
            if node.status != NodeStatus::Pending {
                continue;
            }
            node.skip(Some(reason.to_string()));
            skipped.push(position);
            stack.extend(dependents[position].iter().copied());
        }

        skipped.sort_unstable();
        skipped
            .into_iter()
            .map(|p| self.nodes[p].id.clone())
            .collect()
    }

    /// Return every node to pending so the graph can run from scratch.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.reset();
        }
    }

    /// Return nodes left running by an interrupted process to pending.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut recovered = Vec::new();
        for node in &mut self.nodes {
            if node.status == NodeStatus::Running {
                node.reset();
                recovered.push(node.id.clone());
            }
        }
        recovered
    }

    // ========== Serialization ==========

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            max_concurrency: self.max_concurrency,
            nodes: self.nodes.clone(),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::with_max_concurrency(snapshot.max_concurrency);
        for node in snapshot.nodes {
            if graph.index.contains_key(&node.id) {
                return Err(Error::DuplicateNode(node.id));
            }
            graph.index.insert(node.id.clone(), graph.nodes.len());
            graph.nodes.push(node);
        }
        Ok(graph)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    pub fn from_json(data: serde_json::Value) -> Result<Self> {
        Self::from_snapshot(serde_json::from_value(data)?)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.nodes.len())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}
