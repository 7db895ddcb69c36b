//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `TaskDag` is built once from declared dependency sets and is immutable
//! afterwards. It answers structural questions (is it acyclic, what order
//! is safe, which nodes can run side by side) and is shared freely between
//! threads once built.

use crate::core::task::{ExecutionStatus, TaskId};
use crate::error::{Error, Result, ValidationError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Anything with an identity and a set of dependency identities.
///
/// Pipeline stages, scheduler tasks and workflow units all implement this so
/// they share one validator.
pub trait DagNode {
    fn node_id(&self) -> &TaskId;
    fn node_dependencies(&self) -> &[TaskId];
}

/// Plain node description, handy when only the structure matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: TaskId,
    pub depends_on: Vec<TaskId>,
}

impl NodeSpec {
    pub fn new(id: &str, depends_on: &[&str]) -> Self {
        Self {
            id: TaskId::new(id),
            depends_on: depends_on.iter().map(|d| TaskId::new(*d)).collect(),
        }
    }
}

impl DagNode for NodeSpec {
    fn node_id(&self) -> &TaskId {
        &self.id
    }

    fn node_dependencies(&self) -> &[TaskId] {
        &self.depends_on
    }
}

/// DFS node coloring used for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

/// The task dependency graph.
///
/// Edges point from a dependency to its dependent, so a path in the graph
/// is a valid execution order. Node indices follow declaration order, which
/// keeps every traversal deterministic.
pub struct TaskDag {
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    missing: Vec<(String, String)>,
    duplicates: Vec<String>,
}

impl TaskDag {
    /// Build the adjacency structures from declared dependency sets.
    ///
    /// Building never fails: unknown dependencies and duplicate identities
    /// are recorded and reported by [`TaskDag::validate`]. The first
    /// declaration of a duplicated identity wins.
    pub fn build<'a, N, I>(nodes: I) -> Self
    where
        N: DagNode + 'a,
        I: IntoIterator<Item = &'a N>,
    {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        let mut duplicates = Vec::new();
        let mut declared: Vec<(NodeIndex, &'a [TaskId])> = Vec::new();

        for node in nodes {
            let id = node.node_id();
            if task_index.contains_key(id) {
                duplicates.push(id.to_string());
                continue;
            }
            let index = graph.add_node(id.clone());
            task_index.insert(id.clone(), index);
            declared.push((index, node.node_dependencies()));
        }

        let mut missing = Vec::new();
        for (index, deps) in declared {
            for dep in deps {
                match task_index.get(dep) {
                    Some(&dep_index) => {
                        graph.update_edge(dep_index, index, ());
                    }
                    None => missing.push((graph[index].to_string(), dep.to_string())),
                }
            }
        }

        Self {
            graph,
            task_index,
            missing,
            duplicates,
        }
    }

    /// Check the graph for unknown dependencies, duplicates and cycles.
    ///
    /// # Errors
    /// Returns `Error::Validation` listing every problem found, with each
    /// cycle reported as a concrete path.
    pub fn validate(&self) -> Result<()> {
        let report = ValidationError {
            missing_dependencies: self.missing.clone(),
            cycles: self.find_cycles(),
            duplicates: self.duplicates.clone(),
        };
        if report.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(report))
        }
    }

    /// Depth-first search with three-state coloring.
    ///
    /// A back-edge to an in-progress node closes a cycle; the slice of the
    /// current path from that node onwards is the cycle. The search keeps
    /// its own stack so long chains cannot exhaust the thread's stack.
    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut colors = vec![Color::Unvisited; self.graph.node_count()];
        let mut cycles = Vec::new();
        // The nodes on the stack are the current path, each with the
        // dependents it has yet to explore.
        let mut stack: Vec<(NodeIndex, std::vec::IntoIter<NodeIndex>)> = Vec::new();

        for start in self.graph.node_indices() {
            if colors[start.index()] != Color::Unvisited {
                continue;
            }
            colors[start.index()] = Color::InProgress;
            stack.push((start, self.neighbors(start, Direction::Outgoing).into_iter()));

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                let Some(next) = pending.next() else {
                    colors[node.index()] = Color::Done;
                    stack.pop();
                    continue;
                };
                match colors[next.index()] {
                    Color::Unvisited => {
                        colors[next.index()] = Color::InProgress;
                        stack.push((next, self.neighbors(next, Direction::Outgoing).into_iter()));
                    }
                    Color::InProgress => {
                        if let Some(pos) = stack.iter().position(|(n, _)| *n == next) {
                            let mut cycle: Vec<String> = stack[pos..]
                                .iter()
                                .map(|(n, _)| self.graph[*n].to_string())
                                .collect();
                            cycle.push(self.graph[next].to_string());
                            cycles.push(cycle);
                        }
                    }
                    Color::Done => {}
                }
            }
        }
        cycles
    }

    /// Neighbors in declaration order (petgraph yields newest edge first).
    fn neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        out.sort();
        out
    }

    /// Order nodes so every node comes after all of its dependencies.
    ///
    /// Kahn's algorithm: seed a queue with zero in-degree nodes, pop,
    /// append, and release dependents whose in-degree drops to zero. Ties
    /// are broken by declaration order.
    ///
    /// # Errors
    /// Returns `Error::Validation` if dependencies are unknown or if fewer
    /// nodes than exist could be ordered (a cycle).
    pub fn topological_sort(&self) -> Result<Vec<TaskId>> {
        if !self.missing.is_empty() || !self.duplicates.is_empty() {
            return Err(Error::Validation(ValidationError {
                missing_dependencies: self.missing.clone(),
                cycles: Vec::new(),
                duplicates: self.duplicates.clone(),
            }));
        }

        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| self.graph.neighbors_directed(index, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(index) = queue.pop_front() {
            order.push(self.graph[index].clone());
            for dependent in self.neighbors(index, Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() < self.graph.node_count() {
            return Err(Error::Validation(ValidationError {
                cycles: self.find_cycles(),
                ..ValidationError::default()
            }));
        }

        Ok(order)
    }

    /// Partition nodes into tiers that can run in parallel.
    ///
    /// Tier *k* holds exactly the nodes whose dependencies all lie in tiers
    /// before *k*. Declaration order is kept inside a tier.
    pub fn execution_levels(&self) -> Result<Vec<Vec<TaskId>>> {
        let order = self.topological_sort()?;
        if order.is_empty() {
            return Ok(Vec::new());
        }

        let mut depth: Vec<usize> = vec![0; self.graph.node_count()];
        for id in &order {
            let index = self.task_index[id];
            depth[index.index()] = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|dep| depth[dep.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<TaskId>> = vec![Vec::new(); max_depth + 1];
        for index in self.graph.node_indices() {
            levels[depth[index.index()]].push(self.graph[index].clone());
        }
        Ok(levels)
    }

    // ========== Queries ==========

    /// Get the number of nodes in the DAG.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get the number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.task_index.contains_key(id)
    }

    /// All node ids in declaration order.
    pub fn node_ids(&self) -> Vec<TaskId> {
        self.graph.node_indices().map(|i| self.graph[i].clone()).collect()
    }

    /// Direct dependencies of a node that exist in the graph.
    pub fn dependencies_of(&self, id: &str) -> Vec<TaskId> {
        self.adjacent(id, Direction::Incoming)
    }

    /// Nodes that directly depend on the given node.
    pub fn dependents_of(&self, id: &str) -> Vec<TaskId> {
        self.adjacent(id, Direction::Outgoing)
    }

    /// Transitive dependencies of a node.
    pub fn ancestors_of(&self, id: &str) -> Vec<TaskId> {
        self.closure(id, Direction::Incoming)
    }

    /// Transitive dependents of a node.
    pub fn descendants_of(&self, id: &str) -> Vec<TaskId> {
        self.closure(id, Direction::Outgoing)
    }

    /// Nodes without dependencies.
    pub fn roots(&self) -> Vec<TaskId> {
        self.filter_nodes(|index| {
            self.graph
                .neighbors_directed(index, Direction::Incoming)
                .next()
                .is_none()
        })
    }

    /// Nodes nothing depends on.
    pub fn leaves(&self) -> Vec<TaskId> {
        self.filter_nodes(|index| {
            self.graph
                .neighbors_directed(index, Direction::Outgoing)
                .next()
                .is_none()
        })
    }

    /// Nodes that may start now.
    ///
    /// A node is ready when it has not started (absent from `statuses` or
    /// `Pending`) and every dependency satisfies it.
    pub fn ready_nodes(&self, statuses: &HashMap<TaskId, ExecutionStatus>) -> Vec<TaskId> {
        self.filter_nodes(|index| {
            let own = statuses.get(&self.graph[index]).copied().unwrap_or_default();
            own == ExecutionStatus::Pending
                && self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        statuses
                            .get(&self.graph[dep])
                            .is_some_and(|s| s.satisfies_dependency())
                    })
        })
    }

    /// Non-terminal nodes that can never start because a dependency failed
    /// or was cancelled.
    pub fn blocked_nodes(&self, statuses: &HashMap<TaskId, ExecutionStatus>) -> Vec<TaskId> {
        self.filter_nodes(|index| {
            let own = statuses.get(&self.graph[index]).copied().unwrap_or_default();
            !own.is_terminal()
                && self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .any(|dep| {
                        statuses
                            .get(&self.graph[dep])
                            .is_some_and(|s| s.blocks_dependents())
                    })
        })
    }

    fn adjacent(&self, id: &str, direction: Direction) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .neighbors(index, direction)
                .into_iter()
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn closure(&self, id: &str, direction: Direction) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for next in self.graph.neighbors_directed(index, direction) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut found: Vec<NodeIndex> = seen.into_iter().filter(|&i| i != start).collect();
        found.sort();
        found.into_iter().map(|i| self.graph[i].clone()).collect()
    }

    fn filter_nodes(&self, keep: impl Fn(NodeIndex) -> bool) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| keep(index))
            .map(|index| self.graph[index].clone())
            .collect()
    }
}

impl Default for TaskDag {
    fn default() -> Self {
        Self::build::<NodeSpec, _>(std::iter::empty())
    }
}

impl std::fmt::Debug for TaskDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDag")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
