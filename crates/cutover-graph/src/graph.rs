//! Stack dependency graph
//!
//! Nodes live in an insertion-ordered arena keyed by [`StackId`]. Edges are
//! kept separately in a `DiGraphMap` over interned slots, pointing from a
//! dependency to its dependent. A dependency may be named before it is added
//! (forward declaration); such ids get a slot but no arena entry.

use crate::error::GraphError;
use crate::state_machine::validate_transition;
use crate::types::{StackId, StackNode, StackStatus};
use indexmap::IndexMap;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Slot(u32);

/// Dependency DAG over deployable stacks
#[derive(Debug, Default, Clone)]
pub struct StackGraph {
    nodes: IndexMap<StackId, StackNode>,
    edges: DiGraphMap<Slot, ()>,
    slots: HashMap<StackId, Slot>,
    names: HashMap<Slot, StackId>,
    next_slot: u32,
}

impl StackGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack and its dependencies
    ///
    /// # Errors
    /// - `DuplicateNode` if `id` was already added
    /// - `CycleDetected` if the new edges would close a cycle; the graph is
    ///   left exactly as it was
    pub fn add_node(
        &mut self,
        id: impl Into<StackId>,
        depends_on: &[&str],
    ) -> Result<(), GraphError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        if depends_on.iter().any(|dep| *dep == id.as_str()) {
            return Err(GraphError::CycleDetected(id));
        }

        let mut fresh = Vec::new();
        let target = self.intern(id.as_str(), &mut fresh);
        let mut added = Vec::new();
        let mut deps: Vec<StackId> = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            let slot = self.intern(dep, &mut fresh);
            if self.edges.add_edge(slot, target, ()).is_none() {
                added.push(slot);
                deps.push(StackId::from(*dep));
            }
        }

        if petgraph::algo::is_cyclic_directed(&self.edges) {
            for slot in added {
                self.edges.remove_edge(slot, target);
            }
            for slot in fresh {
                self.forget_slot(slot);
            }
            tracing::warn!(stack = %id, "rejected stack: dependency cycle");
            return Err(GraphError::CycleDetected(id));
        }

        tracing::debug!(stack = %id, dependencies = ?deps, "added stack");
        self.nodes.insert(id.clone(), StackNode::new(id, deps));
        Ok(())
    }

    /// Creation order: every dependency precedes its dependents, ties broken
    /// by insertion order
    ///
    /// # Errors
    /// - `UnknownNode` if a dependency was named but never added
    /// - `CycleDetected` if the graph is not a DAG
    pub fn topological_order(&self) -> Result<Vec<StackId>, GraphError> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, node) in self.nodes.values().enumerate() {
            for dep in &node.depends_on {
                let dep_idx = self
                    .nodes
                    .get_index_of(dep)
                    .ok_or_else(|| GraphError::UnknownNode(dep.clone()))?;
                indegree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &next in &dependents[idx] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < n {
            let stuck = indegree
                .iter()
                .position(|d| *d > 0)
                .and_then(|i| self.nodes.get_index(i))
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| StackId::from("<unknown>"));
            return Err(GraphError::CycleDetected(stuck));
        }

        Ok(order
            .into_iter()
            .filter_map(|i| self.nodes.get_index(i).map(|(id, _)| id.clone()))
            .collect())
    }

    /// Teardown order: dependents before their dependencies
    ///
    /// # Errors
    /// Same as [`Self::topological_order`]
    pub fn teardown_order(&self) -> Result<Vec<StackId>, GraphError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Submit a stack to the provisioner (`Pending|Failed → InProgress`)
    ///
    /// # Errors
    /// `UnknownNode`, `DependencyNotReady` or `IllegalTransition`
    pub fn mark_in_progress(&mut self, id: &str) -> Result<(), GraphError> {
        self.check_dependencies_ready(id)?;
        let node = self.node_mut(id)?;
        validate_transition(&node.id, node.status, StackStatus::InProgress)?;
        node.status = StackStatus::InProgress;
        node.failure = None;
        tracing::info!(stack = %node.id, "stack provisioning started");
        Ok(())
    }

    /// Record a successful provisioning and store the stack's outputs
    ///
    /// # Errors
    /// `UnknownNode`, `DependencyNotReady` or `IllegalTransition`
    pub fn mark_ready(
        &mut self,
        id: &str,
        outputs: BTreeMap<String, String>,
    ) -> Result<(), GraphError> {
        self.check_dependencies_ready(id)?;
        let node = self.node_mut(id)?;
        validate_transition(&node.id, node.status, StackStatus::Ready)?;
        node.status = StackStatus::Ready;
        node.outputs = outputs;
        tracing::info!(stack = %node.id, outputs = node.outputs.len(), "stack ready");
        Ok(())
    }

    /// Record a provisioning failure
    ///
    /// # Errors
    /// `UnknownNode` or `IllegalTransition`
    pub fn mark_failed(&mut self, id: &str, reason: impl Into<String>) -> Result<(), GraphError> {
        let node = self.node_mut(id)?;
        validate_transition(&node.id, node.status, StackStatus::Failed)?;
        let reason = reason.into();
        tracing::error!(stack = %node.id, %reason, "stack provisioning failed");
        node.status = StackStatus::Failed;
        node.failure = Some(reason);
        Ok(())
    }

    /// Look up an output exported by a `Ready` stack
    ///
    /// # Errors
    /// - `UnknownNode` if the producer was never added
    /// - `OutputNotFound` if it is not `Ready` or lacks `key`
    pub fn resolve_output(&self, id: &str, key: &str) -> Result<String, GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(StackId::from(id)))?;
        if !node.is_ready() {
            return Err(GraphError::OutputNotFound {
                stack: node.id.clone(),
                key: key.to_string(),
            });
        }
        node.outputs
            .get(key)
            .cloned()
            .ok_or_else(|| GraphError::OutputNotFound {
                stack: node.id.clone(),
                key: key.to_string(),
            })
    }

    /// Outputs of the stack's direct dependencies, keyed `"<dependency>.<key>"`
    ///
    /// # Errors
    /// `UnknownNode` if `id` was never added
    pub fn dependency_outputs(&self, id: &str) -> Result<BTreeMap<String, String>, GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(StackId::from(id)))?;
        let mut params = BTreeMap::new();
        for dep in &node.depends_on {
            if let Some(producer) = self.nodes.get(dep).filter(|p| p.is_ready()) {
                for (key, value) in &producer.outputs {
                    params.insert(format!("{dep}.{key}"), value.clone());
                }
            }
        }
        Ok(params)
    }

    /// Whether any transitive dependency of the stack has `Failed`
    ///
    /// # Errors
    /// `UnknownNode` if `id` was never added
    pub fn is_blocked(&self, id: &str) -> Result<bool, GraphError> {
        let start = self.declared_slot(id)?;
        let upstream = Reversed(&self.edges);
        let mut dfs = Dfs::new(upstream, start);
        while let Some(slot) = dfs.next(upstream) {
            if slot == start {
                continue;
            }
            let failed = self
                .names
                .get(&slot)
                .and_then(|name| self.nodes.get(name))
                .is_some_and(|n| n.status == StackStatus::Failed);
            if failed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Declared stacks that directly depend on `id`
    ///
    /// # Errors
    /// `UnknownNode` if `id` was never added
    pub fn dependents(&self, id: &str) -> Result<Vec<StackId>, GraphError> {
        let slot = self.declared_slot(id)?;
        let mut out: Vec<StackId> = self
            .edges
            .neighbors_directed(slot, Direction::Outgoing)
            .filter_map(|s| self.names.get(&s))
            .filter(|name| self.nodes.contains_key(*name))
            .cloned()
            .collect();
        out.sort_by_key(|name| self.nodes.get_index_of(name));
        Ok(out)
    }

    /// Remove a torn-down stack
    ///
    /// # Errors
    /// - `UnknownNode` if `id` was never added
    /// - `HasDependents` if declared stacks still depend on it
    pub fn remove_node(&mut self, id: &str) -> Result<StackNode, GraphError> {
        let dependents = self.dependents(id)?;
        if !dependents.is_empty() {
            return Err(GraphError::HasDependents {
                stack: StackId::from(id),
                dependents,
            });
        }

        let slot = self.declared_slot(id)?;
        let upstream: Vec<Slot> = self
            .edges
            .neighbors_directed(slot, Direction::Incoming)
            .collect();
        self.forget_slot(slot);
        // Forward-declared dependencies that nothing else references
        for dep in upstream {
            let declared = self
                .names
                .get(&dep)
                .is_some_and(|name| self.nodes.contains_key(name));
            if !declared && self.edges.neighbors_directed(dep, Direction::Outgoing).next().is_none() {
                self.forget_slot(dep);
            }
        }

        let node = self
            .nodes
            .shift_remove(id)
            .ok_or_else(|| GraphError::UnknownNode(StackId::from(id)))?;
        tracing::info!(stack = %node.id, "stack removed");
        Ok(node)
    }

    /// Node by id
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&StackNode> {
        self.nodes.get(id)
    }

    /// Status by id
    #[must_use]
    pub fn status(&self, id: &str) -> Option<StackStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &StackNode> + '_ {
        self.nodes.values()
    }

    /// `(id, status)` pairs in insertion order
    #[must_use]
    pub fn statuses(&self) -> Vec<(StackId, StackStatus)> {
        self.nodes
            .values()
            .map(|n| (n.id.clone(), n.status))
            .collect()
    }

    /// Whether `id` was added
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of declared stacks
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no stack was added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether every declared stack is `Ready`
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.nodes.values().all(StackNode::is_ready)
    }

    fn intern(&mut self, name: &str, fresh: &mut Vec<Slot>) -> Slot {
        if let Some(slot) = self.slots.get(name) {
            return *slot;
        }
        let slot = Slot(self.next_slot);
        self.next_slot += 1;
        self.slots.insert(StackId::from(name), slot);
        self.names.insert(slot, StackId::from(name));
        self.edges.add_node(slot);
        fresh.push(slot);
        slot
    }

    fn forget_slot(&mut self, slot: Slot) {
        self.edges.remove_node(slot);
        if let Some(name) = self.names.remove(&slot) {
            self.slots.remove(&name);
        }
    }

    fn declared_slot(&self, id: &str) -> Result<Slot, GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::UnknownNode(StackId::from(id)));
        }
        self.slots
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(StackId::from(id)))
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut StackNode, GraphError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownNode(StackId::from(id)))
    }

    fn check_dependencies_ready(&self, id: &str) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(StackId::from(id)))?;
        let unready = node
            .depends_on
            .iter()
            .find(|dep| !self.nodes.get(*dep).is_some_and(StackNode::is_ready));
        match unready {
            Some(dep) => Err(GraphError::DependencyNotReady {
                stack: node.id.clone(),
                dependency: dep.clone(),
            }),
            None => Ok(()),
        }
    }
}
