//! Dynamic Execution Graph: the in-memory forest of execution nodes owned by
//! one decision loop.
//!
//! The graph is a single-writer structure. Only the loop mutates it; every
//! other consumer works from [`GraphSnapshot`] deep copies published on the
//! event bus.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::dispatch::template_refs;
use crate::errors::GraphError;
use crate::models::{ExecutionNode, NodeStatus, OnFailure, WebObservation};

/// Deep copy of the graph suitable for serialization and rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, ExecutionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_node_id: Option<String>,
}

/// Outcome details attached to a status transition.
#[derive(Debug, Clone, Default)]
pub struct MarkOutcome {
    pub reason: Option<String>,
    pub output: Option<String>,
    pub observation: Option<WebObservation>,
}

impl MarkOutcome {
    pub fn failed(reason: impl Into<String>, observation: Option<WebObservation>) -> Self {
        Self {
            reason: Some(reason.into()),
            output: None,
            observation,
        }
    }

    pub fn success(output: impl Into<String>, observation: Option<WebObservation>) -> Self {
        Self {
            reason: None,
            output: Some(output.into()),
            observation,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionGraph {
    nodes: HashMap<String, ExecutionNode>,
    root_node_id: Option<String>,
    insertion_order: Vec<String>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_node_id(&self) -> Option<&str> {
        self.root_node_id.as_deref()
    }

    pub fn get(&self, node_id: &str) -> Option<&ExecutionNode> {
        self.nodes.get(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.insertion_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
    }

    /// Children of a node in scheduling order (ascending priority,
    /// insertion order on ties).
    pub fn children(&self, node_id: &str) -> Vec<&ExecutionNode> {
        self.nodes
            .get(node_id)
            .map(|node| {
                node.child_ids
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert a node, wiring it under its parent and keeping the sibling
    /// list sorted by priority. The node's own `child_ids` are discarded;
    /// links are derived from `parent_id` only.
    pub fn add_node(&mut self, mut node: ExecutionNode) -> Result<String, GraphError> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(GraphError::DuplicateNode(node.node_id));
        }

        match &node.parent_id {
            None => {
                if self.root_node_id.is_some() {
                    return Err(GraphError::RootExists);
                }
            }
            Some(parent_id) => {
                if !self.nodes.contains_key(parent_id) {
                    return Err(GraphError::ParentMissing(parent_id.clone()));
                }
            }
        }

        node.child_ids.clear();
        let node_id = node.node_id.clone();
        let parent_id = node.parent_id.clone();

        self.insertion_order.push(node_id.clone());
        self.nodes.insert(node_id.clone(), node);

        match parent_id {
            None => self.root_node_id = Some(node_id.clone()),
            Some(parent_id) => {
                self.link_child(&parent_id, &node_id);
            }
        }

        Ok(node_id)
    }

    fn link_child(&mut self, parent_id: &str, child_id: &str) {
        let mut ids = match self.nodes.get(parent_id) {
            Some(parent) => parent.child_ids.clone(),
            None => return,
        };
        ids.push(child_id.to_string());
        let mut keyed: Vec<(String, (i32, usize))> = ids
            .into_iter()
            .map(|id| {
                let key = self.sort_key(&id);
                (id, key)
            })
            .collect();
        keyed.sort_by_key(|(_, key)| *key);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.child_ids = keyed.into_iter().map(|(id, _)| id).collect();
        }
    }

    fn sort_key(&self, node_id: &str) -> (i32, usize) {
        let priority = self
            .nodes
            .get(node_id)
            .map(|node| node.execution_order_priority)
            .unwrap_or(i32::MAX);
        (priority, self.insertion_seq(node_id))
    }

    fn insertion_seq(&self, node_id: &str) -> usize {
        self.insertion_order
            .iter()
            .position(|id| id == node_id)
            .unwrap_or(usize::MAX)
    }

    /// Deterministic priority-biased selection of the next node to run.
    ///
    /// Candidates are PENDING nodes reachable from the root through SUCCESS
    /// ancestors whose precondition references all resolve. The candidate
    /// with the lowest priority wins; ties break by insertion order.
    pub fn next_runnable(&self) -> Option<&ExecutionNode> {
        let root = self.root_node_id.as_deref()?;
        let mut queue: VecDeque<&str> = VecDeque::from([root]);
        let mut best: Option<&ExecutionNode> = None;

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            match node.current_status {
                NodeStatus::Pending => {
                    if self.precondition_met(node) {
                        best = match best {
                            None => Some(node),
                            Some(current) => {
                                if self.sort_key(&node.node_id) < self.sort_key(&current.node_id) {
                                    Some(node)
                                } else {
                                    Some(current)
                                }
                            }
                        };
                    }
                }
                // Children of settled nodes are candidates. Descending into
                // FAILED nodes is what lets grafted correction subplans run;
                // ABORT/SKIP failures have already pruned or skipped their
                // descendants, so nothing leaks from abandoned branches.
                NodeStatus::Success | NodeStatus::Failed => {
                    queue.extend(node.child_ids.iter().map(String::as_str));
                }
                // Pruned, skipped, and running subtrees are opaque.
                _ => {}
            }
        }

        best
    }

    /// A precondition resolves when every `${node_id.field}` reference points
    /// at a SUCCESS node with a captured output.
    fn precondition_met(&self, node: &ExecutionNode) -> bool {
        template_refs(&node.required_precondition)
            .into_iter()
            .all(|reference| {
                self.nodes
                    .get(&reference.node_id)
                    .map(|source| {
                        source.current_status == NodeStatus::Success
                            && source.resolved_output.is_some()
                    })
                    .unwrap_or(false)
            })
    }

    /// Outputs of SUCCESS nodes, used for template resolution at dispatch.
    pub fn resolved_outputs(&self) -> HashMap<String, String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.current_status == NodeStatus::Success)
            .filter_map(|(id, node)| {
                node.resolved_output
                    .as_ref()
                    .map(|output| (id.clone(), output.clone()))
            })
            .collect()
    }

    /// Transition a node, enforcing legality and applying the on-failure
    /// policy to its descendants. Returns every node id whose status changed.
    pub fn mark(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        outcome: MarkOutcome,
    ) -> Result<Vec<String>, GraphError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;
        let from = node.current_status;

        if from == status {
            // Re-marking pruned/skipped nodes is an idempotent no-op.
            if matches!(status, NodeStatus::Pruned | NodeStatus::Skipped) {
                return Ok(Vec::new());
            }
            return Err(GraphError::IllegalTransition {
                node: node_id.to_string(),
                from,
                to: status,
            });
        }

        if !legal_transition(from, status) {
            return Err(GraphError::IllegalTransition {
                node: node_id.to_string(),
                from,
                to: status,
            });
        }

        let policy = node.action.on_failure_action;
        let mut changed = vec![node_id.to_string()];

        {
            let node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;
            node.current_status = status;
            if let Some(reason) = outcome.reason {
                node.failure_reason = Some(reason);
            }
            if status == NodeStatus::Success {
                if let Some(output) = outcome.output {
                    node.resolved_output = Some(output);
                }
            }
            if let Some(observation) = outcome.observation {
                node.last_observation = Some(observation);
            }
        }

        if status == NodeStatus::Failed {
            match policy {
                OnFailure::Abort => {
                    changed.extend(self.overwrite_descendants(
                        node_id,
                        NodeStatus::Pruned,
                        &format!("pruned due to failure of ancestor {node_id}"),
                    ));
                }
                OnFailure::Skip => {
                    changed.extend(self.overwrite_descendants(
                        node_id,
                        NodeStatus::Skipped,
                        &format!("skipped due to failure of ancestor {node_id}"),
                    ));
                }
                // RE_EVALUATE and RETRY_ONLY leave descendants pending for the
                // loop to revisit after correction or finalization.
                OnFailure::ReEvaluate | OnFailure::RetryOnly => {}
            }
        }

        Ok(changed)
    }

    /// Prune a node and its whole subtree. Idempotent. FAILED nodes keep
    /// their status so failure evidence survives the cascade.
    pub fn prune(&mut self, node_id: &str, reason: &str) -> Result<Vec<String>, GraphError> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphError::UnknownNode(node_id.to_string()));
        }
        let mut changed = Vec::new();
        if let Some(node) = self.nodes.get_mut(node_id) {
            if !matches!(
                node.current_status,
                NodeStatus::Pruned | NodeStatus::Failed
            ) {
                node.current_status = NodeStatus::Pruned;
                node.failure_reason = Some(reason.to_string());
                changed.push(node_id.to_string());
            }
        }
        changed.extend(self.overwrite_descendants(node_id, NodeStatus::Pruned, reason));
        Ok(changed)
    }

    fn overwrite_descendants(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        reason: &str,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        let mut queue: VecDeque<String> = self
            .nodes
            .get(node_id)
            .map(|node| node.child_ids.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            if let Some(node) = self.nodes.get_mut(&id) {
                queue.extend(node.child_ids.iter().cloned());
                let overwrite = match status {
                    // Pruning clears every live descendant, succeeded ones
                    // included; only FAILED evidence is preserved.
                    NodeStatus::Pruned => !matches!(
                        node.current_status,
                        NodeStatus::Pruned | NodeStatus::Failed
                    ),
                    // Skipping only touches nodes that never ran.
                    NodeStatus::Skipped => node.current_status == NodeStatus::Pending,
                    _ => false,
                };
                if overwrite {
                    node.current_status = status;
                    node.failure_reason = Some(reason.to_string());
                    changed.push(id);
                }
            }
        }
        changed
    }

    /// Graft a correction subplan under `after_node_id`.
    ///
    /// Parentless entries become children of the anchor. Entries anchored
    /// directly under it receive priorities strictly below every pending
    /// sibling so the correction runs before the original continuation.
    /// Returns the injected node ids in insertion order.
    pub fn inject_correction(
        &mut self,
        after_node_id: &str,
        nodes: Vec<ExecutionNode>,
    ) -> Result<Vec<String>, GraphError> {
        let anchor = self
            .nodes
            .get(after_node_id)
            .ok_or_else(|| GraphError::UnknownNode(after_node_id.to_string()))?;
        if !matches!(
            anchor.current_status,
            NodeStatus::Failed | NodeStatus::Success
        ) {
            return Err(GraphError::BadAnchor {
                node: after_node_id.to_string(),
                status: anchor.current_status,
            });
        }

        let min_pending_priority = anchor
            .child_ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|child| child.current_status == NodeStatus::Pending)
            .map(|child| child.execution_order_priority)
            .min();

        let batch_ids: Vec<String> = nodes.iter().map(|node| node.node_id.clone()).collect();
        let anchored = nodes
            .iter()
            .filter(|node| match &node.parent_id {
                None => true,
                Some(parent) => parent == after_node_id || !batch_ids.contains(parent),
            })
            .count() as i32;

        let mut injected = Vec::with_capacity(nodes.len());
        let mut anchored_index = 0i32;
        for mut node in nodes {
            let reparent = match &node.parent_id {
                None => true,
                // Unknown parents (outside the graph and the batch) anchor too.
                Some(parent) => parent != after_node_id && !batch_ids.contains(parent),
            };
            let is_anchored = reparent || node.parent_id.as_deref() == Some(after_node_id);
            if reparent {
                node.parent_id = Some(after_node_id.to_string());
            }
            if is_anchored {
                if let Some(min_pending) = min_pending_priority {
                    // Keep batch order, land everything below the pending set.
                    node.execution_order_priority = min_pending - anchored + anchored_index;
                }
                anchored_index += 1;
            }
            node.current_status = NodeStatus::Pending;
            node.failure_reason = None;
            node.resolved_output = None;
            injected.push(self.add_node(node)?);
        }

        Ok(injected)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| (id.clone(), node.clone()))
                .collect(),
            root_node_id: self.root_node_id.clone(),
        }
    }

    /// Structural invariant check used by the test suite.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> Result<(), String> {
        for (id, node) in &self.nodes {
            if let Some(parent_id) = &node.parent_id {
                let parent = self
                    .nodes
                    .get(parent_id)
                    .ok_or_else(|| format!("node {id} has missing parent {parent_id}"))?;
                if !parent.child_ids.contains(id) {
                    return Err(format!("parent {parent_id} does not list child {id}"));
                }
            }
            for child_id in &node.child_ids {
                let child = self
                    .nodes
                    .get(child_id)
                    .ok_or_else(|| format!("node {id} lists missing child {child_id}"))?;
                if child.parent_id.as_deref() != Some(id) {
                    return Err(format!("child {child_id} does not point back at {id}"));
                }
            }
            if node.resolved_output.is_some()
                && !matches!(
                    node.current_status,
                    NodeStatus::Success | NodeStatus::Pruned
                )
            {
                return Err(format!("node {id} carries output without success"));
            }
        }

        // Acyclicity: walking parents from any node must reach a root.
        for (id, mut node) in self.nodes.iter().map(|(id, node)| (id, node)) {
            let mut hops = 0usize;
            while let Some(parent_id) = &node.parent_id {
                hops += 1;
                if hops > self.nodes.len() {
                    return Err(format!("cycle detected walking parents from {id}"));
                }
                node = match self.nodes.get(parent_id) {
                    Some(parent) => parent,
                    None => break,
                };
            }
        }
        Ok(())
    }
}

fn legal_transition(from: NodeStatus, to: NodeStatus) -> bool {
    use NodeStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Success)
            | (Running, Failed)
            | (Pending, Failed)
            | (Pending, Skipped)
            | (Pending, Pruned)
            | (Running, Pruned)
            | (Skipped, Pruned)
            | (Success, Pruned)
    )
}
