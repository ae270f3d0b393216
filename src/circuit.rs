// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit graphs over hook points.
//!
//! A [`CircuitNode`] names one intervention site: a hook name, optionally
//! narrowed to one attention head. A [`Circuit`] is a directed graph of
//! such nodes. Two circuits matter for IIA: the *full* circuit (every node
//! of the model, see [`Circuit::full_acdc`]) and the *claimed* circuit (the
//! hypothesised causal subgraph), which must be a subset of the full one.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IiaError, Result};
use crate::hooks::HookPoint;

// ---------------------------------------------------------------------------
// CircuitNode
// ---------------------------------------------------------------------------

/// One addressable activation site.
///
/// Displays as `name` for whole-tensor nodes and `name[index]` for
/// head-indexed nodes; that string is the node's key in IIA reports.
///
/// ```
/// use candle_iia::CircuitNode;
///
/// let node = CircuitNode::new("blocks.0.attn.hook_result", Some(2));
/// assert_eq!(node.to_string(), "blocks.0.attn.hook_result[2]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitNode {
    /// Hook name of the activation site.
    name: String,
    /// Optional head index along the head axis.
    index: Option<usize>,
}

impl CircuitNode {
    /// Create a node.
    pub fn new(name: impl Into<String>, index: Option<usize>) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Create a whole-tensor node from a hook point.
    #[must_use]
    pub fn at(hook: &HookPoint) -> Self {
        Self::new(hook.to_string(), None)
    }

    /// Create a head-indexed node from a hook point.
    #[must_use]
    pub fn head(hook: &HookPoint, head: usize) -> Self {
        Self::new(hook.to_string(), Some(head))
    }

    /// Hook name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Head index, if the node is narrowed to one head.
    #[must_use]
    pub const fn index(&self) -> Option<usize> {
        self.index
    }

    /// Hook point the node lives at.
    #[must_use]
    pub fn hook_point(&self) -> HookPoint {
        HookPoint::from(self.name.as_str())
    }
}

impl fmt::Display for CircuitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{index}]", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit
// ---------------------------------------------------------------------------

/// Directed graph of [`CircuitNode`]s.
///
/// Nodes and edges live in ordered sets, so iteration order is
/// deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    /// All nodes, including isolated ones.
    nodes: BTreeSet<CircuitNode>,
    /// Directed edges `(from, to)`.
    edges: BTreeSet<(CircuitNode, CircuitNode)>,
}

impl Circuit {
    /// Create an empty circuit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a circuit from a node list, without edges.
    pub fn from_nodes<I: IntoIterator<Item = CircuitNode>>(nodes: I) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            edges: BTreeSet::new(),
        }
    }

    /// Add a node. Returns `false` if it was already present.
    pub fn add_node(&mut self, node: CircuitNode) -> bool {
        self.nodes.insert(node)
    }

    /// Add a directed edge, inserting both endpoints.
    pub fn add_edge(&mut self, from: CircuitNode, to: CircuitNode) {
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.edges.insert((from, to));
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, node: &CircuitNode) -> bool {
        self.nodes.contains(node)
    }

    /// Nodes in deterministic (sorted) order.
    pub fn nodes(&self) -> impl Iterator<Item = &CircuitNode> {
        self.nodes.iter()
    }

    /// Edges in deterministic (sorted) order.
    pub fn edges(&self) -> impl Iterator<Item = &(CircuitNode, CircuitNode)> {
        self.edges.iter()
    }

    /// Direct successors of a node.
    pub fn successors<'a>(&'a self, node: &'a CircuitNode) -> impl Iterator<Item = &'a CircuitNode> {
        self.edges
            .iter()
            .filter(move |(from, _)| from == node)
            .map(|(_, to)| to)
    }

    /// Distinct hook names, ignoring head indices.
    #[must_use]
    pub fn hook_names(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(CircuitNode::name).collect()
    }

    /// Whether every node and edge of `self` also belongs to `other`.
    #[must_use]
    pub fn is_subcircuit_of(&self, other: &Self) -> bool {
        self.nodes.is_subset(&other.nodes) && self.edges.is_subset(&other.edges)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the circuit has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges.
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Full ACDC-granularity circuit of an `n_layers` x `n_heads` model.
    ///
    /// Nodes: `blocks.0.hook_resid_pre`; per layer and head the
    /// `hook_q_input`/`hook_k_input`/`hook_v_input` inputs and the
    /// `attn.hook_result` output; per layer `hook_mlp_in` and
    /// `hook_mlp_out`; and the final `hook_resid_post`. Every output that
    /// precedes an input in the residual stream gets an edge to it.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if `n_layers` or `n_heads` is zero.
    pub fn full_acdc(n_layers: usize, n_heads: usize) -> Result<Self> {
        if n_layers == 0 || n_heads == 0 {
            return Err(IiaError::Config(format!(
                "full circuit needs at least one layer and one head, got {n_layers} layers, {n_heads} heads"
            )));
        }

        let mut circuit = Self::new();
        let mut upstream = vec![CircuitNode::at(&HookPoint::ResidPre(0))];

        for layer in 0..n_layers {
            let mut results = Vec::with_capacity(n_heads);
            for head in 0..n_heads {
                let result = CircuitNode::head(&HookPoint::AttnResult(layer), head);
                for input_hook in [
                    HookPoint::QInput(layer),
                    HookPoint::KInput(layer),
                    HookPoint::VInput(layer),
                ] {
                    let input = CircuitNode::head(&input_hook, head);
                    for source in &upstream {
                        circuit.add_edge(source.clone(), input.clone());
                    }
                    circuit.add_edge(input, result.clone());
                }
                results.push(result);
            }
            upstream.extend(results);

            let mlp_in = CircuitNode::at(&HookPoint::MlpIn(layer));
            let mlp_out = CircuitNode::at(&HookPoint::MlpOut(layer));
            for source in &upstream {
                circuit.add_edge(source.clone(), mlp_in.clone());
            }
            circuit.add_edge(mlp_in, mlp_out.clone());
            upstream.push(mlp_out);
        }

        let resid_post = CircuitNode::at(&HookPoint::ResidPost(n_layers - 1));
        for source in &upstream {
            circuit.add_edge(source.clone(), resid_post.clone());
        }

        Ok(circuit)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn node_display_and_hook_point() {
        let whole = CircuitNode::at(&HookPoint::MlpOut(1));
        assert_eq!(whole.to_string(), "blocks.1.hook_mlp_out");
        assert_eq!(whole.hook_point(), HookPoint::MlpOut(1));

        let head = CircuitNode::head(&HookPoint::QInput(0), 3);
        assert_eq!(head.to_string(), "blocks.0.hook_q_input[3]");
        assert_eq!(head.index(), Some(3));
    }

    #[test]
    fn node_equality_uses_name_and_index() {
        let a = CircuitNode::new("blocks.0.attn.hook_result", Some(0));
        let b = CircuitNode::new("blocks.0.attn.hook_result", Some(1));
        let c = CircuitNode::new("blocks.0.attn.hook_result", Some(0));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn full_acdc_node_count() {
        // resid_pre + per layer (4 * heads + 2) + resid_post
        let circuit = Circuit::full_acdc(2, 3).unwrap();
        assert_eq!(circuit.len(), 1 + 2 * (4 * 3 + 2) + 1);
        assert!(circuit.contains(&CircuitNode::at(&HookPoint::ResidPre(0))));
        assert!(circuit.contains(&CircuitNode::at(&HookPoint::ResidPost(1))));
        assert!(!circuit.contains(&CircuitNode::at(&HookPoint::ResidPost(0))));
    }

    #[test]
    fn full_acdc_edges_follow_residual_order() {
        let circuit = Circuit::full_acdc(2, 1).unwrap();
        let head0 = CircuitNode::head(&HookPoint::AttnResult(0), 0);
        let successors: Vec<String> = circuit.successors(&head0).map(ToString::to_string).collect();

        assert!(successors.contains(&"blocks.0.hook_mlp_in".to_string()));
        assert!(successors.contains(&"blocks.1.hook_q_input[0]".to_string()));
        assert!(successors.contains(&"blocks.1.hook_resid_post".to_string()));
        // Heads in the same layer do not feed each other.
        assert!(!successors.contains(&"blocks.0.hook_q_input[0]".to_string()));
    }

    #[test]
    fn full_acdc_rejects_empty_model() {
        assert!(Circuit::full_acdc(0, 4).is_err());
        assert!(Circuit::full_acdc(2, 0).is_err());
    }

    #[test]
    fn subcircuit_check() {
        let full = Circuit::full_acdc(1, 2).unwrap();
        let claimed = Circuit::from_nodes([
            CircuitNode::at(&HookPoint::ResidPre(0)),
            CircuitNode::head(&HookPoint::AttnResult(0), 1),
        ]);
        assert!(claimed.is_subcircuit_of(&full));

        let stray = Circuit::from_nodes([CircuitNode::head(&HookPoint::AttnResult(5), 0)]);
        assert!(!stray.is_subcircuit_of(&full));
    }

    #[test]
    fn hook_names_dedupe_heads() {
        let full = Circuit::full_acdc(1, 4).unwrap();
        // resid_pre, q/k/v input, result, mlp_in, mlp_out, resid_post
        assert_eq!(full.hook_names().len(), 8);
    }
}
