//! The CFG arena
//!
//! The graph is a plain vector of [`CfgNode`]s parallel to the section's
//! maximal-block sequence; node ids are vector positions and never change.
//! Edge mutation lives here so the invariant "a data node is detached in
//! both directions" has a single enforcement point.

use section_disasm::Addr;
use tracing::debug;

use crate::node::{CfgEdge, CfgNode, NodeType};

/// Control-flow graph over a section's maximal blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cfg {
    nodes: Vec<CfgNode>,
    valid: bool,
}

impl Cfg {
    pub(crate) fn with_node_count(count: usize) -> Self {
        Self {
            nodes: (0..count).map(CfgNode::new).collect(),
            valid: false,
        }
    }

    /// Number of nodes (one per maximal block).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node with the given id.
    pub fn node(&self, id: usize) -> &CfgNode {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: usize) -> &mut CfgNode {
        &mut self.nodes[id]
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> &[CfgNode] {
        &self.nodes
    }

    /// The node preceding `id` in address order.
    pub fn previous(&self, id: usize) -> Option<&CfgNode> {
        id.checked_sub(1).map(|prev| &self.nodes[prev])
    }

    /// Whether `id` names the final node.
    pub fn is_last(&self, id: usize) -> bool {
        id + 1 == self.nodes.len()
    }

    /// Whether construction completed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn mark_valid(&mut self) {
        self.valid = true;
    }

    /// Reclassify a node as data and detach it from the graph.
    ///
    /// Every successor loses its predecessor edge from the node, every
    /// predecessor loses its successor edge into it, and the node's own
    /// edge lists are cleared. Data is terminal; calling this on a node
    /// that is already data does nothing.
    pub(crate) fn set_to_data_and_invalidate(&mut self, id: usize) {
        if self.nodes[id].node_type == NodeType::Data {
            return;
        }
        debug!(node = id, "reclassifying node as data");
        self.nodes[id].node_type = NodeType::Data;

        let succs: Vec<usize> = self.nodes[id]
            .immediate_succ
            .into_iter()
            .chain(self.nodes[id].remote_succ)
            .chain(self.nodes[id].indirect_succs.iter().map(|edge| edge.node))
            .collect();
        for succ in succs {
            self.nodes[succ].direct_preds.retain(|edge| edge.node != id);
            self.nodes[succ]
                .indirect_preds
                .retain(|edge| edge.node != id);
        }

        let preds: Vec<usize> = self.nodes[id]
            .direct_preds
            .iter()
            .chain(self.nodes[id].indirect_preds.iter())
            .map(|edge| edge.node)
            .collect();
        for pred in preds {
            let pred_node = &mut self.nodes[pred];
            if pred_node.immediate_succ == Some(id) {
                pred_node.immediate_succ = None;
            }
            if pred_node.remote_succ == Some(id) {
                pred_node.remote_succ = None;
            }
            pred_node.indirect_succs.retain(|edge| edge.node != id);
        }

        let node = &mut self.nodes[id];
        node.immediate_succ = None;
        node.remote_succ = None;
        node.indirect_succs.clear();
        node.direct_preds.clear();
        node.indirect_preds.clear();
    }

    /// Register a remote-successor edge labeled with the branch target.
    pub(crate) fn add_remote_edge(&mut self, from: usize, to: usize, target_addr: Addr) {
        self.nodes[from].remote_succ = Some(to);
        self.nodes[to].direct_preds.push(CfgEdge {
            node: from,
            target_addr,
        });
    }

    /// Register an immediate (fall-through) successor edge.
    pub(crate) fn add_immediate_edge(&mut self, from: usize, to: usize, target_addr: Addr) {
        self.nodes[from].immediate_succ = Some(to);
        self.nodes[to].direct_preds.push(CfgEdge {
            node: from,
            target_addr,
        });
    }

    /// Register a switch-case edge from a table branch to one case target.
    /// Re-registering an existing edge is a no-op.
    pub(crate) fn add_switch_edge(&mut self, origin: usize, to: usize, target_addr: Addr) {
        let edge = CfgEdge {
            node: to,
            target_addr,
        };
        if self.nodes[origin].indirect_succs.contains(&edge) {
            return;
        }
        self.nodes[origin].indirect_succs.push(edge);
        self.nodes[to].indirect_preds.push(CfgEdge {
            node: origin,
            target_addr,
        });
    }

    /// Minimum branch-target address over the node's non-data predecessors
    /// (direct and switch), or 0 when it has none.
    pub(crate) fn min_pred_target_addr(&self, id: usize) -> Addr {
        self.nodes[id]
            .direct_preds
            .iter()
            .chain(self.nodes[id].indirect_preds.iter())
            .filter(|edge| !self.nodes[edge.node].is_data())
            .map(|edge| edge.target_addr)
            .min()
            .unwrap_or(0)
    }
}
