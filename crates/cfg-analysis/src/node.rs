//! CFG node state
//!
//! One [`CfgNode`] per maximal block, holding everything the analysis
//! passes decide about it: text/data classification, the candidate start
//! address chosen after overlap reconciliation, labeled edge slots, and the
//! procedure assignment made during interprocedural recovery.
//!
//! Nodes never hold references to each other; every edge stores the peer's
//! numeric id (equal to its maximal-block id) plus the branch target
//! address that created the edge.

use section_disasm::Addr;

/// Classification of a node's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Decodes as code (the initial state).
    Code,
    /// Resolved to data; terminal.
    Data,
    /// Suspected data, classification deferred.
    MaybeData,
}

/// Role a node plays inside its assigned procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureRole {
    Unassigned,
    Entry,
    Body,
    Exit,
}

/// An edge labeled with the address the source branch actually targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgEdge {
    /// Peer node id.
    pub node: usize,
    /// Branch target address that created this edge.
    pub target_addr: Addr,
}

/// Analysis state for one maximal block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgNode {
    pub(crate) id: usize,
    pub(crate) node_type: NodeType,
    pub(crate) candidate_start_addr: Option<Addr>,
    /// The later node whose bytes intrude on this one, if any.
    pub(crate) overlap_next: Option<usize>,
    pub(crate) direct_preds: Vec<CfgEdge>,
    pub(crate) indirect_preds: Vec<CfgEdge>,
    pub(crate) immediate_succ: Option<usize>,
    pub(crate) remote_succ: Option<usize>,
    pub(crate) indirect_succs: Vec<CfgEdge>,
    pub(crate) procedure_entry_addr: Option<Addr>,
    pub(crate) role: ProcedureRole,
    /// Set when this node is the fall-through of a direct call.
    pub(crate) preceding_call: Option<usize>,
    /// For a call node, the recorded return site.
    pub(crate) return_succ: Option<usize>,
}

impl CfgNode {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            node_type: NodeType::Code,
            candidate_start_addr: None,
            overlap_next: None,
            direct_preds: Vec::new(),
            indirect_preds: Vec::new(),
            immediate_succ: None,
            remote_succ: None,
            indirect_succs: Vec::new(),
            procedure_entry_addr: None,
            role: ProcedureRole::Unassigned,
            preceding_call: None,
            return_succ: None,
        }
    }

    /// The node's id; equals its position in the CFG and the block sequence.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current classification.
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Whether the node has been resolved to data.
    pub fn is_data(&self) -> bool {
        self.node_type == NodeType::Data
    }

    /// The candidate start address, once refinement has chosen one.
    pub fn candidate_start_addr(&self) -> Option<Addr> {
        self.candidate_start_addr
    }

    pub(crate) fn set_candidate_start_addr(&mut self, addr: Addr) {
        self.candidate_start_addr = Some(addr);
    }

    /// Id of the later node whose bytes intrude on this one.
    pub fn overlap_next(&self) -> Option<usize> {
        self.overlap_next
    }

    /// Direct (immediate + remote) predecessor edges.
    pub fn direct_preds(&self) -> &[CfgEdge] {
        &self.direct_preds
    }

    /// Switch-case predecessor edges.
    pub fn indirect_preds(&self) -> &[CfgEdge] {
        &self.indirect_preds
    }

    /// Fall-through successor of a conditional branch.
    pub fn immediate_succ(&self) -> Option<usize> {
        self.immediate_succ
    }

    /// Target node of a direct branch inside the section.
    pub fn remote_succ(&self) -> Option<usize> {
        self.remote_succ
    }

    /// Switch-case successor edges registered by table recovery.
    pub fn indirect_succs(&self) -> &[CfgEdge] {
        &self.indirect_succs
    }

    /// Whether switch recovery attached any case targets to this node.
    pub fn is_switch(&self) -> bool {
        !self.indirect_succs.is_empty()
    }

    /// Entry address of the procedure this node was assigned to.
    pub fn procedure_entry_addr(&self) -> Option<Addr> {
        self.procedure_entry_addr
    }

    /// Role within the assigned procedure.
    pub fn role(&self) -> ProcedureRole {
        self.role
    }

    /// The call node this node is the return site of, if any.
    pub fn preceding_call(&self) -> Option<usize> {
        self.preceding_call
    }

    /// The recorded return site when this node ends in a call.
    pub fn return_succ(&self) -> Option<usize> {
        self.return_succ
    }

    /// Whether this node sits at a call fall-through.
    pub fn is_possible_return(&self) -> bool {
        self.preceding_call.is_some()
    }
}
