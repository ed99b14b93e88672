//! The analysis driver
//!
//! [`SectionAnalyzer`] owns all pass state and borrows the decoded section
//! for the analyzer's whole lifetime. The passes run strictly in sequence
//! ([`build_cfg`](SectionAnalyzer::build_cfg),
//! [`refine_cfg`](SectionAnalyzer::refine_cfg),
//! [`recover_switch_statements`](SectionAnalyzer::recover_switch_statements),
//! [`build_call_graph`](SectionAnalyzer::build_call_graph)), each mutating
//! the graph exclusively; downstream readers see only the final snapshot.

use section_disasm::{Addr, Instruction, MaximalBlock, SectionDisassembly};

use crate::{error::AnalysisError, graph::Cfg, icfg::CallGraph, node::ProcedureRole};

/// Section-level disassembly analyzer for one executable section.
pub struct SectionAnalyzer<'a> {
    pub(crate) section: &'a SectionDisassembly,
    pub(crate) exec_start: Addr,
    pub(crate) exec_end: Addr,
    pub(crate) resolve_loads: bool,
    pub(crate) cfg: Cfg,
    pub(crate) call_graph: CallGraph,
}

impl<'a> SectionAnalyzer<'a> {
    /// Create an analyzer over `section` with the executable address
    /// window `[exec_start, exec_end)`.
    pub fn new(section: &'a SectionDisassembly, exec_start: Addr, exec_end: Addr) -> Self {
        Self {
            section,
            exec_start,
            exec_end,
            resolve_loads: true,
            cfg: Cfg::default(),
            call_graph: CallGraph::default(),
        }
    }

    /// Enable or disable PC-relative-load conflict resolution during
    /// refinement (enabled by default).
    pub fn with_load_conflict_resolution(mut self, enabled: bool) -> Self {
        self.resolve_loads = enabled;
        self
    }

    /// Run the full pipeline.
    pub fn analyze(&mut self) -> Result<(), AnalysisError> {
        self.build_cfg();
        self.refine_cfg();
        self.recover_switch_statements();
        self.build_call_graph()
    }

    /// The control-flow graph; meaningful after
    /// [`build_cfg`](Self::build_cfg).
    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    /// The interprocedural graph; meaningful after
    /// [`build_call_graph`](Self::build_call_graph).
    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    /// The maximal block behind node `id`. Node ids equal block positions.
    pub(crate) fn mb(&self, id: usize) -> &'a MaximalBlock {
        self.section.maximal_block_at(id)
    }

    /// Whether `addr` lies inside the executable window. The window's end
    /// is excluded here; remote-successor lookup deliberately admits it.
    pub(crate) fn is_valid_code_addr(&self, addr: Addr) -> bool {
        self.exec_start <= addr && addr < self.exec_end
    }

    /// A node's arbitration weight: its own instruction count plus the
    /// instruction counts of its non-data direct predecessors. Data nodes
    /// weigh nothing.
    pub(crate) fn node_weight(&self, id: usize) -> usize {
        let node = self.cfg.node(id);
        if node.is_data() {
            return 0;
        }
        let mut weight = self.mb(id).instruction_count();
        for edge in node.direct_preds() {
            if !self.cfg.node(edge.node).is_data() {
                weight += self.mb(edge.node).instruction_count();
            }
        }
        weight
    }

    /// The address a node effectively starts at: the candidate start when
    /// refinement has chosen one, the block's first instruction otherwise.
    pub(crate) fn effective_start(&self, id: usize) -> Addr {
        self.cfg
            .node(id)
            .candidate_start_addr()
            .unwrap_or_else(|| self.mb(id).first_inst_addr())
    }

    /// The instructions from the node's effective start to the end of its
    /// block.
    pub(crate) fn valid_instructions(&self, id: usize) -> &'a [Instruction] {
        let instructions = self.mb(id).instructions();
        let start = self.effective_start(id);
        let first = instructions
            .iter()
            .position(|inst| inst.addr >= start)
            .unwrap_or(instructions.len());
        &instructions[first..]
    }

    /// Whether `addr` is an acceptable candidate start for node `id`:
    /// some candidate basic block of its maximal block starts exactly
    /// there. A mere instruction boundary is not enough; entry points the
    /// decoder never observed are not resurrected by shortening.
    pub(crate) fn is_valid_candidate_start(&self, id: usize, addr: Addr) -> bool {
        let block = self.mb(id);
        (0..block.basic_block_count()).any(|bb| block.basic_block_start_addr(bb) == addr)
    }

    /// Whether node `other` lines up as the fall-through continuation of
    /// node `id`'s bytes.
    pub(crate) fn is_appendable_by(&self, id: usize, other: usize) -> bool {
        self.mb(id).end_addr() == self.effective_start(other)
    }

    /// The fall-through successor of `id`: the next node when its block
    /// has an instruction at this block's end address, or that node's
    /// recorded overlap when the direct neighbor cannot take the role.
    pub(crate) fn find_immediate_successor(&self, id: usize) -> Option<usize> {
        if self.cfg.is_last(id) {
            return None;
        }
        let end = self.mb(id).end_addr();
        let direct = id + 1;
        if !self.cfg.node(direct).is_data() && self.mb(direct).contains_instruction_at(end) {
            return Some(direct);
        }
        let overlap = self.cfg.node(direct).overlap_next()?;
        if !self.cfg.node(overlap).is_data() && self.mb(overlap).contains_instruction_at(end) {
            return Some(overlap);
        }
        None
    }

    /// The node containing an instruction at the direct-branch target
    /// `target`, found by binary search over last instruction addresses.
    ///
    /// A target equal to the window's end is admitted here even though
    /// `is_valid_code_addr` rejects it; the bracketing probes sort it out.
    pub(crate) fn find_remote_successor(&self, target: Addr) -> Option<usize> {
        if target < self.exec_start || target > self.exec_end {
            return None;
        }
        let (first, last) = self.section.nearest_blocks(target);
        if self.mb(last).contains_instruction_at(target) {
            return Some(last);
        }
        if self.mb(first).contains_instruction_at(target) {
            return Some(first);
        }
        if self.cfg.node(last).is_data() {
            let overlap = self.cfg.node(last).overlap_next()?;
            if self.mb(overlap).contains_instruction_at(target) {
                return Some(overlap);
            }
        }
        None
    }

    pub(crate) fn set_role_if_unassigned(&mut self, id: usize, role: ProcedureRole) {
        let node = self.cfg.node_mut(id);
        if node.role == ProcedureRole::Unassigned {
            node.role = role;
        }
    }
}
