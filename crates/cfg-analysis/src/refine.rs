//! CFG refinement
//!
//! Turns the draft graph into one with a consistent text/data partition:
//! arbitrates overlapping decodings by node weight, validates conditional
//! branches against eliminated condition context, records call/return
//! relations, selects each node's valid basic block against its
//! predecessors' target addresses, and resolves collisions between
//! PC-relative constant loads and later decodings.

use section_disasm::{arm, ClassifiedOpcode, Opcode};
use tracing::{debug, trace};

use crate::{analyzer::SectionAnalyzer, node::CfgEdge};

impl<'a> SectionAnalyzer<'a> {
    /// Refine every non-data node in id order.
    pub fn refine_cfg(&mut self) {
        if !self.cfg.is_valid() {
            return;
        }
        for id in 0..self.cfg.len() {
            if self.cfg.node(id).is_data() {
                continue;
            }
            self.resolve_overlap_between_nodes(id);
            if self.cfg.node(id).is_data() {
                continue;
            }
            self.add_conditional_branch_to_cfg(id);
            self.add_call_return_relation(id);
            self.resolve_valid_basic_block(id);
            if self.resolve_loads && !self.cfg.node(id).is_data() {
                self.resolve_load_conflicts(id);
            }
        }
    }

    /// Arbitrate between a node and the later node overlapping its bytes.
    ///
    /// When the overlapping block spans this node entirely, the lighter of
    /// the two is sacrificed unless this node lines up behind a substantial
    /// predecessor, in which case the overlap is pushed past the contested
    /// bytes. Otherwise the overlap is shortened to start at this node's
    /// end if its candidate blocks allow that, and weight decides when
    /// they do not.
    pub(crate) fn resolve_overlap_between_nodes(&mut self, id: usize) {
        let Some(overlap) = self.cfg.node(id).overlap_next() else {
            return;
        };
        if self.cfg.node(overlap).is_data() {
            return;
        }
        let node_end = self.mb(id).end_addr();
        if self.mb(overlap).covers_address_span_of(self.mb(id)) {
            if self.node_weight(id) < self.node_weight(overlap) {
                // the shrunken overlap must still start strictly inside
                // its own bytes
                if node_end < self.mb(overlap).end_addr()
                    && id > 0
                    && self.is_appendable_by(id - 1, id)
                    && self.node_weight(id - 1) > 2
                {
                    trace!(node = id, overlap, "pushing covering overlap past node end");
                    self.cfg.node_mut(overlap).set_candidate_start_addr(node_end);
                } else {
                    self.cfg.set_to_data_and_invalidate(id);
                }
            }
        } else if self.is_valid_candidate_start(overlap, node_end) {
            let nested = self.cfg.node(overlap).overlap_next();
            if nested.is_some_and(|n| !self.cfg.node(n).is_data() && self.is_appendable_by(id, n)) {
                // this node falls straight through to the overlap's own
                // overlap; the block in between cannot be code
                self.cfg.set_to_data_and_invalidate(overlap);
            } else {
                trace!(node = id, overlap, "shortening overlap to node end");
                self.cfg.node_mut(overlap).set_candidate_start_addr(node_end);
            }
        } else if self.node_weight(id) < self.node_weight(overlap) {
            self.cfg.set_to_data_and_invalidate(id);
        } else {
            // equal weights or a single-instruction overlap: the later
            // decoding loses
            self.cfg.set_to_data_and_invalidate(overlap);
        }
    }

    /// Register the fall-through successor of a conditional branch, or
    /// condemn the node when no fall-through exists.
    pub(crate) fn add_conditional_branch_to_cfg(&mut self, id: usize) {
        if !self.mb(id).branch().is_conditional() {
            return;
        }
        if self.cfg.node(id).immediate_succ().is_some() {
            return;
        }
        if self.is_conditional_branch_affected_by_node_overlap(id) {
            return;
        }
        match self.find_immediate_successor(id) {
            Some(succ) => {
                let end = self.mb(id).end_addr();
                self.cfg.add_immediate_edge(id, succ, end);
            }
            None => {
                // a conditional branch with no fall-through is not code
                self.cfg.set_to_data_and_invalidate(id);
            }
        }
    }

    /// Whether overlap resolution ate the instructions this conditional
    /// branch depends on.
    ///
    /// CBZ/CBNZ compare a register directly and never depend on earlier
    /// flag-setters. For everything else: with a candidate start chosen,
    /// any CMP/CMN/IT before that start means the branch lost its condition
    /// context; with no candidate chosen, a lone-instruction block is
    /// conservatively suspect.
    pub(crate) fn is_conditional_branch_affected_by_node_overlap(&self, id: usize) -> bool {
        let block = self.mb(id);
        if matches!(block.branch_instruction().opcode, Opcode::Cbz | Opcode::Cbnz) {
            return false;
        }
        let Some(candidate_start) = self.cfg.node(id).candidate_start_addr() else {
            return block.instruction_count() == 1;
        };
        for inst in block.instructions() {
            if inst.addr >= candidate_start {
                return false;
            }
            if ClassifiedOpcode::from_opcode(inst.opcode).sets_condition_context {
                return true;
            }
        }
        false
    }

    /// Record the fall-through of a call as its return site.
    pub(crate) fn add_call_return_relation(&mut self, id: usize) {
        if !self.mb(id).branch_instruction().is_call() {
            return;
        }
        if let Some(succ) = self.find_immediate_successor(id) {
            self.cfg.node_mut(succ).preceding_call = Some(id);
            self.cfg.node_mut(id).return_succ = Some(succ);
        }
    }

    /// Choose the node's candidate start and reconcile it with the target
    /// addresses of its predecessors.
    pub(crate) fn resolve_valid_basic_block(&mut self, id: usize) {
        if self.cfg.node(id).candidate_start_addr().is_none() {
            let start = match self.cfg.node(id).preceding_call() {
                Some(call) => self.mb(call).end_addr(),
                None => self.mb(id).first_inst_addr(),
            };
            self.cfg.node_mut(id).set_candidate_start_addr(start);
        }
        let block = self.mb(id);
        if block.basic_block_count() == 1 || self.cfg.node(id).direct_preds().is_empty() {
            return;
        }
        let valid_preds: Vec<CfgEdge> = self
            .cfg
            .node(id)
            .direct_preds()
            .iter()
            .filter(|edge| !self.cfg.node(edge.node).is_data())
            .copied()
            .collect();

        // the common case: one candidate block satisfies every predecessor
        for bb in 0..block.basic_block_count() {
            let mut target_count = 0;
            for pred in &valid_preds {
                if !block.basic_block_contains(bb, pred.target_addr) {
                    continue;
                }
                let candidate = self.effective_start(id);
                if pred.target_addr < candidate {
                    // the predecessor targets bytes the overlap arbitration
                    // already gave away; the lighter party loses
                    if id > 0 && self.node_weight(pred.node) < self.node_weight(id - 1) {
                        self.cfg.set_to_data_and_invalidate(pred.node);
                    } else if id > 0 {
                        self.cfg.set_to_data_and_invalidate(id - 1);
                    }
                }
                target_count += 1;
            }
            if target_count == valid_preds.len() {
                if self.effective_start(id) < block.basic_block_start_addr(bb)
                    && self.cfg.node(id).is_possible_return()
                    && valid_preds.len() == 1
                {
                    self.cfg.set_to_data_and_invalidate(valid_preds[0].node);
                }
                return;
            }
        }
        self.resolve_cfg_conflicts(id, &valid_preds);
    }

    /// No single candidate block satisfies every predecessor: pick the
    /// block with maximum accumulated weight and drop the predecessors
    /// matched elsewhere.
    ///
    /// Blocks are scanned last to first so equal weights prefer earlier
    /// blocks.
    pub(crate) fn resolve_cfg_conflicts(&mut self, id: usize, valid_preds: &[CfgEdge]) {
        let block = self.mb(id);
        let mut assigned = vec![0usize; valid_preds.len()];
        let mut winning_bb = 0usize;
        let mut maximum_weight = 0usize;
        for bb in (0..block.basic_block_count()).rev() {
            let mut current_weight = block.basic_block_instruction_count(bb);
            for (slot, pred) in valid_preds.iter().enumerate() {
                if block.basic_block_contains(bb, pred.target_addr) {
                    assigned[slot] = bb;
                    current_weight += self.node_weight(pred.node);
                }
            }
            if current_weight >= maximum_weight {
                winning_bb = bb;
                maximum_weight = current_weight;
            }
        }
        debug!(node = id, winning_bb, "resolved basic-block conflict");
        for (slot, pred) in valid_preds.iter().enumerate() {
            if assigned[slot] != winning_bb {
                self.cfg.set_to_data_and_invalidate(pred.node);
            }
        }
    }

    /// Resolve collisions between this node's PC-relative constant loads
    /// and later decodings claiming the loaded words as code.
    pub(crate) fn resolve_load_conflicts(&mut self, id: usize) {
        for inst in arm::pc_relative_loads(self.mb(id)) {
            let Some((_, disp)) = inst.memory_operand() else {
                continue;
            };
            let target = ((inst.addr as i64 + 4 + i64::from(disp)) as u64) & !3;
            match self.find_node_affected_by_load(id, target) {
                None => {
                    // the load targets its own block or leaves the window;
                    // the decoding up to the load is suspect
                    let end = inst.end_addr();
                    self.shorten_to_candidate_or_set_data(id, end);
                }
                Some(affected) => {
                    if target + 4 <= self.effective_start(affected) {
                        continue;
                    }
                    self.shorten_to_candidate_or_set_data(affected, target + 4);
                    if self.cfg.node(affected).is_data() && affected + 1 < self.cfg.len() {
                        let next = affected + 1;
                        if self.effective_start(next) < target + 4 {
                            self.shorten_to_candidate_or_set_data(next, target + 4);
                        }
                    }
                }
            }
        }
    }

    /// The first node at or after `id + 1` whose block reaches the loaded
    /// word at `target`.
    pub(crate) fn find_node_affected_by_load(&self, id: usize, target: u64) -> Option<usize> {
        if target < self.mb(id).end_addr() || target > self.exec_end {
            // a PC-relative load never targets its own block, and an
            // external address conflicts with nothing here
            return None;
        }
        (id + 1..self.cfg.len()).find(|&other| target <= self.mb(other).last_inst_addr())
    }

    /// Shorten a node to start at `addr` when its candidate blocks allow
    /// it; otherwise the node is data.
    pub(crate) fn shorten_to_candidate_or_set_data(&mut self, id: usize, addr: u64) {
        if self.is_valid_candidate_start(id, addr) {
            self.cfg.node_mut(id).set_candidate_start_addr(addr);
        } else {
            self.cfg.set_to_data_and_invalidate(id);
        }
    }
}
