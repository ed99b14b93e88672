//! CFG construction
//!
//! Two linear passes over the maximal blocks. The first marks blocks whose
//! direct branch leaves the executable window as data and records, for
//! every block, the later block whose bytes intrude on it. The second
//! resolves in-section direct branches to their target nodes; a direct
//! branch that lands on no decoded instruction condemns its own node.

use tracing::trace;

use crate::{analyzer::SectionAnalyzer, graph::Cfg};

impl<'a> SectionAnalyzer<'a> {
    /// Build the draft CFG over the section's maximal blocks.
    pub fn build_cfg(&mut self) {
        let count = self.section.maximal_block_count();
        if count == 0 {
            return;
        }
        self.cfg = Cfg::with_node_count(count);

        // Pass 1: out-of-window direct targets, overlap marking.
        for id in 0..count {
            let block = self.mb(id);
            if let Some(target) = block.branch().target() {
                if !self.is_valid_code_addr(target) {
                    self.cfg.set_to_data_and_invalidate(id);
                    continue;
                }
            }
            // every earlier block whose bytes this block intrudes upon
            // records the intrusion
            let first_addr = block.first_inst_addr();
            let mut prior = id;
            while prior > 0 {
                prior -= 1;
                if self.mb(prior).end_addr() <= first_addr {
                    break;
                }
                self.cfg.node_mut(prior).overlap_next = Some(id);
            }
        }

        // Pass 2: remote successors for in-section direct branches.
        for id in 0..count {
            if self.cfg.node(id).is_data() {
                continue;
            }
            let Some(target) = self.mb(id).branch().target() else {
                continue;
            };
            if !self.section.is_within_section_address_space(target) {
                // a valid direct branch may leave this section entirely
                continue;
            }
            match self.find_remote_successor(target) {
                Some(succ) if !self.cfg.node(succ).is_data() => {
                    trace!(node = id, succ, target, "registering remote successor");
                    self.cfg.add_remote_edge(id, succ, target);
                }
                _ => {
                    // a direct branch that lands on no decoded instruction
                    self.cfg.set_to_data_and_invalidate(id);
                }
            }
        }
        self.cfg.mark_valid();
    }
}
