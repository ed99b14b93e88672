//! Switch-table recovery
//!
//! Decodes the jump tables behind TBB, TBH, and two-operand LDR table
//! branches directly from the section bytes and registers each distinct
//! case target as an indirect successor of the branch node. A cleanup walk
//! then reconciles the nodes following each table with the minimum case
//! address actually observed: nodes nobody targets were table bytes.
//!
//! Table reads are little-endian regardless of host order; LDR entries
//! carry a Thumb indicator in bit 0 that is masked off.

use std::collections::HashSet;

use section_disasm::{arm, Addr, Opcode};
use tracing::{debug, trace};

use crate::analyzer::SectionAnalyzer;

impl<'a> SectionAnalyzer<'a> {
    /// Recover jump tables for every indirect-branch node that can carry
    /// one, then clean up the nodes shadowed by the recovered tables.
    pub fn recover_switch_statements(&mut self) {
        let mut switch_nodes = Vec::new();
        for id in 0..self.cfg.len() {
            if self.cfg.node(id).is_data() || self.is_not_switch_statement(id) {
                continue;
            }
            let branch_inst = self.mb(id).branch_instruction();
            match branch_inst.opcode {
                Opcode::Tbb => {
                    switch_nodes.push(id);
                    self.recover_tbb_switch_table(id);
                }
                Opcode::Tbh => {
                    switch_nodes.push(id);
                    self.recover_tbh_switch_table(id);
                }
                Opcode::Ldr if branch_inst.operands.len() == 2 => {
                    if let Some(base) = arm::ldr_switch_base_addr(branch_inst) {
                        switch_nodes.push(id);
                        self.recover_ldr_switch_table(id, base);
                    }
                }
                _ => {}
            }
        }
        for id in switch_nodes {
            self.switch_table_clean_up(id);
        }
    }

    /// A switch is an unconditional indirect branch that is neither a
    /// return nor a call.
    pub(crate) fn is_not_switch_statement(&self, id: usize) -> bool {
        let block = self.mb(id);
        if block.branch().is_direct() || block.branch().is_conditional() {
            return true;
        }
        matches!(
            block.branch_instruction().opcode,
            Opcode::Pop | Opcode::Blx | Opcode::Bl | Opcode::Bx
        )
    }

    /// TBB: packed byte table at the branch's PC value; each entry is a
    /// forward halfword offset from the table base.
    pub(crate) fn recover_tbb_switch_table(&mut self, id: usize) {
        let base = self.mb(id).branch_instruction().addr + 4;
        let bytes = self.section.physical_bytes_at(base);
        let mut minimum_target = self.exec_end;
        let mut current = base;
        let mut seen = HashSet::new();
        for &byte in bytes {
            if current >= minimum_target {
                break;
            }
            let target = base + Addr::from(byte) * 2;
            if seen.insert(target) {
                if target < current {
                    // a backward entry: the table ended before this byte
                    break;
                }
                let Some(case) = self.find_switch_table_target(target) else {
                    break;
                };
                trace!(node = id, case, target, "tbb case target");
                self.cfg.add_switch_edge(id, case, target);
                minimum_target = minimum_target.min(target);
            }
            current += 1;
        }
    }

    /// TBH: as TBB, with packed little-endian halfword entries.
    pub(crate) fn recover_tbh_switch_table(&mut self, id: usize) {
        let base = self.mb(id).branch_instruction().addr + 4;
        let bytes = self.section.physical_bytes_at(base);
        let mut minimum_target = self.exec_end;
        let mut current = base;
        let mut seen = HashSet::new();
        for entry in bytes.chunks_exact(2) {
            if current >= minimum_target {
                break;
            }
            let halfword = u16::from_le_bytes([entry[0], entry[1]]);
            let target = base + Addr::from(halfword) * 2;
            if seen.insert(target) {
                if target < current {
                    break;
                }
                let Some(case) = self.find_switch_table_target(target) else {
                    break;
                };
                trace!(node = id, case, target, "tbh case target");
                self.cfg.add_switch_edge(id, case, target);
                minimum_target = minimum_target.min(target);
            }
            current += 2;
        }
    }

    /// LDR: packed little-endian word table at the recovered base; bit 0 of
    /// each entry is a Thumb indicator and is cleared.
    ///
    /// Unlike TBB/TBH, the minimum case address moves only for targets
    /// beyond the table base: jumping backward to a default case earlier in
    /// the section must not end the walk.
    pub(crate) fn recover_ldr_switch_table(&mut self, id: usize, base: Addr) {
        let bytes = self.section.physical_bytes_at(base);
        let mut minimum_target = self.exec_end;
        let mut current = base;
        let mut seen = HashSet::new();
        for entry in bytes.chunks_exact(4) {
            if current >= minimum_target {
                break;
            }
            let word = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let target = Addr::from(word & 0xFFFF_FFFE);
            if seen.insert(target) {
                let Some(case) = self.find_switch_table_target(target) else {
                    break;
                };
                trace!(node = id, case, target, "ldr case target");
                self.cfg.add_switch_edge(id, case, target);
                if target < minimum_target && target > base {
                    minimum_target = target;
                }
            }
            current += 4;
        }
    }

    /// The node a switch case lands in. Case targets may precede the
    /// switch, and a target inside a data node is redirected through that
    /// node's recorded overlap.
    pub(crate) fn find_switch_table_target(&self, target: Addr) -> Option<usize> {
        if target < self.exec_start || target >= self.exec_end {
            return None;
        }
        let (first, last) = self.section.nearest_blocks(target);
        if self.cfg.node(last).is_data() {
            if let Some(overlap) = self.cfg.node(last).overlap_next() {
                return Some(overlap);
            }
        } else if self.mb(last).is_within_address_space(target) {
            return Some(last);
        }
        if self.mb(first).is_within_address_space(target) {
            return Some(first);
        }
        None
    }

    /// Walk the nodes after a switch: a node with no surviving predecessor
    /// target was table bytes and becomes data; the first node somebody
    /// still targets is shortened to its minimum predecessor target, and
    /// the walk stops there.
    pub(crate) fn switch_table_clean_up(&mut self, id: usize) {
        for node in id + 1..self.cfg.len() {
            if self.cfg.node(node).is_data() {
                continue;
            }
            let minimum_target = self.cfg.min_pred_target_addr(node);
            if minimum_target == 0 {
                debug!(switch = id, node, "cleanup reclassifying table bytes");
                self.cfg.set_to_data_and_invalidate(node);
            } else {
                self.cfg.node_mut(node).set_candidate_start_addr(minimum_target);
                break;
            }
        }
    }
}
