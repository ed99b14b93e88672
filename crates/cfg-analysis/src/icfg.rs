//! Interprocedural CFG recovery
//!
//! Partitions the refined CFG into procedures rooted at direct-call
//! targets, then walks each procedure across direct edges to classify how
//! control leaves it. The partition overestimates: a procedure's end is
//! simply the next distinct call target (the last one runs to the end of
//! the executable window), so ranges reachable only by fall-through from an
//! earlier procedure stay outside it.

use section_disasm::{arm, Addr};
use tracing::{debug, trace};

use crate::{analyzer::SectionAnalyzer, error::AnalysisError, node::ProcedureRole};

/// Fewer direct call sites than this means the section is too small to
/// partition.
const MIN_DIRECT_CALL_SITES: usize = 3;

/// Why a procedure traversal stopped at a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// An indirect branch recognized as a return.
    Return,
    /// A call whose target lies outside the procedure.
    Call,
    /// A register-indirect call.
    IndirectCall,
    /// A jump into another procedure or out of the section.
    TailCall,
    /// A second LR stack store inside one procedure.
    InvalidLr,
    /// The walk ran into a node already owned by another procedure's body.
    Overlap,
    /// The walk left the procedure's address range into unclaimed code.
    PossibleOverlap,
}

/// How a procedure entry relates to the analyzed section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    /// Entry node lives in this section and was traversed.
    Internal,
    /// Entry lies elsewhere; not traversed.
    External,
}

/// One classified exit of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureExit {
    pub kind: ExitKind,
    /// The CFG node the exit was recorded at.
    pub node: usize,
}

/// A procedure recovered from the call graph partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub(crate) entry_addr: Addr,
    pub(crate) end_addr: Addr,
    pub(crate) entry_node: Option<usize>,
    pub(crate) kind: ProcedureKind,
    pub(crate) lr_store_idx: usize,
    pub(crate) exits: Vec<ProcedureExit>,
}

impl Procedure {
    /// The call target this procedure is rooted at.
    pub fn entry_addr(&self) -> Addr {
        self.entry_addr
    }

    /// Overestimated upper bound of the procedure's address range.
    pub fn end_addr(&self) -> Addr {
        self.end_addr
    }

    /// The CFG node at the entry address, when the entry is in-section.
    pub fn entry_node(&self) -> Option<usize> {
        self.entry_node
    }

    /// Internal or external.
    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    /// 1-based instruction index of the procedure's LR stack store, 0 when
    /// none was observed.
    pub fn lr_store_idx(&self) -> usize {
        self.lr_store_idx
    }

    /// The classified exits, in traversal order.
    pub fn exits(&self) -> &[ProcedureExit] {
        &self.exits
    }

    fn is_within_address_space(&self, addr: Addr) -> bool {
        self.entry_addr <= addr && addr < self.end_addr
    }
}

/// The recovered procedures, ordered by entry address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallGraph {
    pub(crate) procedures: Vec<Procedure>,
}

impl CallGraph {
    /// All procedures in entry-address order.
    pub fn procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    /// Number of procedures.
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    /// Whether the partition is empty.
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl<'a> SectionAnalyzer<'a> {
    /// Partition the CFG into procedures and classify every exit.
    ///
    /// Fails when the section exposes fewer than three direct call sites;
    /// everything else resolves into exit diagnostics rather than errors.
    pub fn build_call_graph(&mut self) -> Result<(), AnalysisError> {
        let mut call_sites: Vec<(Addr, usize)> = Vec::new();
        for id in 0..self.cfg.len() {
            if self.cfg.node(id).is_data() {
                continue;
            }
            let block = self.mb(id);
            if !block.branch_instruction().is_call() {
                continue;
            }
            if let Some(target) = block.branch().target() {
                call_sites.push((target, id));
            }
        }
        if call_sites.len() < MIN_DIRECT_CALL_SITES {
            return Err(AnalysisError::TooFewCallSites {
                found: call_sites.len(),
                minimum: MIN_DIRECT_CALL_SITES,
            });
        }
        call_sites.sort_unstable();

        // one procedure per distinct target; each ends where the next begins
        let mut procedures: Vec<Procedure> = Vec::new();
        for (index, &(target, caller)) in call_sites.iter().enumerate() {
            if index > 0 && call_sites[index - 1].0 == target {
                continue;
            }
            if let Some(previous) = procedures.last_mut() {
                previous.end_addr = target;
            }
            let entry_node = self.cfg.node(caller).remote_succ();
            let kind = if entry_node.is_some() {
                ProcedureKind::Internal
            } else {
                ProcedureKind::External
            };
            procedures.push(Procedure {
                entry_addr: target,
                end_addr: self.exec_end,
                entry_node,
                kind,
                lr_store_idx: 0,
                exits: Vec::new(),
            });
        }

        // claim entries up front so one procedure's walk into another's
        // entry reads as a call, not an overlap
        for proc in &procedures {
            if let Some(entry) = proc.entry_node {
                let node = self.cfg.node_mut(entry);
                node.procedure_entry_addr = Some(proc.entry_addr);
                node.role = ProcedureRole::Entry;
            }
        }

        for index in 0..procedures.len() {
            self.build_procedure(&mut procedures[index]);
        }
        self.call_graph = CallGraph { procedures };
        Ok(())
    }

    fn build_procedure(&mut self, proc: &mut Procedure) {
        if proc.kind == ProcedureKind::External {
            // dynamically linked targets are not traversed
            return;
        }
        let Some(entry) = proc.entry_node else {
            return;
        };
        debug!(entry_addr = proc.entry_addr, entry, "building procedure");
        proc.lr_store_idx = arm::lr_stack_store_index(self.valid_instructions(entry));
        if self.mb(entry).branch().is_conditional() {
            let succ = self.cfg.node(entry).immediate_succ();
            self.traverse_procedure_node(proc, succ, entry);
        }
        if self.mb(entry).branch_instruction().is_call() {
            let succ = self.cfg.node(entry).return_succ();
            self.traverse_procedure_node(proc, succ, entry);
        }
        let succ = self.cfg.node(entry).remote_succ();
        self.traverse_procedure_node(proc, succ, entry);
    }

    fn traverse_procedure_node(
        &mut self,
        proc: &mut Procedure,
        cfg_node: Option<usize>,
        predecessor: usize,
    ) {
        let Some(id) = cfg_node else {
            // the predecessor's control leaves the section
            let kind = if self.mb(predecessor).branch_instruction().is_call() {
                ExitKind::Call
            } else {
                ExitKind::TailCall
            };
            proc.exits.push(ProcedureExit {
                kind,
                node: predecessor,
            });
            self.set_role_if_unassigned(predecessor, ProcedureRole::Exit);
            return;
        };

        if let Some(owner) = self.cfg.node(id).procedure_entry_addr() {
            if owner != proc.entry_addr {
                let kind = if self.cfg.node(id).role() == ProcedureRole::Entry {
                    if self.mb(predecessor).branch_instruction().is_call() {
                        ExitKind::Call
                    } else {
                        ExitKind::TailCall
                    }
                } else {
                    ExitKind::Overlap
                };
                trace!(proc = proc.entry_addr, node = id, ?kind, "foreign node");
                proc.exits.push(ProcedureExit {
                    kind,
                    node: predecessor,
                });
                self.set_role_if_unassigned(predecessor, ProcedureRole::Exit);
            }
            return;
        }

        if !proc.is_within_address_space(self.effective_start(id)) {
            let kind = if self.cfg.node(id).role() == ProcedureRole::Entry {
                if self.mb(predecessor).branch_instruction().is_call() {
                    ExitKind::Call
                } else {
                    ExitKind::TailCall
                }
            } else if self.cfg.node(id).procedure_entry_addr().is_some() {
                ExitKind::Overlap
            } else {
                // an unassigned node: nobody claims it yet, so this may be
                // fall-through territory rather than a true collision
                ExitKind::PossibleOverlap
            };
            trace!(proc = proc.entry_addr, node = id, ?kind, "left address range");
            proc.exits.push(ProcedureExit {
                kind,
                node: predecessor,
            });
            self.set_role_if_unassigned(predecessor, ProcedureRole::Exit);
            return;
        }

        // stack discipline: one LR save per procedure
        let lr_idx = arm::lr_stack_store_index(self.valid_instructions(id));
        if proc.lr_store_idx == 0 {
            proc.lr_store_idx = lr_idx;
        } else if lr_idx != 0 {
            debug!(proc = proc.entry_addr, node = id, "double LR store");
            proc.exits.push(ProcedureExit {
                kind: ExitKind::InvalidLr,
                node: id,
            });
            self.cfg.node_mut(predecessor).role = ProcedureRole::Exit;
            return;
        }

        self.cfg.node_mut(id).procedure_entry_addr = Some(proc.entry_addr);

        if self.mb(id).branch().is_direct() {
            self.cfg.node_mut(id).role = ProcedureRole::Body;
            if self.mb(id).branch().is_conditional() {
                let succ = self.cfg.node(id).immediate_succ();
                self.traverse_procedure_node(proc, succ, id);
            }
            let succ = self.cfg.node(id).remote_succ();
            self.traverse_procedure_node(proc, succ, id);
            if self.mb(id).branch_instruction().is_call() {
                let succ = self.cfg.node(id).return_succ();
                self.traverse_procedure_node(proc, succ, id);
            }
            return;
        }

        if self.cfg.node(id).is_switch() {
            self.cfg.node_mut(id).role = ProcedureRole::Body;
            let cases: Vec<usize> = self
                .cfg
                .node(id)
                .indirect_succs()
                .iter()
                .map(|edge| edge.node)
                .collect();
            for case in cases {
                self.traverse_procedure_node(proc, Some(case), id);
            }
            return;
        }

        self.cfg.node_mut(id).role = ProcedureRole::Exit;
        let branch_inst = self.mb(id).branch_instruction();
        if branch_inst.is_call() {
            proc.exits.push(ProcedureExit {
                kind: ExitKind::IndirectCall,
                node: id,
            });
            let succ = self.cfg.node(id).return_succ();
            self.traverse_procedure_node(proc, succ, id);
            return;
        }
        if branch_inst.is_return() {
            proc.exits.push(ProcedureExit {
                kind: ExitKind::Return,
                node: id,
            });
            return;
        }
        proc.exits.push(ProcedureExit {
            kind: ExitKind::TailCall,
            node: id,
        });
    }
}

#[cfg(test)]
mod tests {
    use section_disasm::{Branch, Instruction, MaximalBlock, Opcode, Operand, Reg, RegList};

    use super::{ExitKind, ProcedureKind};
    use crate::{
        error::AnalysisError,
        node::ProcedureRole,
        test_util::{section, sized_block, SectionAnalyzer},
    };

    fn caller(id: usize, start: u64, target: u64) -> MaximalBlock {
        sized_block(
            id,
            start,
            &[(2, Opcode::Mov), (4, Opcode::Bl)],
            Branch::direct(target),
        )
    }

    /// push {r4, lr} then pop {r4, pc}: a returning leaf procedure body.
    fn leaf_procedure(id: usize, start: u64) -> MaximalBlock {
        MaximalBlock::new(
            id,
            vec![
                Instruction::new(
                    start,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 4 | 1 << 14))],
                ),
                Instruction::new(
                    start + 2,
                    2,
                    Opcode::Pop,
                    vec![Operand::RegList(RegList(1 << 4 | 1 << 15))],
                ),
            ],
            Branch::indirect(),
        )
    }

    #[test]
    fn test_partition_by_distinct_call_targets() {
        // call sites targeting {0x3000, 0x3000, 0x3400, 0x3800}: three
        // procedures, each ending where the next begins, the last at the
        // window's end
        let blocks = vec![
            leaf_procedure(0, 0x3000),
            caller(1, 0x3100, 0x3000),
            caller(2, 0x3200, 0x3000),
            caller(3, 0x3280, 0x3400),
            leaf_procedure(4, 0x3400),
            caller(5, 0x3500, 0x3800),
            leaf_procedure(6, 0x3800),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();
        analyzer.recover_switch_statements();
        analyzer.build_call_graph().unwrap();

        let procs = analyzer.call_graph().procedures();
        assert_eq!(procs.len(), 3);
        assert_eq!((procs[0].entry_addr(), procs[0].end_addr()), (0x3000, 0x3400));
        assert_eq!((procs[1].entry_addr(), procs[1].end_addr()), (0x3400, 0x3800));
        assert_eq!((procs[2].entry_addr(), procs[2].end_addr()), (0x3800, 0x4000));
        assert_eq!(procs[0].entry_node(), Some(0));
        assert!(procs.iter().all(|p| p.kind() == ProcedureKind::Internal));
    }

    #[test]
    fn test_too_few_call_sites() {
        let blocks = vec![
            leaf_procedure(0, 0x3000),
            caller(1, 0x3100, 0x3000),
            caller(2, 0x3200, 0x3000),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();

        let result = analyzer.build_call_graph();
        assert!(matches!(
            result,
            Err(AnalysisError::TooFewCallSites { found: 2, .. })
        ));
    }

    #[test]
    fn test_double_lr_store_flags_invalid_exit() {
        // the entry saves LR at index 2; its remote successor saves LR
        // again at index 3
        let entry = MaximalBlock::new(
            0,
            vec![
                Instruction::new(0x3000, 2, Opcode::Mov, vec![]),
                Instruction::new(
                    0x3002,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 14))],
                ),
                Instruction::new(0x3004, 4, Opcode::B, vec![]),
            ],
            Branch::direct(0x3010),
        );
        let descendant = MaximalBlock::new(
            1,
            vec![
                Instruction::new(0x3010, 2, Opcode::Mov, vec![]),
                Instruction::new(0x3012, 2, Opcode::Mov, vec![]),
                Instruction::new(
                    0x3014,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 14))],
                ),
                Instruction::new(
                    0x3016,
                    2,
                    Opcode::Pop,
                    vec![Operand::RegList(RegList(1 << 15))],
                ),
            ],
            Branch::indirect(),
        );
        let blocks = vec![
            entry,
            descendant,
            caller(2, 0x3100, 0x3000),
            caller(3, 0x3200, 0x3400),
            caller(4, 0x3300, 0x3800),
            leaf_procedure(5, 0x3400),
            leaf_procedure(6, 0x3800),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();
        analyzer.build_call_graph().unwrap();

        let proc = &analyzer.call_graph().procedures()[0];
        assert_eq!(proc.lr_store_idx(), 2);
        assert!(proc
            .exits()
            .iter()
            .any(|exit| exit.kind == ExitKind::InvalidLr && exit.node == 1));
        // the offending node was not claimed by the procedure
        assert_eq!(analyzer.cfg().node(1).procedure_entry_addr(), None);
    }

    #[test]
    fn test_jump_to_other_procedure_entry_is_tail_call() {
        // procedure at 0x3000 ends with an unconditional jump straight to
        // the procedure at 0x3400
        let entry = MaximalBlock::new(
            0,
            vec![
                Instruction::new(
                    0x3000,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 14))],
                ),
                Instruction::new(0x3002, 4, Opcode::B, vec![]),
            ],
            Branch::direct(0x3400),
        );
        let blocks = vec![
            entry,
            caller(1, 0x3100, 0x3000),
            caller(2, 0x3200, 0x3400),
            caller(3, 0x3300, 0x3800),
            leaf_procedure(4, 0x3400),
            leaf_procedure(5, 0x3800),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();
        analyzer.build_call_graph().unwrap();

        let proc = &analyzer.call_graph().procedures()[0];
        assert!(proc
            .exits()
            .iter()
            .any(|exit| exit.kind == ExitKind::TailCall && exit.node == 0));
    }

    #[test]
    fn test_jump_into_unclaimed_range_is_possible_overlap() {
        // procedure at 0x3000 jumps to 0x3500: inside another procedure's
        // overestimated range but claimed by nobody, so the walk reports a
        // possible overlap rather than a collision
        let entry = MaximalBlock::new(
            0,
            vec![
                Instruction::new(
                    0x3000,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 14))],
                ),
                Instruction::new(0x3002, 4, Opcode::B, vec![]),
            ],
            Branch::direct(0x3500),
        );
        let stray = MaximalBlock::new(
            5,
            vec![
                Instruction::new(0x3500, 2, Opcode::Mov, vec![]),
                Instruction::new(
                    0x3502,
                    2,
                    Opcode::Pop,
                    vec![Operand::RegList(RegList(1 << 15))],
                ),
            ],
            Branch::indirect(),
        );
        let blocks = vec![
            entry,
            caller(1, 0x3100, 0x3000),
            caller(2, 0x3200, 0x3400),
            caller(3, 0x3300, 0x3800),
            leaf_procedure(4, 0x3400),
            stray,
            leaf_procedure(6, 0x3800),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();
        analyzer.build_call_graph().unwrap();

        let proc = &analyzer.call_graph().procedures()[0];
        assert!(proc
            .exits()
            .iter()
            .any(|exit| exit.kind == ExitKind::PossibleOverlap && exit.node == 0));
        // the stray block stays unclaimed
        assert_eq!(analyzer.cfg().node(5).procedure_entry_addr(), None);
        assert_eq!(analyzer.cfg().node(5).role(), ProcedureRole::Unassigned);
    }

    #[test]
    fn test_body_return_classified() {
        // entry branches into a body block that returns via pop {pc}
        let entry = MaximalBlock::new(
            0,
            vec![
                Instruction::new(
                    0x3000,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 14))],
                ),
                Instruction::new(0x3002, 4, Opcode::B, vec![]),
            ],
            Branch::direct(0x3010),
        );
        let body = MaximalBlock::new(
            1,
            vec![
                Instruction::new(0x3010, 2, Opcode::Mov, vec![]),
                Instruction::new(
                    0x3012,
                    2,
                    Opcode::Pop,
                    vec![Operand::RegList(RegList(1 << 15))],
                ),
            ],
            Branch::indirect(),
        );
        let blocks = vec![
            entry,
            body,
            caller(2, 0x3100, 0x3000),
            caller(3, 0x3200, 0x3400),
            caller(4, 0x3300, 0x3800),
            leaf_procedure(5, 0x3400),
            leaf_procedure(6, 0x3800),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();
        analyzer.build_call_graph().unwrap();

        let proc = &analyzer.call_graph().procedures()[0];
        assert!(proc
            .exits()
            .iter()
            .any(|exit| exit.kind == ExitKind::Return && exit.node == 1));
        assert_eq!(
            analyzer.cfg().node(1).procedure_entry_addr(),
            Some(0x3000),
            "the returning block belongs to the procedure"
        );
    }

    #[test]
    fn test_indirect_call_exit_with_return_site() {
        // the body performs blx r4 and falls through to its return site
        let entry = MaximalBlock::new(
            0,
            vec![
                Instruction::new(
                    0x3000,
                    2,
                    Opcode::Push,
                    vec![Operand::RegList(RegList(1 << 14))],
                ),
                Instruction::new(0x3002, 2, Opcode::Blx, vec![Operand::Reg(Reg(4))]),
            ],
            Branch::indirect(),
        );
        let ret_site = MaximalBlock::new(
            1,
            vec![
                Instruction::new(0x3004, 2, Opcode::Mov, vec![]),
                Instruction::new(
                    0x3006,
                    2,
                    Opcode::Pop,
                    vec![Operand::RegList(RegList(1 << 15))],
                ),
            ],
            Branch::indirect(),
        );
        let blocks = vec![
            entry,
            ret_site,
            caller(2, 0x3100, 0x3000),
            caller(3, 0x3200, 0x3400),
            caller(4, 0x3300, 0x3800),
            leaf_procedure(5, 0x3400),
            leaf_procedure(6, 0x3800),
        ];
        let sec = section(0x3000, 0x1000, blocks);
        let mut analyzer = SectionAnalyzer::new(&sec, 0x3000, 0x4000);
        analyzer.build_cfg();
        analyzer.refine_cfg();
        analyzer.build_call_graph().unwrap();

        let proc = &analyzer.call_graph().procedures()[0];
        // the entry's own blx is a call with a recorded return site, so the
        // walk continues into the fall-through and finds its return
        assert!(proc
            .exits()
            .iter()
            .any(|exit| exit.kind == ExitKind::Return && exit.node == 1));
    }
}
