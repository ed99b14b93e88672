//! ARMv7/Thumb-2 opcode classification and ISA probes
//!
//! Single source of truth for the opcode properties the section analyzer
//! keys on, plus the instruction-pattern probes used during procedure
//! recovery: LR stack-store detection, PC-relative load enumeration, and
//! jump-table base recovery for LDR-based switches.

use crate::{Addr, Instruction, MaximalBlock, Operand, Reg};

/// ARM instruction ids the analyzer distinguishes.
///
/// Anything the analysis does not key on decodes to [`Opcode::Other`];
/// branch behavior for those comes from the owning block's branch
/// descriptor, not the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Opcode {
    Add,
    Sub,
    Mov,
    Nop,
    Ldr,
    Str,
    Push,
    Pop,
    Cmp,
    Cmn,
    It,
    B,
    Bl,
    Blx,
    Bx,
    Cbz,
    Cbnz,
    Tbb,
    Tbh,
    Other,
}

/// Classification of an opcode.
#[derive(Clone, Copy)]
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct ClassifiedOpcode {
    /// The mnemonic string (e.g., "bl", "cbz").
    pub mnemonic: &'static str,
    /// Control flow: is this a call? (BL, BLX)
    pub is_call: bool,
    /// Does this instruction establish the condition context a later
    /// conditional branch depends on? (CMP, CMN, IT)
    pub sets_condition_context: bool,
}

impl ClassifiedOpcode {
    const fn plain(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            is_call: false,
            sets_condition_context: false,
        }
    }

    const fn call(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            is_call: true,
            sets_condition_context: false,
        }
    }

    const fn condition_context(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            is_call: false,
            sets_condition_context: true,
        }
    }

    /// Look up the classification for an opcode.
    pub const fn from_opcode(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Add => Self::plain("add"),
            Opcode::Sub => Self::plain("sub"),
            Opcode::Mov => Self::plain("mov"),
            Opcode::Nop => Self::plain("nop"),
            Opcode::Ldr => Self::plain("ldr"),
            Opcode::Str => Self::plain("str"),
            Opcode::Push => Self::plain("push"),
            Opcode::Pop => Self::plain("pop"),
            Opcode::Cmp => Self::condition_context("cmp"),
            Opcode::Cmn => Self::condition_context("cmn"),
            Opcode::It => Self::condition_context("it"),
            Opcode::B => Self::plain("b"),
            Opcode::Bl => Self::call("bl"),
            Opcode::Blx => Self::call("blx"),
            Opcode::Bx => Self::plain("bx"),
            Opcode::Cbz => Self::plain("cbz"),
            Opcode::Cbnz => Self::plain("cbnz"),
            Opcode::Tbb => Self::plain("tbb"),
            Opcode::Tbh => Self::plain("tbh"),
            Opcode::Other => Self::plain("<other>"),
        }
    }
}

/// 1-based index of the first instruction that saves LR to the stack, or 0
/// when none does.
///
/// Recognized forms: PUSH with LR in the register list, and STR of LR with
/// an SP-based memory operand. The 0-as-none sentinel is what procedure
/// traversal keys on when checking stack discipline.
pub fn lr_stack_store_index(instructions: &[Instruction]) -> usize {
    for (idx, inst) in instructions.iter().enumerate() {
        if stores_lr_to_stack(inst) {
            return idx + 1;
        }
    }
    0
}

fn stores_lr_to_stack(inst: &Instruction) -> bool {
    match inst.opcode {
        Opcode::Push => inst
            .register_list()
            .is_some_and(|list| list.contains(Reg::LR)),
        Opcode::Str => {
            matches!(inst.operands.first(), Some(Operand::Reg(Reg(14))))
                && inst.memory_operand().is_some_and(|(base, _)| base == Reg::SP)
        }
        _ => false,
    }
}

/// All PC-relative loads in a maximal block, in address order.
pub fn pc_relative_loads(block: &MaximalBlock) -> Vec<&Instruction> {
    block
        .instructions()
        .iter()
        .filter(|inst| inst.is_pc_relative_load())
        .collect()
}

/// Base address of the jump table read by a two-operand table branch of the
/// form `ldr pc, [pc, rM, lsl #2]`.
///
/// The table sits at the word-aligned PC value plus the encoded
/// displacement. Returns `None` when the load is not PC-based; the table
/// location is then unrecoverable without value analysis.
pub fn ldr_switch_base_addr(inst: &Instruction) -> Option<Addr> {
    if inst.opcode != Opcode::Ldr {
        return None;
    }
    let (base, disp) = inst.memory_operand()?;
    if base != Reg::PC {
        return None;
    }
    let aligned = (inst.addr + 4) & !3;
    Some((aligned as i64 + i64::from(disp)) as Addr)
}
