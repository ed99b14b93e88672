//! Shared builders for unit tests

pub(crate) use crate::analyzer::SectionAnalyzer;

use section_disasm::{Addr, Branch, Instruction, MaximalBlock, Opcode, SectionDisassembly};

/// A run of consecutive 2-byte instructions with the given opcodes.
pub(crate) fn straight_block(
    id: usize,
    start: Addr,
    opcodes: &[Opcode],
    branch: Branch,
) -> MaximalBlock {
    let instructions = opcodes
        .iter()
        .enumerate()
        .map(|(i, &opcode)| Instruction::new(start + 2 * i as Addr, 2, opcode, vec![]))
        .collect();
    MaximalBlock::new(id, instructions, branch)
}

/// A run of consecutive instructions with explicit sizes.
pub(crate) fn sized_block(
    id: usize,
    start: Addr,
    instructions: &[(u8, Opcode)],
    branch: Branch,
) -> MaximalBlock {
    MaximalBlock::new(id, sized_instructions(start, instructions), branch)
}

/// Like [`sized_block`], with candidate basic blocks at the given
/// instruction indices.
pub(crate) fn entries_block(
    id: usize,
    start: Addr,
    instructions: &[(u8, Opcode)],
    branch: Branch,
    entries: Vec<usize>,
) -> MaximalBlock {
    MaximalBlock::with_entries(id, sized_instructions(start, instructions), branch, entries)
}

fn sized_instructions(start: Addr, instructions: &[(u8, Opcode)]) -> Vec<Instruction> {
    let mut addr = start;
    instructions
        .iter()
        .map(|&(size, opcode)| {
            let inst = Instruction::new(addr, size, opcode, vec![]);
            addr += Addr::from(size);
            inst
        })
        .collect()
}

/// A zero-filled section of `size` bytes at `base`.
pub(crate) fn section(base: Addr, size: usize, blocks: Vec<MaximalBlock>) -> SectionDisassembly {
    SectionDisassembly::new(base, vec![0; size], blocks)
}

/// A section with explicit byte contents (for jump-table reads).
pub(crate) fn section_with_bytes(
    base: Addr,
    bytes: Vec<u8>,
    blocks: Vec<MaximalBlock>,
) -> SectionDisassembly {
    SectionDisassembly::new(base, bytes, blocks)
}
