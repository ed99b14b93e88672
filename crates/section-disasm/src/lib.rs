//! Data model for a speculatively disassembled ARMv7/Thumb-2 section
//!
//! This crate defines the records a decoder front-end produces for one
//! executable section, in the form the section analyzer consumes:
//!
//! - [`Instruction`]: one decoded instruction with its operands
//! - [`Branch`]: how a maximal block ends (direct/indirect, conditional)
//! - [`MaximalBlock`]: a speculative straight-line decoding ending at the
//!   first branch, together with its candidate basic blocks (the suffixes
//!   at each distinct entry offset)
//! - [`SectionDisassembly`]: the section container, raw bytes plus the
//!   maximal-block sequence sorted by start address, with address-based
//!   lookup
//!
//! Maximal blocks may mutually overlap: when code and data are interleaved,
//! two candidate decodings can claim the same bytes with disagreeing
//! instruction boundaries. Resolving those overlaps is the analyzer's job
//! (see the `cfg-analysis` crate); this crate only answers address queries.
//!
//! # Modules
//!
//! - [`arm`]: opcode ids, classification, and the ISA probes used for
//!   procedure recovery (LR stack stores, PC-relative loads, LDR tables)
//! - [`instruction`]: instruction and operand records
//! - [`branch`]: branch descriptors
//! - [`maximal_block`]: maximal blocks and candidate basic blocks
//! - [`section`]: the section container

pub mod arm;
pub mod branch;
pub mod instruction;
pub mod maximal_block;
pub mod section;

pub use arm::{ClassifiedOpcode, Opcode};
pub use branch::Branch;
pub use instruction::{Instruction, Operand, Reg, RegList};
pub use maximal_block::{BasicBlock, MaximalBlock};
pub use section::SectionDisassembly;

/// A virtual address inside the analyzed binary.
pub type Addr = u64;
