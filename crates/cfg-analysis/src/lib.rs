//! CFG and interprocedural CFG recovery for ARMv7/Thumb-2 sections
//!
//! Given a section's speculatively decoded maximal blocks (see the
//! `section-disasm` crate), this crate resolves the overlapping candidate
//! decodings into a consistent text/data partition and recovers the
//! section's control structure:
//!
//! 1. [`SectionAnalyzer::build_cfg`] links blocks into a draft CFG,
//!    marking overlaps and direct-branch successors.
//! 2. [`SectionAnalyzer::refine_cfg`] arbitrates overlaps by node weight,
//!    validates conditional branches, records call/return relations, and
//!    selects each node's valid basic block.
//! 3. [`SectionAnalyzer::recover_switch_statements`] decodes TBB/TBH/LDR
//!    jump tables out of the section bytes and registers their case
//!    targets.
//! 4. [`SectionAnalyzer::build_call_graph`] partitions the graph into
//!    procedures rooted at direct-call targets and classifies every
//!    procedure exit.
//!
//! Ambiguity is never an error: a decoding that cannot be made consistent
//! is reclassified as data and detached from the graph. The passes run
//! single-threaded over an arena of nodes whose ids equal the maximal
//! block ids; downstream readers consume the final snapshot through
//! [`SectionAnalyzer::cfg`] and [`SectionAnalyzer::call_graph`].
//!
//! # Example
//!
//! ```no_run
//! use cfg_analysis::SectionAnalyzer;
//! use section_disasm::SectionDisassembly;
//!
//! # fn decode() -> SectionDisassembly { unimplemented!() }
//! let section: SectionDisassembly = decode();
//! let mut analyzer = SectionAnalyzer::new(&section, 0x8000, 0x9000);
//! analyzer.analyze()?;
//! for proc in analyzer.call_graph().procedures() {
//!     println!("procedure at {:#x}: {} exits", proc.entry_addr(), proc.exits().len());
//! }
//! # Ok::<(), cfg_analysis::AnalysisError>(())
//! ```

mod analyzer;
mod builder;
mod error;
mod graph;
mod icfg;
mod node;
mod refine;
mod switch;
#[cfg(test)]
mod test_util;

pub use analyzer::SectionAnalyzer;
pub use error::AnalysisError;
pub use graph::Cfg;
pub use icfg::{CallGraph, ExitKind, Procedure, ProcedureExit, ProcedureKind};
pub use node::{CfgEdge, CfgNode, NodeType, ProcedureRole};
