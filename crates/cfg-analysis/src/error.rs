//! Error types for section analysis

use thiserror::Error;

/// Errors surfaced by the analysis passes.
///
/// Ambiguous decodings are not errors; they resolve to data
/// reclassification. The only fatal condition is a section with too few
/// direct call sites to partition into procedures.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error("found {found} direct call sites, need at least {minimum} to partition the section")]
    TooFewCallSites { found: usize, minimum: usize },
}
