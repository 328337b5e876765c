//! Middle-end of the BCPL compiler.
//!
//! Runs in a fixed serial order: symbol discovery and semantic analysis over
//! the AST, then the AST-level optimizer passes (constant folding, strength
//! reduction, loop-invariant code motion), then CFG construction, then the
//! block-local CSE pass, then liveness and live intervals. Semantic
//! diagnostics accumulate; only internal inconsistencies abort.

pub mod analyzer;
pub mod cfg;
pub mod cse;
pub mod fold;
pub mod intervals;
pub mod licm;
pub mod liveness;
pub mod metrics;
pub mod strength;
pub mod symbols;

pub use analyzer::{Analyzer, SemanticDiagnostic};
pub use cfg::{BasicBlock, CfgBuilder, ControlFlowGraph};
pub use intervals::LiveInterval;
pub use liveness::LivenessInfo;
pub use metrics::FunctionMetrics;
pub use symbols::{Symbol, SymbolKind, SymbolLocation, SymbolTable};

use thiserror::Error;

/// Internal-consistency failures in the middle end. These abort compilation.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unknown function '{0}' requested from the CFG builder")]
    UnknownFunction(String),

    #[error("unresolved GOTO target '{0}' in function '{1}'")]
    UnresolvedGoto(String, String),

    #[error("internal analysis error: {0}")]
    Internal(String),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
