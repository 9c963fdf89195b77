//! gpu-redundancy-analyzer - value redundancy analysis for GPU kernel traces
//!
//! Consumes streams of per-warp memory access records produced by a GPU
//! instrumentation layer, correlates each access with its originating
//! instruction and the allocation it touches, and reports two classes of
//! wasted work per kernel invocation: spatial redundancy (one PC keeps
//! producing the same value across distinct addresses) and temporal
//! redundancy (a thread re-accesses an address and sees the value it
//! already saw there).

#![warn(missing_docs)]

pub mod analyzer;
pub mod binary;
pub mod canonical;
pub mod error;
pub mod instruction;
pub mod kernel;
pub mod memcpy;
pub mod redundancy;
pub mod snapshot;
pub mod trace;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use analyzer::Analyzer;
pub use canonical::ApproxLevel;
pub use error::{AnalyzerError, Result};
pub use instruction::{AccessKind, DataType};
pub use redundancy::{AccessType, AnalysisKind, RecordData, RecordView};
pub use trace::{TraceBuffer, TraceRecord, WARP_SIZE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_analyzer_creation() {
        let analyzer = Analyzer::new();
        assert!(analyzer.output().is_none());
    }
}
