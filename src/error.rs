//! Error types for the redundancy analyzer

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the redundancy analyzer
#[derive(Error, Debug)]
pub enum AnalyzerError {
    /// A required file does not exist
    #[error("no such file: {0}")]
    NoSuchFile(PathBuf),

    /// The instruction listing of a binary could not be parsed
    #[error("failed to analyze binary: {0}")]
    FailedAnalyzeBinary(String),

    /// A lookup against a registry, snapshot, or symbol table missed
    #[error("entry does not exist: {0}")]
    NotExistEntry(String),

    /// An entry with the same key is already registered
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// An operation needed an output callback that was never registered
    #[error("callback not registered")]
    NotRegisteredCallback,

    /// The approximation level is not one of the enumerated levels
    #[error("no such approximation level: {0}")]
    NoSuchApprox(u32),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for analyzer operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;

impl AnalyzerError {
    /// Check if the error leaves previously registered state intact
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnalyzerError::NotExistEntry("cubin 3".to_string());
        assert_eq!(err.to_string(), "entry does not exist: cubin 3");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AnalyzerError = io.into();
        assert!(matches!(err, AnalyzerError::Io(_)));
        assert!(!err.is_recoverable());
    }
}
