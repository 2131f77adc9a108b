//! Error types for streaming parse operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while configuring or running a streaming parse
#[derive(Debug, Error)]
pub enum ParserError {
    /// Invalid configuration parameters, fatal at parser construction
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Source path does not exist
    #[error("source file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// I/O failure while reading the source
    #[error("I/O operation failed")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Invalid UTF-8 in the input stream
    #[error("invalid UTF-8 in input at byte {position}")]
    Utf8 { position: usize },

    /// Chunk boundary calculation failed
    #[error("failed to compute chunk boundaries: {reason}")]
    Chunking { reason: String },

    /// Background worker thread failed
    #[error("background worker failed: {reason}")]
    Worker { reason: String },
}

impl ParserError {
    /// Build a configuration error from the list of violations
    /// reported by `StreamingParserConfig::validate`.
    pub(crate) fn from_violations(violations: Vec<String>) -> Self {
        ParserError::Configuration(violations.join("; "))
    }
}

/// Result type for parse operations
pub type Result<T> = std::result::Result<T, ParserError>;
