//! Error types shared by the congestion core.

use thiserror::Error;

/// Errors surfaced by the congestion core.
///
/// Admission denials are not errors; they travel through
/// [`crate::Admission`].
#[derive(Error, Debug)]
pub enum CongestError {
    /// The rule file could not be read. The previously installed rule set
    /// stays active.
    #[error("Failed to read rule file '{path}': {source}")]
    Io {
        /// Path of the rule file.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// An administrative command could not be understood.
    #[error("Invalid control command: {0}")]
    InvalidCommand(String),
}

/// Result type alias for congestion core operations
pub type Result<T> = std::result::Result<T, CongestError>;

/// A line-numbered diagnostic for one rejected rule record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct RuleError {
    /// 1-based line of the record in the rule file.
    pub line: usize,
    /// Human readable reason.
    pub message: String,
}

impl RuleError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}
