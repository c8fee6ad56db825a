//! Error types for warp correction operations.
//!
//! A single taxonomy is shared by every crate of the workspace so that grid,
//! path, solver and metadata failures can be told apart by callers.

use thiserror::Error;

/// Main error type for warp correction operations.
#[derive(Error, Debug)]
pub enum WarpDriveError {
    /// Bad grid, spacing or solver parameter. Raised before any I/O happens.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An expected subject file or pattern match is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A search pattern that must identify one file matched several.
    #[error("Ambiguous match: {count} files match {pattern}")]
    AmbiguousMatch { pattern: String, count: usize },

    /// An external process exited abnormally or reported failure.
    #[error("External tool failure: {0}")]
    ExternalToolFailure(String),

    /// Persisted state does not have the expected structure or fields diverge.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// A commit for this subject is still outstanding.
    #[error("A correction commit is already in flight")]
    CommitInFlight,

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for warp correction operations.
pub type Result<T> = std::result::Result<T, WarpDriveError>;

impl WarpDriveError {
    /// Create an invalid parameter error.
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an ambiguous match error.
    pub fn ambiguous_match(pattern: impl Into<String>, count: usize) -> Self {
        Self::AmbiguousMatch {
            pattern: pattern.into(),
            count,
        }
    }

    /// Create an external tool failure error.
    pub fn external_tool(msg: impl Into<String>) -> Self {
        Self::ExternalToolFailure(msg.into())
    }

    /// Create an inconsistent state error.
    pub fn inconsistent_state(msg: impl Into<String>) -> Self {
        Self::InconsistentState(msg.into())
    }

    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalToolFailure(_) | Self::CommitInFlight)
    }
}
