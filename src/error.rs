//! Error types and structured exit codes.
//!
//! [`StoreError`] is the error returned by every library operation.
//! [`ExitCode`] and [`StructuredError`] are used by the binary to map a
//! failed command onto a process exit code and an optional JSON report.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::index::FilterError;
use crate::model::Identity;

/// Errors returned by library operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No canonical record exists for the identity.
    #[error("Entity not found: {0}")]
    NotFound(Identity),

    /// The canonical record exists but cannot be decoded.
    #[error("Corrupt record for {identity}: {reason}")]
    Corrupt { identity: Identity, reason: String },

    /// The index database is missing, unreadable or of another version.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// A derived artifact or fingerprint could not be produced.
    #[error("Failed to generate artifact for {identity}: {reason}")]
    GenerationFailed { identity: Identity, reason: String },

    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The identity cannot be used as a filename stem.
    #[error("Invalid identity: {0:?}")]
    InvalidIdentity(String),

    /// The tag filter expression does not parse.
    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    /// The operation was cancelled through its shutdown flag.
    #[error("Operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for library operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Exit codes of the `tagstore` binary.
///
/// - 0: Success
/// - 1: General error
/// - 2: Command completed with no results (empty query, no similar items)
/// - 3: Partial success (e.g. rebuild skipped corrupt records)
/// - 130: Interrupted by user (Ctrl+C)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Command completed.
    Success = 0,
    /// An unexpected error occurred.
    GeneralError = 1,
    /// Command completed but produced no results.
    NoResults = 2,
    /// Command completed but some items failed.
    PartialSuccess = 3,
    /// Interrupted by user (Ctrl+C).
    Interrupted = 130,
}

impl ExitCode {
    /// Get the numeric exit code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Get the machine-readable code prefix.
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Success => "TS000",
            Self::GeneralError => "TS001",
            Self::NoResults => "TS002",
            Self::PartialSuccess => "TS003",
            Self::Interrupted => "TS130",
        }
    }

    /// Exit code for an error returned by a command.
    #[must_use]
    pub fn for_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::Cancelled) => Self::Interrupted,
            _ => Self::GeneralError,
        }
    }
}

/// Structured error information for JSON output.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    /// The error code (e.g., "TS001")
    pub code: String,
    /// The exit code number
    pub exit_code: i32,
    /// Human-readable error message, including its causes
    pub message: String,
    /// Whether the operation was interrupted
    pub interrupted: bool,
}

impl StructuredError {
    /// Create a new structured error from an anyhow error and an exit code.
    #[must_use]
    pub fn new(err: &anyhow::Error, exit_code: ExitCode) -> Self {
        Self {
            code: exit_code.code_prefix().to_string(),
            exit_code: exit_code.as_i32(),
            message: format!("{:#}", err),
            interrupted: exit_code == ExitCode::Interrupted,
        }
    }
}
