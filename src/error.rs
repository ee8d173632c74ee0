//! Error types for lakebench.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for lakebench operations.
///
/// Only setup failures (no connection can be opened at all, the external
/// tool cannot be started) end a run through this type. Failures of a single
/// execution are recorded as an [`ErrorKind`] on its result instead.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A query source was rejected before any execution.
    #[error("Validation error in '{source_name}': {message}")]
    Validation {
        source_name: String,
        message: String,
    },

    /// No connection became available within the acquire timeout.
    #[error("Pool exhausted: no connection available after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The pool has been closed.
    #[error("Pool is closed")]
    PoolClosed,

    /// Could not open a connection to the target database.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The external benchmark tool produced output we could not read.
    #[error("Report parse error: {message}")]
    ReportParse {
        message: String,
        stdout: String,
        stderr: String,
        /// Exit status of the tool, when it ran to completion.
        exit_code: Option<i32>,
    },

    /// The external benchmark tool could not be started or exited non-zero.
    #[error("Failed to run '{program}': {message}")]
    ToolLaunch { program: String, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// Create a validation error for the named query source.
    pub fn validation(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a report parse error that keeps the raw tool output.
    pub fn report_parse(
        message: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ReportParse {
            message: message.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: None,
        }
    }

    /// Classification used when this error is absorbed into an execution result.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::PoolClosed | Self::Connection(_) | Self::Io(_) => ErrorKind::ConnectionError,
            _ => ErrorKind::Other,
        }
    }
}

/// Result type alias for lakebench operations.
pub type BenchResult<T> = Result<T, BenchError>;

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionError,
    Timeout,
    SyntaxOrPermissionError,
    PoolExhausted,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionError => "ConnectionError",
            Self::Timeout => "Timeout",
            Self::SyntaxOrPermissionError => "SyntaxOrPermissionError",
            Self::PoolExhausted => "PoolExhausted",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
