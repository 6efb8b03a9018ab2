//! Unified error hierarchy for hrrs
//!
//! Per-session failures (bad streams) are kept separate from import and
//! configuration problems so a batch run can isolate them, and every error
//! maps onto a severity that the tracing layer understands.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for all hrrs operations
#[derive(Debug, Error)]
pub enum HrrError {
    /// Invalid heart-rate stream for a session
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Input file loading errors
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// Output rendering errors
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Problems with a single session's sample stream.
///
/// These are fatal for the session they belong to and for nothing else.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    /// Session has no samples at all
    #[error("Session {session_id} has no samples")]
    Empty { session_id: String },

    /// Timestamps are not strictly increasing
    #[error("Session {session_id} is out of order at sample {index}")]
    OutOfOrder { session_id: String, index: usize },

    /// Heart rate is not a finite positive number
    #[error("Session {session_id} has invalid heart rate {value} at sample {index}")]
    InvalidHeartRate {
        session_id: String,
        index: usize,
        value: f64,
    },

    /// A row of the session could not be parsed
    #[error("Session {session_id} has an unreadable row at line {line}: {reason}")]
    UnreadableRow {
        session_id: String,
        line: u64,
        reason: String,
    },
}

impl StreamError {
    pub fn session_id(&self) -> &str {
        match self {
            StreamError::Empty { session_id }
            | StreamError::OutOfOrder { session_id, .. }
            | StreamError::InvalidHeartRate { session_id, .. }
            | StreamError::UnreadableRow { session_id, .. } => session_id,
        }
    }
}

/// Input loading errors
#[derive(Debug, Error)]
pub enum ImportError {
    /// Input file not found
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Required column absent from the header
    #[error("Missing required column '{column}' in {path}")]
    MissingColumn { column: String, path: PathBuf },

    /// Underlying CSV reader failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Output rendering errors
#[derive(Debug, Error)]
pub enum ExportError {
    /// JSON serialization failed
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writing failed
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    /// Writing the output file failed
    #[error("Export failed to {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },
}

/// Result type alias for hrrs operations
pub type Result<T> = std::result::Result<T, HrrError>;

impl HrrError {
    /// Whether the error only affects one session of a batch
    pub fn is_session_local(&self) -> bool {
        matches!(self, HrrError::Stream(_))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HrrError::Stream(_) => ErrorSeverity::Warning,
            HrrError::Import(ImportError::FileNotFound { .. }) => ErrorSeverity::Error,
            HrrError::Import(_) => ErrorSeverity::Error,
            HrrError::Export(_) => ErrorSeverity::Error,
            HrrError::Configuration(_) => ErrorSeverity::Error,
            HrrError::Io(_) => ErrorSeverity::Error,
            HrrError::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            HrrError::Stream(StreamError::Empty { session_id }) => {
                format!("Session {} has no heart-rate samples and was skipped.", session_id)
            }
            HrrError::Stream(StreamError::OutOfOrder { session_id, index }) => {
                format!(
                    "Session {} has timestamps out of order (sample {}) and was skipped.",
                    session_id, index
                )
            }
            HrrError::Import(ImportError::FileNotFound { path }) => {
                format!("Could not find input file: {}", path.display())
            }
            HrrError::Configuration(reason) => {
                format!("Invalid configuration: {}. Run `hrrs config --show` to see defaults.", reason)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}
