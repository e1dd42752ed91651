//! Error types for the dispatch engine
//!
//! Two error types exist side by side:
//!
//! * [`ConversionError`] is the closed set of outcomes a caller of
//!   [`DispatchEngine::dispatch`](crate::DispatchEngine::dispatch) can observe.
//!   Every pool- or converter-level failure is mapped to exactly one variant.
//! * [`EngineError`] covers construction and lifecycle problems (bad
//!   configuration, worker threads that cannot be spawned or joined).

use crate::convert::{ConverterError, FailureKind};
use crate::core::class::ExecutionClass;
use crate::process::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for engine lifecycle operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Tag of a [`ConversionError`], suitable for wire formats and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The converter does not handle this format
    UnsupportedFormat,
    /// The payload is malformed
    CorruptInput,
    /// The job did not finish within its deadline
    Timeout,
    /// Opaque converter or execution unit failure
    ConverterFailure,
    /// The target pool had no free slot
    Overloaded,
}

impl ErrorKind {
    /// snake_case name of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::CorruptInput => "corrupt_input",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConverterFailure => "converter_failure",
            ErrorKind::Overloaded => "overloaded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a failed dispatch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// The converter does not support the document's format
    #[error("Unsupported format for '{filename}': {message}")]
    UnsupportedFormat {
        /// Filename hint of the rejected document
        filename: String,
        /// Converter message
        message: String,
    },

    /// The document is malformed or empty
    #[error("Corrupt input '{filename}': {message}")]
    CorruptInput {
        /// Filename hint of the rejected document
        filename: String,
        /// Converter message
        message: String,
    },

    /// The job did not reach a result before its deadline
    #[error("Conversion timed out after {timeout_ms}ms ({class} pool)")]
    Timeout {
        /// Pool the job was routed to
        class: ExecutionClass,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// The converter or its execution unit failed
    #[error("Converter failure: {message}")]
    ConverterFailure {
        /// Failure description
        message: String,
    },

    /// The pool refused the job because every slot was taken
    #[error("The {class} pool is overloaded: {occupied}/{capacity} slots in use")]
    Overloaded {
        /// Pool that refused the job
        class: ExecutionClass,
        /// Slots in use at rejection time
        occupied: usize,
        /// Running plus queued capacity of the pool
        capacity: usize,
    },
}

impl ConversionError {
    /// Create an unsupported format error
    pub fn unsupported_format(filename: impl Into<String>, message: impl Into<String>) -> Self {
        ConversionError::UnsupportedFormat {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt input error
    pub fn corrupt_input(filename: impl Into<String>, message: impl Into<String>) -> Self {
        ConversionError::CorruptInput {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(class: ExecutionClass, timeout_ms: u64) -> Self {
        ConversionError::Timeout { class, timeout_ms }
    }

    /// Create a converter failure
    pub fn converter_failure(message: impl Into<String>) -> Self {
        ConversionError::ConverterFailure {
            message: message.into(),
        }
    }

    /// Create an overloaded error
    pub fn overloaded(class: ExecutionClass, occupied: usize, capacity: usize) -> Self {
        ConversionError::Overloaded {
            class,
            occupied,
            capacity,
        }
    }

    /// Map a failure reported by a converter into the closed error set
    pub fn from_converter(error: ConverterError, filename: &str) -> Self {
        match error.kind {
            FailureKind::UnsupportedFormat => Self::unsupported_format(filename, error.message),
            FailureKind::CorruptInput => Self::corrupt_input(filename, error.message),
            FailureKind::Other => Self::converter_failure(error.message),
        }
    }

    /// The tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversionError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ConversionError::CorruptInput { .. } => ErrorKind::CorruptInput,
            ConversionError::Timeout { .. } => ErrorKind::Timeout,
            ConversionError::ConverterFailure { .. } => ErrorKind::ConverterFailure,
            ConversionError::Overloaded { .. } => ErrorKind::Overloaded,
        }
    }

    /// HTTP status a transport layer should answer with
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::UnsupportedFormat => 415,
            ErrorKind::CorruptInput => 400,
            ErrorKind::Timeout => 504,
            ErrorKind::ConverterFailure => 500,
            ErrorKind::Overloaded => 503,
        }
    }

    /// Whether a caller may retry the same request later
    ///
    /// Only transient conditions qualify; `Overloaded` callers should back off
    /// rather than retry immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Overloaded)
    }
}

/// Errors raised while building, running or stopping the engine
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Invalid configuration with parameter
    #[error("Invalid configuration for '{parameter}': {message}")]
    InvalidConfig {
        /// Configuration parameter name
        parameter: String,
        /// Error message
        message: String,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {source}")]
    ConfigParse {
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// Failed to spawn a worker thread or execution unit
    #[error("Failed to spawn {pool} worker #{worker_id}: {message}")]
    SpawnError {
        /// Pool the worker belongs to
        pool: ExecutionClass,
        /// ID of the worker that failed to spawn
        worker_id: usize,
        /// Error message
        message: String,
        /// Source IO error
        #[source]
        source: Option<std::io::Error>,
    },

    /// Failed to join a worker thread
    #[error("Failed to join {pool} worker #{worker_id}: {message}")]
    JoinError {
        /// Pool the worker belongs to
        pool: ExecutionClass,
        /// ID of the worker that failed to join
        worker_id: usize,
        /// Error message
        message: String,
    },

    /// Worker process protocol failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// IO failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create an invalid config error
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a spawn error with its IO source
    pub fn spawn_with_source(
        pool: ExecutionClass,
        worker_id: usize,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        EngineError::SpawnError {
            pool,
            worker_id,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a join error
    pub fn join(pool: ExecutionClass, worker_id: usize, message: impl Into<String>) -> Self {
        EngineError::JoinError {
            pool,
            worker_id,
            message: message.into(),
        }
    }
}
