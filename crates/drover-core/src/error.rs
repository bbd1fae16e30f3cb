//! Error types for drover operations.
//!
//! This module defines [`DroverError`], the single error enum shared by the
//! pool, the configuration layer and the binary. Request-path errors
//! ([`DroverError::Cancelled`], [`DroverError::NoFreeWorkers`],
//! [`DroverError::PoolStopped`]) mean "cannot serve this request right now";
//! only [`DroverError::NoWorkersLeft`] is fatal to the whole process.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`DroverError`].
pub type Result<T> = std::result::Result<T, DroverError>;

/// Error type for all drover operations.
#[derive(Debug, Error)]
pub enum DroverError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    /// The pool is draining or destroyed and will not hand out workers
    #[error("Worker pool is stopped")]
    PoolStopped,

    /// No idle worker became available in time
    #[error("No free workers available after {timeout_ms}ms")]
    NoFreeWorkers { timeout_ms: u64 },

    /// The caller cancelled the operation before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// A worker could not be allocated (possibly after retries)
    #[error("Failed to allocate worker: {message}")]
    AllocationFailed { message: String },

    /// Allocation failed and the roster is empty; nothing can ever be served
    #[error("No workers left in the pool: {message}")]
    NoWorkersLeft { message: String },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// Worker not found in the roster
    #[error("Worker not found: pid {pid}")]
    WorkerNotFound { pid: u32 },

    /// Worker process could not be spawned
    #[error("Failed to spawn worker `{command}`: {message}")]
    WorkerSpawn { command: String, message: String },

    /// Worker process exited abnormally
    #[error("Worker {pid} exited with code {exit_code:?}")]
    WorkerExit { pid: u32, exit_code: Option<i32> },

    // =========================================================================
    // Event Errors
    // =========================================================================
    /// Subscription pattern is malformed
    #[error("Invalid event pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in drover)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DroverError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create an allocation error
    pub fn allocation_failed(message: impl Into<String>) -> Self {
        Self::AllocationFailed {
            message: message.into(),
        }
    }

    /// Create a worker spawn error
    pub fn worker_spawn(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkerSpawn {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if the caller may simply retry later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoFreeWorkers { .. }
                | Self::Cancelled
                | Self::AllocationFailed { .. }
        )
    }

    /// Returns true if this error is fatal (the process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoWorkersLeft { .. } | Self::Internal { .. })
    }

    /// Returns true if the pool cannot serve this request right now
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::PoolStopped | Self::NoFreeWorkers { .. } | Self::Cancelled
        )
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } | Self::ConfigValidation { .. }
        )
    }

    /// Returns true if this is a worker-related error
    pub fn is_worker_error(&self) -> bool {
        matches!(
            self,
            Self::WorkerNotFound { .. }
                | Self::WorkerSpawn { .. }
                | Self::WorkerExit { .. }
        )
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => Some("Pass an existing file with --config"),
            Self::ConfigInvalid { .. } => {
                Some("Check YAML syntax - try 'drover --check' to see detailed errors")
            }
            Self::NoFreeWorkers { .. } => {
                Some("Increase pool.num_workers or pool.allocate_timeout")
            }
            Self::WorkerSpawn { .. } => Some("Check that worker.command exists and is executable"),
            Self::NoWorkersLeft { .. } => {
                Some("Check worker logs in ~/.drover/logs/ for repeated spawn failures")
            }
            _ => None,
        }
    }
}
