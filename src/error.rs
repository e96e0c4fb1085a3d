//! Error types for capstan
//!
//! All fallible operations in the crate return [`Result<T>`], an alias over
//! [`CapstanError`]. Variants are grouped by concern so callers can match on
//! the failure class: store access, event fetching, application handlers,
//! lifecycle misuse, and the usual io/serialization conversions.

use thiserror::Error;

/// Result type alias for capstan operations
pub type Result<T> = std::result::Result<T, CapstanError>;

/// Top-level error type for all capstan operations.
#[derive(Error, Debug)]
pub enum CapstanError {
    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {detail}")]
    Config {
        /// What was wrong with the configuration
        detail: String,
    },

    /// An operation was invoked in a lifecycle state that does not allow it.
    #[error("operation '{operation}' is not allowed while the processor is {state}")]
    InvalidState {
        /// The operation that was attempted
        operation: String,
        /// The lifecycle state the processor was in
        state: String,
    },

    /// A checkpoint store operation failed.
    #[error("store operation '{operation}' failed: {detail}")]
    Store {
        /// The store operation that failed
        operation: String,
        /// Backend-specific failure detail
        detail: String,
    },

    /// Fetching events from a partition failed. The pump treats these as
    /// transient and retries with bounded backoff.
    #[error("fetch from partition '{partition_id}' failed: {detail}")]
    Fetch {
        /// The partition being read
        partition_id: String,
        /// Source-specific failure detail
        detail: String,
    },

    /// An application callback returned an error or panicked.
    #[error("handler for partition '{partition_id}' failed: {detail}")]
    Handler {
        /// The partition the callback was processing
        partition_id: String,
        /// The error the callback produced
        detail: String,
    },

    /// The source does not know the requested partition.
    #[error("unknown partition '{partition_id}'")]
    UnknownPartition {
        /// The partition that was requested
        partition_id: String,
    },

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CapstanError {
    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        CapstanError::Config {
            detail: detail.into(),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        CapstanError::InvalidState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Create a store error.
    pub fn store(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        CapstanError::Store {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Create a fetch error.
    pub fn fetch(partition_id: impl Into<String>, detail: impl Into<String>) -> Self {
        CapstanError::Fetch {
            partition_id: partition_id.into(),
            detail: detail.into(),
        }
    }

    /// Create a handler error.
    pub fn handler(partition_id: impl Into<String>, detail: impl Into<String>) -> Self {
        CapstanError::Handler {
            partition_id: partition_id.into(),
            detail: detail.into(),
        }
    }

    /// Create an unknown-partition error.
    pub fn unknown_partition(partition_id: impl Into<String>) -> Self {
        CapstanError::UnknownPartition {
            partition_id: partition_id.into(),
        }
    }
}
