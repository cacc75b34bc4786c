//! Error types for the cloud orchestration core
//!
//! Every provider failure is translated into one of a small, closed set of
//! domain errors at the call that produced it. Callers match on [`ErrorKind`]
//! instead of provider codes.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cloud layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("found {count} {kind}s matching {key}")]
    MultipleFound {
        kind: &'static str,
        key: String,
        count: usize,
    },

    #[error("volume {name} already exists with size {existing_gib} GiB, requested {requested_gib} GiB")]
    SizeConflict {
        name: String,
        existing_gib: i64,
        requested_gib: i64,
    },

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Wait Errors
    // =========================================================================
    #[error("timed out waiting for {operation} after {attempts} attempts ({waited:?})")]
    Timeout {
        operation: String,
        attempts: u32,
        waited: Duration,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("{operation} failed for {resource}: {message}")]
    Provider {
        operation: String,
        resource: String,
        code: Option<String>,
        message: String,
    },

    #[error("malformed {operation} response: {reason}")]
    MalformedResponse { operation: String, reason: String },

    // =========================================================================
    // Device Allocation Errors
    // =========================================================================
    #[error("no free device names on instance {instance_id}")]
    DeviceExhausted { instance_id: String },

    #[error("cannot release device {device} on {instance_id}: {reason}")]
    DeviceRelease {
        instance_id: String,
        device: String,
        reason: String,
    },

    // =========================================================================
    // Setup Errors
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Closed set of error categories exposed to the controller/node services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    MultipleFound,
    SizeConflict,
    InvalidArgument,
    Timeout,
    Cancelled,
    DeadlineExceeded,
    Provider,
    Internal,
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::MultipleFound { .. } => ErrorKind::MultipleFound,
            Error::SizeConflict { .. } => ErrorKind::SizeConflict,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::Provider { .. } | Error::MalformedResponse { .. } => ErrorKind::Provider,
            Error::DeviceExhausted { .. }
            | Error::DeviceRelease { .. }
            | Error::Configuration(_)
            | Error::Metrics(_)
            | Error::JsonParse(_) => ErrorKind::Internal,
        }
    }

    /// Check if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. }
            | Error::DeadlineExceeded { .. }
            | Error::AlreadyExists { .. }
            | Error::DeviceExhausted { .. } => true,
            Error::Provider { code, .. } => !matches!(
                code.as_deref(),
                Some("InvalidParameterValue" | "InvalidParameterCombination" | "UnauthorizedOperation")
            ),
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn malformed(operation: &str, reason: impl Into<String>) -> Self {
        Error::MalformedResponse {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the cloud layer
pub type Result<T> = std::result::Result<T, Error>;
