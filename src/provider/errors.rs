//! Provider error translation
//!
//! Transports report failures as [`ApiError`]: an optional provider code plus
//! a message. [`ErrorCode`] is the closed set of codes the cloud layer reacts
//! to; everything else stays unclassified and is wrapped with call context.
//! See https://docs.aws.amazon.com/AWSEC2/latest/APIReference/errors-overview.html

use crate::error::Error;
use std::fmt;
use thiserror::Error as ThisError;

/// Failure reported by a provider transport
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("{}", self.describe())]
pub struct ApiError {
    /// Provider error code, e.g. `InvalidVolume.NotFound`
    pub code: Option<String>,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Provider codes with a dedicated meaning in the cloud layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The volume does not exist
    VolumeNotFound,
    /// The snapshot does not exist
    SnapshotNotFound,
    /// The instance does not exist
    InstanceNotFound,
    /// Detaching a volume that is not attached to the instance
    AttachmentNotFound,
    /// The resource is not in a state that allows the request
    IncorrectState,
    /// The volume is already being modified
    IncorrectModificationState,
    /// The volume is attached elsewhere or an attach is in progress
    VolumeInUse,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::VolumeNotFound => "InvalidVolume.NotFound",
            ErrorCode::SnapshotNotFound => "InvalidSnapshot.NotFound",
            ErrorCode::InstanceNotFound => "InvalidInstanceID.NotFound",
            ErrorCode::AttachmentNotFound => "InvalidAttachment.NotFound",
            ErrorCode::IncorrectState => "IncorrectState",
            ErrorCode::IncorrectModificationState => "IncorrectModificationState",
            ErrorCode::VolumeInUse => "VolumeInUse",
        }
    }

    /// Recognise a provider code; unknown codes yield `None`
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "InvalidVolume.NotFound" => Some(ErrorCode::VolumeNotFound),
            "InvalidSnapshot.NotFound" => Some(ErrorCode::SnapshotNotFound),
            "InvalidInstanceID.NotFound" => Some(ErrorCode::InstanceNotFound),
            "InvalidAttachment.NotFound" => Some(ErrorCode::AttachmentNotFound),
            "IncorrectState" => Some(ErrorCode::IncorrectState),
            "IncorrectModificationState" => Some(ErrorCode::IncorrectModificationState),
            "VolumeInUse" => Some(ErrorCode::VolumeInUse),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Failure with no provider code (connection reset, undecodable body, ...)
    pub fn transport(message: impl fmt::Display) -> Self {
        Self {
            code: None,
            message: message.to_string(),
        }
    }

    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.as_str(), message)
    }

    /// Classify this failure; `None` for unrecognised or missing codes
    pub fn classify(&self) -> Option<ErrorCode> {
        self.code.as_deref().and_then(ErrorCode::parse)
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.classify() == Some(code)
    }

    /// Wrap as an unclassified provider failure of `operation` on `resource`
    pub fn into_error(self, operation: &str, resource: &str) -> Error {
        Error::Provider {
            operation: operation.to_string(),
            resource: resource.to_string(),
            code: self.code,
            message: self.message,
        }
    }

    fn describe(&self) -> String {
        match &self.code {
            Some(code) => format!("{}: {}", code, self.message),
            None => self.message.clone(),
        }
    }
}
