//! Error taxonomy shared by every nanoquant crate.
//!
//! Run-level failures are variants of [`NanoquantError`]. Per-layer
//! degradation is not an error: it is recorded in the layer report and
//! classified as [`ErrorKind::DegradedCompression`] for callers that bucket
//! outcomes.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for nanoquant operations.
pub type Result<T> = std::result::Result<T, NanoquantError>;

/// Errors that abort a compression run or an artifact operation.
#[derive(Error, Debug)]
pub enum NanoquantError {
    /// Bad level, options or model reference
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Model could not be located or loaded
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Tensors could not be enumerated or decoded
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Calibration was required but could not produce a signal
    #[error("Calibration failed: {0}")]
    CalibrationFailed(String),

    /// Caller-supplied deadline passed before the run finished
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Caller cancelled the run
    #[error("Compression cancelled")]
    Cancelled,

    /// A transform broke the element-count or shape invariant
    #[error("Internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Payload decompression or integrity error
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Header or payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of outcomes, used for reporting and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    SourceUnavailable,
    UnsupportedFormat,
    CalibrationFailed,
    DegradedCompression,
    DeadlineExceeded,
    Cancelled,
    InternalInvariantViolation,
    Io,
    Codec,
}

impl ErrorKind {
    /// Whether retrying with the same request can succeed.
    ///
    /// Input problems and calibration failures need the caller to change
    /// something first; deadlines, cancellation and I/O are transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::Cancelled | Self::Io)
    }

    /// Whether the outcome still produces an artifact.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::DegradedCompression)
    }
}

impl NanoquantError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::CalibrationFailed(_) => ErrorKind::CalibrationFailed,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InternalInvariantViolation(_) => ErrorKind::InternalInvariantViolation,
            Self::Io(_) => ErrorKind::Io,
            Self::Compression(_) | Self::Decompression(_) | Self::Serialization(_) => {
                ErrorKind::Codec
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            NanoquantError::InvalidRequest("x".into()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(NanoquantError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            NanoquantError::Serialization("bad".into()).kind(),
            ErrorKind::Codec
        );
    }

    #[test]
    fn test_retry_policy() {
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::InternalInvariantViolation.is_retryable());
        assert!(ErrorKind::DeadlineExceeded.is_retryable());
        assert!(!ErrorKind::DegradedCompression.is_fatal());
        assert!(ErrorKind::Cancelled.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: NanoquantError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("gone"));
    }
}
