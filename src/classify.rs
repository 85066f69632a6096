//! Error classification: status-code extraction and retry eligibility.
//!
//! Transport errors describe themselves through [`RpcError`]. The
//! [`ErrorClassifier`] holds nothing but the immutable retryable-code set, so
//! classifying the same error twice always gives the same answer.

use crate::error::ResilienceError;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Transport status code (gRPC numbering).
pub type StatusCode = i32;

/// gRPC status codes.
pub mod codes {
    use super::StatusCode;

    pub const OK: StatusCode = 0;
    pub const CANCELLED: StatusCode = 1;
    pub const UNKNOWN: StatusCode = 2;
    pub const INVALID_ARGUMENT: StatusCode = 3;
    pub const DEADLINE_EXCEEDED: StatusCode = 4;
    pub const NOT_FOUND: StatusCode = 5;
    pub const ALREADY_EXISTS: StatusCode = 6;
    pub const PERMISSION_DENIED: StatusCode = 7;
    pub const RESOURCE_EXHAUSTED: StatusCode = 8;
    pub const FAILED_PRECONDITION: StatusCode = 9;
    pub const ABORTED: StatusCode = 10;
    pub const OUT_OF_RANGE: StatusCode = 11;
    pub const UNIMPLEMENTED: StatusCode = 12;
    pub const INTERNAL: StatusCode = 13;
    pub const UNAVAILABLE: StatusCode = 14;
    pub const DATA_LOSS: StatusCode = 15;
    pub const UNAUTHENTICATED: StatusCode = 16;
}

/// A transport error the pipeline can classify and normalize.
///
/// Only `code` matters for retry decisions. `details` and `metadata` feed
/// the normalized error; returning `Err` from them degrades the payload to a
/// placeholder instead of hiding the original failure.
pub trait RpcError: std::error::Error + Send + Sync + 'static {
    fn code(&self) -> Option<StatusCode> {
        None
    }

    fn details(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(None)
    }

    fn metadata(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(None)
    }
}

/// Plain status error for clients without their own error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
    pub details: Option<Value>,
    pub metadata: Option<Value>,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None, metadata: None }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(codes::UNAVAILABLE, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl RpcError for RpcStatus {
    fn code(&self) -> Option<StatusCode> {
        Some(self.code)
    }

    fn details(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(self.details.clone())
    }

    fn metadata(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(self.metadata.clone())
    }
}

/// Socket-level failures map onto the status codes a transport would report.
impl RpcError for std::io::Error {
    fn code(&self) -> Option<StatusCode> {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut => Some(codes::DEADLINE_EXCEEDED),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => Some(codes::UNAVAILABLE),
            ErrorKind::PermissionDenied => Some(codes::PERMISSION_DENIED),
            ErrorKind::NotFound => Some(codes::NOT_FOUND),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Some(codes::INVALID_ARGUMENT),
            _ => None,
        }
    }
}

/// Pipeline outcomes report the code they normalize to.
impl<E: RpcError> RpcError for ResilienceError<E> {
    fn code(&self) -> Option<StatusCode> {
        match self {
            ResilienceError::Inner(e) => e.code(),
            ResilienceError::Timeout { .. } => Some(codes::DEADLINE_EXCEEDED),
            ResilienceError::CircuitOpen { .. } => Some(codes::UNAVAILABLE),
            ResilienceError::Disposed => Some(codes::CANCELLED),
        }
    }

    fn details(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            ResilienceError::Inner(e) => e.details(),
            _ => Ok(None),
        }
    }

    fn metadata(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            ResilienceError::Inner(e) => e.metadata(),
            _ => Ok(None),
        }
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub code: StatusCode,
    pub retryable: bool,
}

/// Decides retry eligibility from a configured set of status codes.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: Arc<BTreeSet<StatusCode>>,
}

impl ErrorClassifier {
    pub fn new<I>(retryable: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        Self { retryable: Arc::new(retryable.into_iter().collect()) }
    }

    /// Status code carried by `err`, or UNKNOWN when it has none.
    pub fn code_of<E: RpcError + ?Sized>(err: &E) -> StatusCode {
        err.code().unwrap_or(codes::UNKNOWN)
    }

    pub fn is_retryable_code(&self, code: StatusCode) -> bool {
        self.retryable.contains(&code)
    }

    pub fn classify_upstream<E: RpcError + ?Sized>(&self, err: &E) -> Classification {
        let code = Self::code_of(err);
        Classification { code, retryable: self.is_retryable_code(code) }
    }

    /// Classify any attempt outcome. Open circuits and disposed clients are
    /// never retryable regardless of the configured set.
    pub fn classify<E: RpcError>(&self, err: &ResilienceError<E>) -> Classification {
        match err {
            ResilienceError::Inner(e) => self.classify_upstream(e),
            ResilienceError::Timeout { .. } => Classification {
                code: codes::DEADLINE_EXCEEDED,
                retryable: self.is_retryable_code(codes::DEADLINE_EXCEEDED),
            },
            ResilienceError::CircuitOpen { .. } => {
                Classification { code: codes::UNAVAILABLE, retryable: false }
            }
            ResilienceError::Disposed => {
                Classification { code: codes::CANCELLED, retryable: false }
            }
        }
    }
}
