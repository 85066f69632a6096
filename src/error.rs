//! Error types crossing the pipeline's internal and outer boundaries.
//!
//! [`ResilienceError`] is the tagged result the pipeline works with while a
//! call is in progress. [`NormalizedError`] is the only shape callers see.
use crate::classify::StatusCode;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Outcome of one guarded attempt, before normalization.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The attempt exceeded the per-call timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The endpoint's breaker rejected the call without attempting it.
    CircuitOpen { endpoint: String, failure_count: u64, retry_after: Duration },
    /// The owning client was disposed before the call could start.
    Disposed,
    /// The underlying remote call failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "deadline exceeded after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { endpoint, failure_count, retry_after } => write!(
                f,
                "circuit breaker open for {} ({} failures, retry in {:?})",
                endpoint, failure_count, retry_after
            ),
            Self::Disposed => write!(f, "client has been disposed"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Which [`ErrorKind`] this becomes once normalized.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Deadline,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Disposed => ErrorKind::Disposed,
            Self::Inner(_) => ErrorKind::Upstream,
        }
    }
}

/// Failure taxonomy surfaced on [`NormalizedError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The per-call timeout elapsed.
    Deadline,
    /// The breaker rejected the call without attempting it.
    CircuitOpen,
    /// The remote call itself failed.
    Upstream,
    /// The client was disposed.
    Disposed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Deadline => "deadline",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Uniform error returned by every resilient call.
///
/// `details` and `metadata` have already been through sensitive-field
/// redaction by the time a caller sees them.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<StatusCode>,
    pub details: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), code: None, details: None, metadata: None }
    }

    pub fn with_code(mut self, code: StatusCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn is_deadline(&self) -> bool {
        self.kind == ErrorKind::Deadline
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    pub fn is_upstream(&self) -> bool {
        self.kind == ErrorKind::Upstream
    }
}
