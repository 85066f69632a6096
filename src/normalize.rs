//! Conversion of attempt outcomes into [`NormalizedError`].

use crate::classify::{codes, RpcError};
use crate::error::{ErrorKind, NormalizedError, ResilienceError};
use crate::redact::Redactor;
use serde_json::{json, Value};

/// Payload substituted when details or metadata cannot be produced safely.
pub fn placeholder_payload() -> Value {
    json!({ "error": "details unavailable" })
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    redactor: Redactor,
}

impl Normalizer {
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn normalize<E: RpcError>(&self, err: ResilienceError<E>) -> NormalizedError {
        let message = err.to_string();
        let kind = err.kind();
        match err {
            ResilienceError::Inner(e) => self.normalize_upstream(&e),
            ResilienceError::Timeout { timeout, .. } => NormalizedError {
                kind,
                message,
                code: Some(codes::DEADLINE_EXCEEDED),
                details: Some(json!({ "timeout_ms": timeout.as_millis() as u64 })),
                metadata: None,
            },
            ResilienceError::CircuitOpen { endpoint, failure_count, retry_after } => {
                NormalizedError {
                    kind,
                    message,
                    code: Some(codes::UNAVAILABLE),
                    details: Some(json!({
                        "endpoint": endpoint,
                        "failure_count": failure_count,
                        "retry_after_ms": retry_after.as_millis() as u64,
                    })),
                    metadata: None,
                }
            }
            ResilienceError::Disposed => NormalizedError::new(kind, message).with_code(codes::CANCELLED),
        }
    }

    /// Copy message, code, details and metadata from an upstream error.
    pub fn normalize_upstream<E: RpcError + ?Sized>(&self, err: &E) -> NormalizedError {
        NormalizedError {
            kind: ErrorKind::Upstream,
            message: err.to_string(),
            code: err.code(),
            details: self.scrub("details", err.details()),
            metadata: self.scrub("metadata", err.metadata()),
        }
    }

    fn scrub(
        &self,
        field: &'static str,
        payload: Result<Option<Value>, serde_json::Error>,
    ) -> Option<Value> {
        match payload {
            Ok(None) => None,
            Ok(Some(value)) => match self.redactor.redact(&value) {
                Ok(clean) => Some(clean),
                Err(e) => {
                    tracing::warn!(field, error = %e, "error payload redaction failed; using placeholder");
                    Some(placeholder_payload())
                }
            },
            Err(e) => {
                tracing::warn!(field, error = %e, "error payload unavailable; using placeholder");
                Some(placeholder_payload())
            }
        }
    }
}
