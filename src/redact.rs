//! Sensitive-field redaction for error details and metadata.
//!
//! Object keys are matched case-insensitively against a configured list;
//! matching values are replaced with [`REDACTED`] wherever they appear in the
//! payload, including inside arrays and nested objects.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Nesting depth beyond which a payload is rejected rather than walked.
pub const MAX_REDACTION_DEPTH: usize = 32;

/// Field names redacted when none are configured.
pub const DEFAULT_REDACT_FIELDS: &[&str] = &["password", "token", "secret", "key", "authorization"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedactionError {
    #[error("payload nested deeper than {max} levels")]
    TooDeep { max: usize },
}

#[derive(Debug, Clone)]
pub struct Redactor {
    fields: Arc<BTreeSet<String>>,
}

impl Redactor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = fields.into_iter().map(|f| f.as_ref().to_ascii_lowercase()).collect();
        Self { fields: Arc::new(fields) }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.fields.contains(&key.to_ascii_lowercase())
    }

    /// Copy of `value` with every sensitive field replaced.
    pub fn redact(&self, value: &Value) -> Result<Value, RedactionError> {
        self.walk(value, 0)
    }

    fn walk(&self, value: &Value, depth: usize) -> Result<Value, RedactionError> {
        if depth > MAX_REDACTION_DEPTH {
            return Err(RedactionError::TooDeep { max: MAX_REDACTION_DEPTH });
        }
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    let next = if self.is_sensitive(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.walk(v, depth + 1)?
                    };
                    out.insert(k.clone(), next);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                items.iter().map(|v| self.walk(v, depth + 1)).collect::<Result<_, _>>().map(Value::Array)
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_REDACT_FIELDS)
    }
}
