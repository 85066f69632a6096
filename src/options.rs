//! Per-client resilience configuration.
//!
//! Options are plain data: build them in code with the chainable setters or
//! deserialize them (durations as `*_ms` integer keys, every field optional):
//!
//! ```rust
//! use ninelives_rpc::ResilienceOptions;
//!
//! let opts: ResilienceOptions = serde_json::from_str(r#"{
//!     "timeout_ms": 2000,
//!     "max_retries": 2,
//!     "retryable_codes": [14],
//!     "breaker": { "failure_threshold": 3, "recovery_timeout_ms": 1000 }
//! }"#).unwrap();
//! opts.validate().unwrap();
//! assert_eq!(opts.breaker.failure_threshold, 3);
//! ```

use crate::backoff::{Backoff, BackoffError};
use crate::classify::{codes, StatusCode};
use crate::jitter::Jitter;
use crate::redact::DEFAULT_REDACT_FIELDS;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 10_000;
const DEFAULT_RETRYABLE_CODES: &[StatusCode] =
    &[codes::UNAVAILABLE, codes::DEADLINE_EXCEEDED, codes::RESOURCE_EXHAUSTED];

const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MONITORING_PERIOD_MS: u64 = 60_000;
const DEFAULT_VOLUME_THRESHOLD: u64 = 10;
const DEFAULT_ERROR_THRESHOLD_PERCENTAGE: f64 = 50.0;

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Errors produced when validating options.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptionsError {
    #[error("failure_threshold must be > 0 when the breaker is enabled")]
    InvalidFailureThreshold,
    #[error("recovery_timeout must be > 0 when the breaker is enabled")]
    InvalidRecoveryTimeout,
    #[error("monitoring_period must be > 0 when the breaker is enabled")]
    InvalidMonitoringPeriod,
    #[error("error_threshold_percentage must be in (0, 100] (got {0})")]
    InvalidErrorThreshold(f64),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
}

/// Circuit-breaker section of [`ResilienceOptions`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    pub enabled: bool,
    /// Counted failures that open a closed breaker.
    pub failure_threshold: u64,
    /// How long an open breaker rejects calls before probing.
    #[serde(rename = "recovery_timeout_ms", deserialize_with = "millis")]
    pub recovery_timeout: Duration,
    /// Width of the rolling sample window used for metrics.
    #[serde(rename = "monitoring_period_ms", deserialize_with = "millis")]
    pub monitoring_period: Duration,
    /// Minimum window samples before the error-rate rule applies; 0 disables it.
    pub volume_threshold: u64,
    pub error_threshold_percentage: f64,
    /// Message substrings that make a failure count toward the threshold.
    /// Empty means every failure counts.
    pub expected_errors: Vec<String>,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_millis(DEFAULT_RECOVERY_TIMEOUT_MS),
            monitoring_period: Duration::from_millis(DEFAULT_MONITORING_PERIOD_MS),
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            error_threshold_percentage: DEFAULT_ERROR_THRESHOLD_PERCENTAGE,
            expected_errors: Vec::new(),
        }
    }
}

impl CircuitBreakerOptions {
    /// Breaking switched off; the pipeline runs calls unguarded.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    /// Configure the error-rate trip; `volume` of 0 disables it.
    pub fn error_rate(mut self, volume: u64, percentage: f64) -> Self {
        self.volume_threshold = volume;
        self.error_threshold_percentage = percentage;
        self
    }

    pub fn expected_errors<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_errors = substrings.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if !self.enabled {
            return Ok(());
        }
        if self.failure_threshold == 0 {
            return Err(OptionsError::InvalidFailureThreshold);
        }
        if self.recovery_timeout.is_zero() {
            return Err(OptionsError::InvalidRecoveryTimeout);
        }
        if self.monitoring_period.is_zero() {
            return Err(OptionsError::InvalidMonitoringPeriod);
        }
        let pct = self.error_threshold_percentage;
        if self.volume_threshold > 0 && !(pct > 0.0 && pct <= 100.0) {
            return Err(OptionsError::InvalidErrorThreshold(pct));
        }
        Ok(())
    }
}

/// Immutable per-client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResilienceOptions {
    /// Per-attempt deadline; zero disables the timeout.
    #[serde(rename = "timeout_ms", deserialize_with = "millis")]
    pub timeout: Duration,
    /// Extra attempts after the first; 0 means the call is made once.
    pub max_retries: usize,
    #[serde(rename = "base_retry_delay_ms", deserialize_with = "millis")]
    pub base_retry_delay: Duration,
    #[serde(rename = "max_retry_delay_ms", deserialize_with = "millis")]
    pub max_retry_delay: Duration,
    pub retryable_codes: BTreeSet<StatusCode>,
    pub jitter: Jitter,
    /// Field names scrubbed from error details and metadata.
    pub redact_fields: Vec<String>,
    pub breaker: CircuitBreakerOptions,
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: Duration::from_millis(DEFAULT_BASE_RETRY_DELAY_MS),
            max_retry_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS),
            retryable_codes: DEFAULT_RETRYABLE_CODES.iter().copied().collect(),
            jitter: Jitter::None,
            redact_fields: DEFAULT_REDACT_FIELDS.iter().map(|f| f.to_string()).collect(),
            breaker: CircuitBreakerOptions::default(),
        }
    }
}

impl ResilienceOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = Duration::ZERO;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_retry_delay = base;
        self.max_retry_delay = max;
        self
    }

    pub fn retryable_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        self.retryable_codes = codes.into_iter().collect();
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn redact_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn breaker(mut self, breaker: CircuitBreakerOptions) -> Self {
        self.breaker = breaker;
        self
    }

    /// Backoff derived from the retry delays.
    pub fn backoff(&self) -> Result<Backoff, OptionsError> {
        Ok(Backoff::exponential(self.base_retry_delay).with_max(self.max_retry_delay)?)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        self.backoff()?;
        self.breaker.validate()
    }
}
