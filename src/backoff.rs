//! Exponential backoff between retry attempts.
//!
//! Attempt semantics: `attempt_index` is `0` for the first *retry* (the
//! original call never waits), so the first delay equals the base delay and
//! each later retry doubles it, clamped at the configured maximum.
//!
//! ```rust
//! use std::time::Duration;
//! use ninelives_rpc::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_millis(500))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(1), Duration::from_millis(200));
//! assert_eq!(backoff.delay(2), Duration::from_millis(400));
//! assert_eq!(backoff.delay(3), Duration::from_millis(500)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to
//! `MAX_BACKOFF` (1 day) before the configured cap is applied.

use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max retry delay ({:?}) must be >= base delay ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Clamp every delay at `max`. Errors if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Delay before retry number `attempt_index + 1`.
    pub fn delay(&self, attempt_index: usize) -> Duration {
        let exponent = attempt_index.min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_waits_the_base_delay() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
    }

    #[test]
    fn doubles_each_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn respects_max() {
        let backoff = Backoff::exponential(Duration::from_secs(1))
            .with_max(Duration::from_secs(10))
            .unwrap();
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn delays_are_non_decreasing() {
        let backoff = Backoff::exponential(Duration::from_millis(30))
            .with_max(Duration::from_millis(1000))
            .unwrap();
        let delays: Vec<_> = (0..20).map(|i| backoff.delay(i)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn zero_base_never_waits() {
        let backoff = Backoff::exponential(Duration::ZERO).with_max(Duration::ZERO).unwrap();
        assert_eq!(backoff.delay(7), Duration::ZERO);
    }

    #[test]
    fn max_below_base_is_rejected() {
        let err = Backoff::exponential(Duration::from_secs(2))
            .with_max(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BackoffError::MaxLessThanBase { .. }));
    }
}
