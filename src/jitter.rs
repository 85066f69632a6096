//! Opt-in jitter applied on top of the backoff delay.
//!
//! - `None` (default): exact backoff delays, non-decreasing across retries.
//! - `Full`: uniform in `[0, delay]`, spreads synchronized clients the most.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor.
//!
//! Jitter never raises a delay, so the configured maximum still holds.

use rand::{rng, Rng};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let nanos: u64 = delay.as_nanos().try_into().unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            _ if nanos == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_nanos(rng.random_range(0..=nanos)),
            Jitter::Equal => Duration::from_nanos(rng.random_range(nanos / 2..=nanos)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_is_identity() {
        assert_eq!(Jitter::None.apply(Duration::from_millis(123)), Duration::from_millis(123));
    }

    #[test]
    fn full_stays_within_delay() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = Jitter::Full.apply_with_rng(Duration::from_millis(100), &mut rng);
            assert!(d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn equal_keeps_half_floor() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = Jitter::Equal.apply_with_rng(Duration::from_millis(100), &mut rng);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn sub_millisecond_delays_keep_their_scale() {
        let delay = Duration::from_micros(800);
        let mut rng = StdRng::seed_from_u64(3);
        let mut nonzero = 0;
        for _ in 0..50 {
            let d = Jitter::Equal.apply_with_rng(delay, &mut rng);
            assert!(d >= Duration::from_micros(400) && d <= delay);
            if !Jitter::Full.apply_with_rng(delay, &mut rng).is_zero() {
                nonzero += 1;
            }
        }
        assert!(nonzero > 0);
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn deserializes_lowercase_names() {
        let j: Jitter = serde_json::from_str("\"full\"").unwrap();
        assert_eq!(j, Jitter::Full);
    }
}
