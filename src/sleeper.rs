//! How the pipeline waits out backoff delays between retry attempts.
//!
//! Production uses [`TokioSleeper`]. Tests inject [`InstantSleeper`] to skip
//! delays, or [`TrackingSleeper`] to assert on the delays the pipeline asked
//! for (optionally still suspending through another sleeper).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping between retry attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Records every requested delay, then delegates to an inner sleeper
/// ([`InstantSleeper`] unless built with [`TrackingSleeper::wrapping`]).
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    inner: Arc<dyn Sleeper>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::wrapping(InstantSleeper)
    }

    /// Record delays but still suspend through `inner`.
    pub fn wrapping<S: Sleeper + 'static>(inner: S) -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())), inner: Arc::new(inner) }
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        self.inner.sleep(duration)
    }
}
