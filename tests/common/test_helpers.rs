use ninelives_rpc::{CircuitBreakerOptions, ResilienceOptions, RpcStatus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stub client that plays back scripted responses, then succeeds.
#[derive(Clone, Default)]
pub struct ScriptedUsers {
    script: Arc<Mutex<VecDeque<Result<String, RpcStatus>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedUsers {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<String, RpcStatus>>,
    {
        Self { script: Arc::new(Mutex::new(script.into_iter().collect())), calls: Arc::default() }
    }

    /// Stub that fails every call with `status`.
    pub fn always(status: RpcStatus) -> Self {
        Self::new(std::iter::repeat(Err(status)).take(1_000))
    }

    pub async fn get_user(&mut self, id: u64) -> Result<String, RpcStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("user-{id}")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn unavailable() -> Result<String, RpcStatus> {
    Err(RpcStatus::unavailable("connection refused"))
}

/// Options with short delays and a breaker that stays out of the way unless
/// a test configures its own.
pub fn fast_options() -> ResilienceOptions {
    ResilienceOptions::default()
        .timeout(Duration::from_secs(1))
        .retry_delays(Duration::from_millis(10), Duration::from_millis(80))
        .breaker(CircuitBreakerOptions::default().failure_threshold(100).error_rate(0, 50.0))
}
