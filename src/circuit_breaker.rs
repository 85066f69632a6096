//! Per-endpoint circuit breaker with a rolling sample window.
//!
//! State machine (no terminal state):
//! - **Closed**: calls pass. Counted failures increment `failure_count`; at
//!   `failure_threshold` (or when the window's error rate trips) the breaker
//!   opens for `recovery_timeout`.
//! - **Open**: calls fail fast with [`ResilienceError::CircuitOpen`] until
//!   `next_attempt_at`; the first call after that moves to half-open.
//! - **HalfOpen**: a single probe is admitted. Success closes the breaker and
//!   clears the count; failure is handled like a closed-state failure, and
//!   since the count survives the open period it reopens immediately.
//!
//! Every mutation happens inside one short critical section, so the counters
//! and the sample list never interleave. A call whose future is dropped
//! before it settles records nothing.

use crate::classify::RpcError;
use crate::clock::{Clock, MonotonicClock};
use crate::dynamic_config::DynamicConfig;
use crate::error::ResilienceError;
use crate::options::CircuitBreakerOptions;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the recovery timeout elapses.
    Open,
    /// One probe call is testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Snapshot of a breaker's state machine. Owned copy; mutating it has no
/// effect on the breaker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u64,
    /// Clock millis before which an open breaker rejects calls.
    pub next_attempt_at: u64,
    pub last_failure_at: Option<u64>,
}

/// Snapshot of a breaker's counters.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CircuitBreakerMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls rejected without being attempted.
    pub rejected_requests: u64,
    pub circuit_open_count: u64,
    /// Mean response time over the rolling window, as of the last sample.
    pub average_response_time_ms: f64,
    pub window_requests: u64,
    pub window_failures: u64,
}

impl CircuitBreakerMetrics {
    /// Failed share of the rolling window, 0.0 when it is empty.
    pub fn error_rate(&self) -> f64 {
        if self.window_requests == 0 {
            0.0
        } else {
            self.window_failures as f64 / self.window_requests as f64
        }
    }
}

/// One completed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestSample {
    pub timestamp_ms: u64,
    pub succeeded: bool,
    pub response_time_ms: f64,
}

/// Decides which failures count toward opening the breaker.
#[derive(Clone)]
pub struct FailurePredicate(Arc<dyn Fn(&dyn RpcError) -> bool + Send + Sync>);

impl FailurePredicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn RpcError) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Every failure counts.
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Only failures whose message contains one of `substrings` count.
    /// An empty list counts everything.
    pub fn message_contains<I, S>(substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let needles: Vec<String> = substrings.into_iter().map(Into::into).collect();
        if needles.is_empty() {
            return Self::all();
        }
        Self::new(move |err| message_matches(&needles, err))
    }

    pub fn counts(&self, err: &dyn RpcError) -> bool {
        (self.0)(err)
    }
}

// An empty list matches everything.
fn message_matches(needles: &[String], err: &dyn RpcError) -> bool {
    if needles.is_empty() {
        return true;
    }
    let message = err.to_string();
    needles.iter().any(|n| message.contains(n.as_str()))
}

impl std::fmt::Debug for FailurePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FailurePredicate(<fn>)")
    }
}

impl Default for FailurePredicate {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u64,
    next_attempt_at: u64,
    last_failure_at: Option<u64>,
    probe_in_flight: bool,
    samples: VecDeque<RequestSample>,
    metrics: CircuitBreakerMetrics,
}

enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: DynamicConfig<CircuitBreakerOptions>,
    clock: Arc<dyn Clock>,
    // `None` counts failures per the live `expected_errors`.
    predicate: Option<FailurePredicate>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Breaker with its own (static) configuration and a monotonic clock.
    ///
    /// # Examples
    /// ```
    /// use ninelives_rpc::{CircuitBreaker, CircuitBreakerOptions, CircuitState};
    /// let breaker = CircuitBreaker::new("users.GetUser", CircuitBreakerOptions::default());
    /// assert_eq!(breaker.state().state, CircuitState::Closed);
    /// ```
    pub fn new(endpoint: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self::with_shared_config(
            endpoint,
            DynamicConfig::new(options),
            Arc::new(MonotonicClock::default()),
            None,
        )
    }

    /// Breaker reading live configuration from a shared handle. Without a
    /// predicate, failures are counted per the current `expected_errors`.
    pub fn with_shared_config(
        endpoint: impl Into<String>,
        config: DynamicConfig<CircuitBreakerOptions>,
        clock: Arc<dyn Clock>,
        predicate: Option<FailurePredicate>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            endpoint: endpoint.into(),
            config,
            clock,
            predicate,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt_at: now,
                last_failure_at: None,
                probe_in_flight: false,
                samples: VecDeque::new(),
                metrics: CircuitBreakerMetrics::default(),
            }),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        let now = self.clock.now_millis();
        self.lock().next_attempt_at = now;
        self
    }

    /// Override which failures count toward the threshold.
    pub fn with_failure_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` under breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` without invoking `operation`
    /// while the breaker is open (or a probe is already in flight).
    /// Otherwise returns the operation's own error unchanged.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        E: RpcError,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let admission = self.admit::<E>()?;

        // Releases the probe slot if this future is dropped mid-call.
        struct ProbeGuard<'a> {
            breaker: &'a CircuitBreaker,
            armed: bool,
        }
        impl Drop for ProbeGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.breaker.lock().probe_in_flight = false;
                }
            }
        }
        let probe = matches!(admission, Admission::Probe);
        let mut guard = ProbeGuard { breaker: self, armed: probe };

        let started = Instant::now();
        let result = operation().await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
        guard.armed = false;

        match &result {
            Ok(_) => self.settle_success(response_time_ms, probe),
            Err(e) => self.settle_failure(e, response_time_ms, probe),
        }
        result
    }

    fn admit<E>(&self) -> Result<Admission, ResilienceError<E>> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.metrics.total_requests += 1;
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open if now >= inner.next_attempt_at => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::info!(endpoint = %self.endpoint, "circuit breaker → half-open");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::debug!(endpoint = %self.endpoint, "circuit breaker: half-open probe");
                Ok(Admission::Probe)
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.metrics.rejected_requests += 1;
                let retry_after = inner.next_attempt_at.saturating_sub(now);
                Err(ResilienceError::CircuitOpen {
                    endpoint: self.endpoint.clone(),
                    failure_count: inner.failure_count,
                    retry_after: Duration::from_millis(retry_after),
                })
            }
        }
    }

    /// Record a successful attempt that did not go through [`execute`](Self::execute).
    /// While half-open it is treated as the probe outcome.
    pub fn record_success(&self, response_time_ms: f64) {
        self.settle_success(response_time_ms, true);
    }

    /// Record a failed attempt that did not go through [`execute`](Self::execute).
    /// While half-open it is treated as the probe outcome.
    pub fn record_failure(&self, err: &dyn RpcError, response_time_ms: f64) {
        self.settle_failure(err, response_time_ms, true);
    }

    // Only the probe's own outcome moves a half-open breaker; a call admitted
    // earlier while closed just adds its sample.
    fn settle_success(&self, response_time_ms: f64, probe: bool) {
        let now = self.clock.now_millis();
        let window = self.config.get().monitoring_period;
        let mut inner = self.lock();
        inner.metrics.successful_requests += 1;
        Self::push_sample(&mut inner, now, window, true, response_time_ms);

        if probe && inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.probe_in_flight = false;
            tracing::info!(endpoint = %self.endpoint, "circuit breaker → closed");
        }
    }

    fn settle_failure(&self, err: &dyn RpcError, response_time_ms: f64, probe: bool) {
        let now = self.clock.now_millis();
        let config = self.config.get();
        let counted = match &self.predicate {
            Some(predicate) => predicate.counts(err),
            None => message_matches(&config.expected_errors, err),
        };
        let mut inner = self.lock();
        inner.metrics.failed_requests += 1;
        inner.last_failure_at = Some(now);
        Self::push_sample(&mut inner, now, config.monitoring_period, false, response_time_ms);

        if probe && inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.probe_in_flight = false;
            tracing::warn!(endpoint = %self.endpoint, error = %err, "circuit breaker: probe failed");
        }
        if !counted {
            tracing::debug!(endpoint = %self.endpoint, error = %err, "failure not counted by breaker");
            return;
        }
        inner.failure_count += 1;
        if inner.state != CircuitState::Closed {
            return;
        }

        let threshold_hit = inner.failure_count >= config.failure_threshold;
        let rate_hit = Self::error_rate_tripped(&inner, &config);
        if threshold_hit || rate_hit {
            inner.state = CircuitState::Open;
            let recovery_ms = u64::try_from(config.recovery_timeout.as_millis()).unwrap_or(u64::MAX);
            inner.next_attempt_at = now.saturating_add(recovery_ms);
            inner.metrics.circuit_open_count += 1;
            tracing::error!(
                endpoint = %self.endpoint,
                failures = inner.failure_count,
                threshold = config.failure_threshold,
                rate_tripped = rate_hit && !threshold_hit,
                "circuit breaker → open"
            );
        }
    }

    fn error_rate_tripped(inner: &BreakerInner, config: &CircuitBreakerOptions) -> bool {
        let volume = inner.samples.len() as u64;
        if config.volume_threshold == 0 || volume < config.volume_threshold {
            return false;
        }
        let failures = inner.samples.iter().filter(|s| !s.succeeded).count() as f64;
        failures * 100.0 / volume as f64 >= config.error_threshold_percentage
    }

    fn push_sample(
        inner: &mut BreakerInner,
        now: u64,
        window: Duration,
        succeeded: bool,
        response_time_ms: f64,
    ) {
        inner.samples.push_back(RequestSample { timestamp_ms: now, succeeded, response_time_ms });
        Self::prune(&mut inner.samples, now, window);
        let n = inner.samples.len();
        inner.metrics.average_response_time_ms = if n == 0 {
            0.0
        } else {
            inner.samples.iter().map(|s| s.response_time_ms).sum::<f64>() / n as f64
        };
    }

    fn prune(samples: &mut VecDeque<RequestSample>, now: u64, window: Duration) {
        let cutoff = now.saturating_sub(window.as_millis() as u64);
        while samples.front().is_some_and(|s| s.timestamp_ms <= cutoff && s.timestamp_ms < now) {
            samples.pop_front();
        }
    }

    /// Samples newer than `now - monitoring_period`.
    pub fn recent_samples(&self) -> Vec<RequestSample> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(self.config.get().monitoring_period.as_millis() as u64);
        self.lock()
            .samples
            .iter()
            .filter(|s| s.timestamp_ms > cutoff || s.timestamp_ms == now)
            .copied()
            .collect()
    }

    /// Drop samples that fell out of the window. Leaves computed metrics alone.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let window = self.config.get().monitoring_period;
        let mut inner = self.lock();
        let before = inner.samples.len();
        Self::prune(&mut inner.samples, now, window);
        before - inner.samples.len()
    }

    /// Force the breaker closed and clear the failure count.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_attempt_at = now;
        inner.probe_in_flight = false;
        tracing::info!(endpoint = %self.endpoint, "circuit breaker reset");
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            next_attempt_at: inner.next_attempt_at,
            last_failure_at: inner.last_failure_at,
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let recent = self.recent_samples();
        let mut metrics = self.lock().metrics.clone();
        metrics.window_requests = recent.len() as u64;
        metrics.window_failures = recent.iter().filter(|s| !s.succeeded).count() as u64;
        metrics
    }
}
