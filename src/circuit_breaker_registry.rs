//! Registry of per-endpoint circuit breakers.
//!
//! One breaker per `"{service}.{method}"` key for the registry's lifetime,
//! even when the first calls to an endpoint race. Breakers share the
//! registry's live [`DynamicConfig`], so option updates reach existing
//! breakers without rebuilding them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerState, FailurePredicate,
};
use crate::clock::{Clock, MonotonicClock};
use crate::dynamic_config::DynamicConfig;
use crate::options::CircuitBreakerOptions;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No breaker has been created for this endpoint.
    #[error("circuit breaker '{key}' not found")]
    NotFound { key: String },
}

/// Registry key for an endpoint.
pub fn endpoint_key(service: &str, method: &str) -> String {
    format!("{service}.{method}")
}

/// In-memory registry backed by an `RwLock`.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: DynamicConfig<CircuitBreakerOptions>,
    clock: Arc<dyn Clock>,
    predicate: Option<FailurePredicate>,
    disposed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: DynamicConfig<CircuitBreakerOptions>) -> Arc<Self> {
        Self::with_parts(config, Arc::new(MonotonicClock::default()), None)
    }

    /// Registry with an explicit clock and failure predicate. Without a
    /// predicate each breaker counts failures per `expected_errors`.
    ///
    /// Spawns the sample sweeper when called inside a tokio runtime.
    pub fn with_parts(
        config: DynamicConfig<CircuitBreakerOptions>,
        clock: Arc<dyn Clock>,
        predicate: Option<FailurePredicate>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            clock,
            predicate,
            disposed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });
        let sweeper = Self::spawn_sweeper(&registry);
        *registry.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = sweeper;
        registry
    }

    fn spawn_sweeper(registry: &Arc<Self>) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Self> = Arc::downgrade(registry);
        Some(handle.spawn(async move {
            loop {
                let period = match weak.upgrade() {
                    Some(registry) => registry.config.get().monitoring_period,
                    None => break,
                };
                tokio::time::sleep(period.max(Duration::from_millis(1))).await;
                let Some(registry) = weak.upgrade() else { break };
                let purged = registry.purge_expired();
                if purged > 0 {
                    tracing::trace!(purged, "purged expired breaker samples");
                }
            }
        }))
    }

    /// Live breaker configuration shared by every breaker in this registry.
    pub fn config(&self) -> &DynamicConfig<CircuitBreakerOptions> {
        &self.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Breaker for the endpoint, created on first use. `None` when breaking
    /// is disabled or the registry has been disposed.
    pub fn get_or_create(&self, service: &str, method: &str) -> Option<Arc<CircuitBreaker>> {
        if self.is_disposed() || !self.config.get().enabled {
            return None;
        }
        let key = endpoint_key(service, method);
        if let Some(existing) = self.read().get(&key) {
            return Some(existing.clone());
        }

        let candidate = Arc::new(CircuitBreaker::with_shared_config(
            key.clone(),
            self.config.clone(),
            self.clock.clone(),
            self.predicate.clone(),
        ));

        let mut map = self.write();
        if self.is_disposed() {
            return None;
        }
        let winner = map.entry(key.clone()).or_insert_with(|| candidate.clone()).clone();
        if Arc::ptr_eq(&winner, &candidate) {
            debug!(endpoint = %key, "circuit breaker created");
        } else {
            debug!(endpoint = %key, "lost breaker creation race; using existing breaker");
        }
        Some(winner)
    }

    pub fn get(&self, service: &str, method: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(&endpoint_key(service, method)).cloned()
    }

    pub fn state(&self, service: &str, method: &str) -> Option<CircuitBreakerState> {
        self.get(service, method).map(|b| b.state())
    }

    pub fn metrics(&self, service: &str, method: &str) -> Option<CircuitBreakerMetrics> {
        self.get(service, method).map(|b| b.metrics())
    }

    /// Reset a breaker by endpoint, erroring if it was never created.
    pub fn reset(&self, service: &str, method: &str) -> Result<(), RegistryError> {
        match self.get(service, method) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { key: endpoint_key(service, method) }),
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Breaker states sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerState)> {
        let mut entries: Vec<(String, CircuitBreakerState)> =
            self.read().iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop expired samples from every breaker; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let breakers: Vec<_> = self.read().values().cloned().collect();
        breakers.iter().map(|b| b.purge_expired()).sum()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop the sweeper and drop every breaker. Calls already holding a
    /// breaker finish against it; new lookups return `None`. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }
        let dropped = {
            let mut map = self.write();
            let n = map.len();
            map.clear();
            n
        };
        info!(breakers = dropped, "circuit breaker registry disposed");
    }
}

impl Drop for CircuitBreakerRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner).take()
        {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::classify::RpcStatus;
    use crate::clock::ManualClock;
    use crate::error::ResilienceError;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn registry(opts: CircuitBreakerOptions, clock: &ManualClock) -> Arc<CircuitBreakerRegistry> {
        CircuitBreakerRegistry::with_parts(DynamicConfig::new(opts), Arc::new(clock.clone()), None)
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(RpcStatus::unavailable("down"))) })
            .await;
    }

    #[test]
    fn same_endpoint_yields_same_breaker() {
        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::default(), &clock);
        let a = reg.get_or_create("users", "GetUser").unwrap();
        let b = reg.get_or_create("users", "GetUser").unwrap();
        let c = reg.get_or_create("users", "ListUsers").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.endpoint(), "users.GetUser");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn disabled_breaking_yields_none() {
        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::disabled(), &clock);
        assert!(reg.get_or_create("users", "GetUser").is_none());
        assert!(reg.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_creates_one_breaker() {
        let reg = CircuitBreakerRegistry::new(DynamicConfig::new(CircuitBreakerOptions::default()));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                reg.get_or_create("orders", "Place").unwrap()
            }));
        }
        let mut breakers = Vec::new();
        for h in handles {
            breakers.push(h.await.unwrap());
        }
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn reset_unknown_endpoint_errors() {
        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::default(), &clock);
        let err = reg.reset("users", "Nope").unwrap_err();
        assert_eq!(err, RegistryError::NotFound { key: "users.Nope".into() });
        assert!(err.to_string().contains("users.Nope"));
    }

    #[tokio::test]
    async fn reset_and_snapshot() {
        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::default().failure_threshold(1), &clock);
        let b = reg.get_or_create("svc", "b").unwrap();
        let _a = reg.get_or_create("svc", "a").unwrap();
        fail(&b).await;
        assert_eq!(reg.state("svc", "b").unwrap().state, CircuitState::Open);

        let snapshot = reg.snapshot();
        let keys: Vec<_> = snapshot.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["svc.a", "svc.b"]);
        assert_eq!(snapshot[1].1.state, CircuitState::Open);

        reg.reset("svc", "b").unwrap();
        assert_eq!(reg.state("svc", "b").unwrap().state, CircuitState::Closed);
        assert_eq!(reg.metrics("svc", "b").unwrap().failed_requests, 1);

        fail(&b).await;
        reg.reset_all();
        assert!(reg.snapshot().iter().all(|(_, s)| s.state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn live_config_reaches_existing_breakers() {
        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::default().failure_threshold(10).error_rate(0, 50.0), &clock);
        let b = reg.get_or_create("svc", "m").unwrap();
        reg.config().update(|c| c.clone().failure_threshold(1));
        fail(&b).await;
        assert_eq!(b.state().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn expected_errors_build_the_default_predicate() {
        let clock = ManualClock::new();
        let opts = CircuitBreakerOptions::default().failure_threshold(1).expected_errors(["timeout"]);
        let reg = registry(opts, &clock);
        let b = reg.get_or_create("svc", "m").unwrap();
        fail(&b).await;
        assert_eq!(b.state().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn expected_errors_are_read_live() {
        let clock = ManualClock::new();
        let opts = CircuitBreakerOptions::default()
            .failure_threshold(1)
            .error_rate(0, 50.0)
            .expected_errors(["timeout"]);
        let reg = registry(opts, &clock);
        let b = reg.get_or_create("svc", "m").unwrap();
        fail(&b).await;
        assert_eq!(b.state().failure_count, 0);

        reg.config().update(|c| c.clone().expected_errors(Vec::<String>::new()));
        fail(&b).await;
        assert_eq!(b.state().state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_samples() {
        let clock = ManualClock::new();
        let opts = CircuitBreakerOptions::default().monitoring_period(Duration::from_millis(1_000));
        let reg = registry(opts, &clock);
        let b = reg.get_or_create("svc", "m").unwrap();
        fail(&b).await;
        clock.advance(5_000);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(b.purge_expired(), 0, "sweeper should already have purged the sample");
        assert_eq!(b.metrics().failed_requests, 1);
    }

    #[tokio::test]
    async fn dispose_clears_and_blocks_creation() {
        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::default(), &clock);
        let held = reg.get_or_create("svc", "m").unwrap();
        reg.dispose();
        reg.dispose();
        assert!(reg.is_disposed());
        assert!(reg.is_empty());
        assert!(reg.get_or_create("svc", "m").is_none());
        // Holders keep a working breaker.
        assert_eq!(held.state().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn transitions_are_logged_with_endpoint() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_max_level(tracing::Level::DEBUG)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new();
        let reg = registry(CircuitBreakerOptions::default().failure_threshold(1), &clock);
        let b = reg.get_or_create("billing", "Charge").unwrap();
        fail(&b).await;
        reg.dispose();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("circuit breaker created"));
        assert!(logs.contains("circuit breaker → open"));
        assert!(logs.contains("billing.Charge"));
        assert!(logs.contains("circuit breaker registry disposed"));
    }
}
