//! The call pipeline: timeout, circuit admission, retry with backoff, and
//! normalization, applied to one logical RPC call.
//!
//! ```text
//! execute(method, op)
//!   loop:
//!     breaker.execute(|| timeout(op()))      // CircuitOpen short-circuits
//!     Ok            -> return value
//!     Err           -> classify
//!       not retryable / out of retries -> normalize, return
//!       retryable  -> sleep(jitter(backoff(n))), n += 1
//! ```
//!
//! Each call reads one options snapshot at start; `update_options` affects
//! later calls only.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerState, FailurePredicate};
use crate::circuit_breaker_registry::{endpoint_key, CircuitBreakerRegistry, RegistryError};
use crate::classify::{ErrorClassifier, RpcError};
use crate::clock::{Clock, MonotonicClock};
use crate::dynamic_config::DynamicConfig;
use crate::error::{NormalizedError, ResilienceError};
use crate::normalize::Normalizer;
use crate::options::{OptionsError, ResilienceOptions};
use crate::redact::Redactor;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Everything derived from one options value.
#[derive(Debug)]
struct Policies {
    options: ResilienceOptions,
    backoff: Backoff,
    classifier: ErrorClassifier,
    normalizer: Normalizer,
}

impl Policies {
    fn build(options: ResilienceOptions) -> Result<Self, OptionsError> {
        options.validate()?;
        Ok(Self {
            backoff: options.backoff()?,
            classifier: ErrorClassifier::new(options.retryable_codes.iter().copied()),
            normalizer: Normalizer::new(Redactor::new(&options.redact_fields)),
            options,
        })
    }
}

/// Resilience pipeline for the methods of one logical service.
#[derive(Debug, Clone)]
pub struct CallPipeline {
    service: Arc<str>,
    policies: DynamicConfig<Policies>,
    registry: Arc<CircuitBreakerRegistry>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    predicate: Option<FailurePredicate>,
    shared_registry: bool,
}

impl CallPipeline {
    /// Build a pipeline with its own breaker registry.
    ///
    /// # Errors
    /// Returns `OptionsError` when `options` fails validation.
    pub fn new(service: impl Into<String>, options: ResilienceOptions) -> Result<Self, OptionsError> {
        let breaker = options.breaker.clone();
        let policies = Policies::build(options)?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Ok(Self {
            service: Arc::from(service.into()),
            policies: DynamicConfig::new(policies),
            registry: CircuitBreakerRegistry::with_parts(DynamicConfig::new(breaker), clock.clone(), None),
            sleeper: Arc::new(TokioSleeper),
            clock,
            predicate: None,
            shared_registry: false,
        })
    }

    /// Share an existing registry. Breaker options, clock and failure
    /// predicate then come from the registry, and `update_options` writes
    /// through to its live config.
    pub fn with_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = registry;
        self.shared_registry = true;
        self
    }

    /// Replace how backoff delays are awaited.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Use `clock` for breaker timing. Rebuilds the owned registry; a shared
    /// registry keeps its own clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.rebuild_registry();
        self
    }

    /// Decide which failures count toward opening breakers. Rebuilds the
    /// owned registry; a shared registry keeps its own predicate.
    pub fn with_failure_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.predicate = Some(predicate);
        self.rebuild_registry();
        self
    }

    fn rebuild_registry(&mut self) {
        if self.shared_registry {
            tracing::warn!(
                service = %self.service,
                "pipeline uses a shared breaker registry; clock and failure predicate left unchanged"
            );
            return;
        }
        let config = self.registry.config().clone();
        self.registry =
            CircuitBreakerRegistry::with_parts(config, self.clock.clone(), self.predicate.clone());
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `operation` under the full policy stack.
    ///
    /// `operation` is invoked once per attempt and must produce a fresh
    /// future each time.
    ///
    /// # Errors
    /// Every failure is returned as a [`NormalizedError`]: the last upstream
    /// error once retries are exhausted or a non-retryable code is seen, a
    /// deadline error, a circuit-open rejection, or a disposed-client error.
    pub async fn execute<T, E, Fut, Op>(&self, method: &str, mut operation: Op) -> Result<T, NormalizedError>
    where
        E: RpcError,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let policies = self.policies.get();
        if self.registry.is_disposed() {
            return Err(policies.normalizer.normalize(ResilienceError::<E>::Disposed));
        }
        let endpoint = endpoint_key(&self.service, method);
        let breaker = self.registry.get_or_create(&self.service, method);
        let timeout = policies.options.timeout;
        let max_retries = policies.options.max_retries;

        let mut retries = 0usize;
        loop {
            let err = match Self::attempt(breaker.as_deref(), timeout, &mut operation).await {
                Ok(value) => {
                    if retries > 0 {
                        tracing::debug!(endpoint = %endpoint, retries, "rpc succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = policies.classifier.classify(&err);
            if !class.retryable {
                tracing::debug!(endpoint = %endpoint, code = class.code, error = %err, "rpc failed; not retryable");
                return Err(policies.normalizer.normalize(err));
            }
            if retries >= max_retries {
                if max_retries > 0 {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempts = retries + 1,
                        code = class.code,
                        error = %err,
                        "rpc retries exhausted"
                    );
                }
                return Err(policies.normalizer.normalize(err));
            }
            if self.registry.is_disposed() {
                return Err(policies.normalizer.normalize(err));
            }

            let delay = policies.options.jitter.apply(policies.backoff.delay(retries));
            tracing::debug!(
                endpoint = %endpoint,
                attempt = retries + 1,
                max_retries,
                code = class.code,
                delay_ms = delay.as_millis() as u64,
                "retrying rpc"
            );
            self.sleeper.sleep(delay).await;
            if self.registry.is_disposed() {
                tracing::debug!(endpoint = %endpoint, "client disposed during backoff; not retrying");
                return Err(policies.normalizer.normalize(err));
            }
            retries += 1;
        }
    }

    async fn attempt<T, E, Fut, Op>(
        breaker: Option<&CircuitBreaker>,
        timeout: Duration,
        operation: &mut Op,
    ) -> Result<T, ResilienceError<E>>
    where
        E: RpcError,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        match breaker {
            Some(breaker) => breaker.execute(|| Self::timed(timeout, operation())).await,
            None => Self::timed(timeout, operation()).await,
        }
    }

    async fn timed<T, E, Fut>(timeout: Duration, call: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if timeout.is_zero() {
            return call.await.map_err(ResilienceError::Inner);
        }
        let start = Instant::now();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(ResilienceError::Inner),
            Err(_) => Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout }),
        }
    }

    pub fn state(&self, method: &str) -> Option<CircuitBreakerState> {
        self.registry.state(&self.service, method)
    }

    pub fn metrics(&self, method: &str) -> Option<CircuitBreakerMetrics> {
        self.registry.metrics(&self.service, method)
    }

    pub fn reset(&self, method: &str) -> Result<(), RegistryError> {
        self.registry.reset(&self.service, method)
    }

    /// Normalizer built from the current redaction settings.
    pub fn normalizer(&self) -> Normalizer {
        self.policies.get().normalizer.clone()
    }

    /// Current options snapshot.
    pub fn options(&self) -> ResilienceOptions {
        self.policies.get().options.clone()
    }

    /// Apply `change` to a copy of the current options and swap it in.
    /// Existing breakers pick up the new breaker section immediately.
    ///
    /// # Errors
    /// Leaves the current options untouched when the result fails validation.
    pub fn update_options<F>(&self, change: F) -> Result<(), OptionsError>
    where
        F: FnOnce(&mut ResilienceOptions),
    {
        let mut next = self.options();
        change(&mut next);
        let breaker = next.breaker.clone();
        let policies = Policies::build(next)?;
        self.policies.set(policies);
        self.registry.config().set(breaker);
        tracing::info!(service = %self.service, "resilience options updated");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Stop background work and reject further calls.
    pub fn dispose(&self) {
        self.registry.dispose();
    }
}
