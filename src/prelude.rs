//! Convenient re-exports for wrapping RPC clients.
pub use crate::{
    circuit_breaker::{CircuitBreakerMetrics, CircuitBreakerState, CircuitState},
    classify::{codes, RpcError, RpcStatus},
    error::{ErrorKind, NormalizedError},
    interceptor::ResilientClient,
    jitter::Jitter,
    layer::ResilienceLayer,
    options::{CircuitBreakerOptions, ResilienceOptions},
    pipeline::CallPipeline,
    resilient_client,
};
