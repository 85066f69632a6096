#![forbid(unsafe_code)]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Nine Lives RPC
//!
//! Resilient RPC clients for async Rust. Every call made through a wrapped
//! client stub gets:
//!
//! - **Timeouts** per attempt, reported as `DEADLINE_EXCEEDED`
//! - **Retries** with exponential backoff for configured transient status codes
//! - **Circuit breakers** per `service.method`, with single-probe half-open recovery
//! - **Normalized errors**: one [`NormalizedError`] shape with redacted details
//!
//! ## Quick Start
//!
//! ```rust
//! use ninelives_rpc::{CircuitBreakerOptions, ResilienceOptions, ResilientClient, RpcStatus};
//! use std::time::Duration;
//!
//! #[derive(Clone)]
//! struct Greeter;
//! impl Greeter {
//!     async fn say_hello(&mut self, name: String) -> Result<String, RpcStatus> {
//!         Ok(format!("hello {name}"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ResilienceOptions::default()
//!         .timeout(Duration::from_secs(2))
//!         .max_retries(2)
//!         .breaker(CircuitBreakerOptions::default().failure_threshold(3));
//!     let client = ResilientClient::new("helloworld.Greeter", Greeter, options).unwrap();
//!
//!     let reply = client
//!         .call("SayHello", |mut c| async move { c.say_hello("ada".into()).await })
//!         .await;
//!     assert_eq!(reply.unwrap(), "hello ada");
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod classify;
pub mod clock;
pub mod dynamic_config;
pub mod error;
pub mod interceptor;
pub mod jitter;
pub mod layer;
pub mod normalize;
pub mod options;
pub mod pipeline;
pub mod prelude;
pub mod redact;
pub mod sleeper;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerState, CircuitState, FailurePredicate,
    RequestSample,
};
pub use circuit_breaker_registry::{endpoint_key, CircuitBreakerRegistry, RegistryError};
pub use classify::{codes, Classification, ErrorClassifier, RpcError, RpcStatus, StatusCode};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use dynamic_config::DynamicConfig;
pub use error::{ErrorKind, NormalizedError, ResilienceError};
pub use interceptor::{NormalizedStream, ResilientClient};
pub use jitter::Jitter;
pub use layer::{ResilienceLayer, ResilienceService};
pub use normalize::Normalizer;
pub use options::{CircuitBreakerOptions, OptionsError, ResilienceOptions};
pub use pipeline::CallPipeline;
pub use redact::{RedactionError, Redactor};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
