//! Tower integration: wrap any `Service` (a tonic channel, a hand-built
//! client service) so each request runs through a [`CallPipeline`].
//!
//! The endpoint of each request comes from a method extractor, so one layer
//! can sit in front of a channel serving many RPCs:
//!
//! ```rust
//! use ninelives_rpc::{CallPipeline, ResilienceLayer, ResilienceOptions, RpcStatus};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pipeline = CallPipeline::new("kv.v1.Store", ResilienceOptions::default()).unwrap();
//! let layer = ResilienceLayer::new(pipeline, |req: &(String, u32)| req.0.clone());
//! let svc = layer.layer(service_fn(|(_, n): (String, u32)| async move { Ok::<_, RpcStatus>(n * 2) }));
//! let out = svc.oneshot(("Get".to_string(), 21)).await.unwrap();
//! assert_eq!(out, 42);
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

use crate::classify::RpcError;
use crate::error::NormalizedError;
use crate::pipeline::CallPipeline;

/// Layer applying a [`CallPipeline`] to every request.
pub struct ResilienceLayer<F> {
    pipeline: CallPipeline,
    method_of: Arc<F>,
}

impl<F> ResilienceLayer<F> {
    /// `method_of` names the RPC a request targets.
    pub fn new(pipeline: CallPipeline, method_of: F) -> Self {
        Self { pipeline, method_of: Arc::new(method_of) }
    }

    pub fn pipeline(&self) -> &CallPipeline {
        &self.pipeline
    }
}

impl<F> Clone for ResilienceLayer<F> {
    fn clone(&self) -> Self {
        Self { pipeline: self.pipeline.clone(), method_of: self.method_of.clone() }
    }
}

impl<F> fmt::Debug for ResilienceLayer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceLayer").field("pipeline", &self.pipeline).finish_non_exhaustive()
    }
}

impl<S, F> Layer<S> for ResilienceLayer<F> {
    type Service = ResilienceService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        ResilienceService {
            inner: service,
            pipeline: self.pipeline.clone(),
            method_of: self.method_of.clone(),
        }
    }
}

/// Service produced by [`ResilienceLayer`].
///
/// Each attempt drives a clone of the inner service through `oneshot`, so
/// readiness is awaited per attempt and `poll_ready` always succeeds.
pub struct ResilienceService<S, F> {
    inner: S,
    pipeline: CallPipeline,
    method_of: Arc<F>,
}

impl<S: Clone, F> Clone for ResilienceService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pipeline: self.pipeline.clone(),
            method_of: self.method_of.clone(),
        }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for ResilienceService<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceService")
            .field("inner", &self.inner)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl<S, F> ResilienceService<S, F> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn pipeline(&self) -> &CallPipeline {
        &self.pipeline
    }
}

impl<S, F, Req> Service<Req> for ResilienceService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: RpcError,
    F: Fn(&Req) -> String,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = NormalizedError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let method = (self.method_of)(&req);
        let pipeline = self.pipeline.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            let attempt = move || inner.clone().oneshot(req.clone());
            pipeline.execute(&method, attempt).await
        })
    }
}
