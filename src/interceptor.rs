//! Client-side interception: route every RPC of a client stub through a
//! [`CallPipeline`] without changing how callers invoke it.
//!
//! Two forms live here. [`ResilientClient`] wraps any cloneable stub and takes
//! the call as a closure. [`resilient_client!`](crate::resilient_client)
//! generates a named wrapper type with one async method per RPC. For
//! `tower::Service` stacks see [`ResilienceLayer`](crate::ResilienceLayer).
//!
//! ```rust
//! use ninelives_rpc::{ResilienceOptions, ResilientClient, RpcStatus};
//!
//! #[derive(Clone)]
//! struct Users;
//! impl Users {
//!     async fn get_user(&mut self, id: u64) -> Result<String, RpcStatus> {
//!         Ok(format!("user-{id}"))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = ResilientClient::new("users.v1.Users", Users, ResilienceOptions::default()).unwrap();
//! let name = client.call("GetUser", |mut c| async move { c.get_user(7).await }).await.unwrap();
//! assert_eq!(name, "user-7");
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project::pin_project;

use crate::circuit_breaker::{CircuitBreakerMetrics, CircuitBreakerState};
use crate::circuit_breaker_registry::RegistryError;
use crate::classify::RpcError;
use crate::error::NormalizedError;
use crate::normalize::Normalizer;
use crate::options::{OptionsError, ResilienceOptions};
use crate::pipeline::CallPipeline;

/// A client stub whose calls run through a resilience pipeline.
#[derive(Debug, Clone)]
pub struct ResilientClient<C> {
    inner: C,
    pipeline: CallPipeline,
}

impl<C: Clone> ResilientClient<C> {
    /// Wrap `client`, naming breakers `"{service}.{method}"`.
    ///
    /// # Errors
    /// Returns `OptionsError` when `options` fails validation.
    pub fn new(
        service: impl Into<String>,
        client: C,
        options: ResilienceOptions,
    ) -> Result<Self, OptionsError> {
        Ok(Self { inner: client, pipeline: CallPipeline::new(service, options)? })
    }

    /// Wrap `client` with an already configured pipeline.
    pub fn with_pipeline(client: C, pipeline: CallPipeline) -> Self {
        Self { inner: client, pipeline }
    }

    /// The wrapped stub, for anything that is not an RPC.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    pub fn pipeline(&self) -> &CallPipeline {
        &self.pipeline
    }

    /// Run a unary call. `call` gets a fresh clone of the stub per attempt.
    pub async fn call<T, E, Fut, F>(&self, method: &str, mut call: F) -> Result<T, NormalizedError>
    where
        E: RpcError,
        Fut: Future<Output = Result<T, E>>,
        F: FnMut(C) -> Fut,
    {
        let inner = &self.inner;
        self.pipeline.execute(method, || call(inner.clone())).await
    }

    /// Run a server-streaming call. Establishing the stream goes through the
    /// pipeline (timeout, breaker, retry); errors yielded by the stream
    /// afterwards are normalized but not retried.
    pub async fn call_stream<S, Item, E, SE, Fut, F>(
        &self,
        method: &str,
        call: F,
    ) -> Result<NormalizedStream<S>, NormalizedError>
    where
        E: RpcError,
        SE: RpcError,
        S: Stream<Item = Result<Item, SE>>,
        Fut: Future<Output = Result<S, E>>,
        F: FnMut(C) -> Fut,
    {
        let stream = self.call(method, call).await?;
        Ok(NormalizedStream::new(stream, self.pipeline.normalizer()))
    }

    pub fn state(&self, method: &str) -> Option<CircuitBreakerState> {
        self.pipeline.state(method)
    }

    pub fn metrics(&self, method: &str) -> Option<CircuitBreakerMetrics> {
        self.pipeline.metrics(method)
    }

    pub fn reset(&self, method: &str) -> Result<(), RegistryError> {
        self.pipeline.reset(method)
    }

    pub fn update_options<F>(&self, change: F) -> Result<(), OptionsError>
    where
        F: FnOnce(&mut ResilienceOptions),
    {
        self.pipeline.update_options(change)
    }

    pub fn dispose(&self) {
        self.pipeline.dispose();
    }
}

/// Stream adapter that normalizes item errors.
#[pin_project]
#[derive(Debug)]
pub struct NormalizedStream<S> {
    #[pin]
    inner: S,
    normalizer: Normalizer,
}

impl<S> NormalizedStream<S> {
    pub fn new(inner: S, normalizer: Normalizer) -> Self {
        Self { inner, normalizer }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, T, E> Stream for NormalizedStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: RpcError,
{
    type Item = Result<T, NormalizedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(this.normalizer.normalize_upstream(&e)))),
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Generate a wrapper type that routes each listed RPC through a
/// [`ResilientClient`].
///
/// Each `fn` line names a method on the inner stub, its arguments, and its
/// `Result` type. Arguments must be `Clone` so retries can replay them; the
/// method name doubles as the endpoint name.
///
/// ```rust
/// use ninelives_rpc::{resilient_client, ResilienceOptions, RpcStatus};
///
/// #[derive(Clone)]
/// struct OrdersStub;
/// impl OrdersStub {
///     async fn place(&mut self, sku: String, qty: u32) -> Result<u64, RpcStatus> {
///         Ok(qty as u64 + sku.len() as u64)
///     }
/// }
///
/// resilient_client! {
///     pub struct Orders for OrdersStub as "shop.v1.Orders" {
///         fn place(sku: String, qty: u32) -> Result<u64, RpcStatus>;
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let orders = Orders::new(OrdersStub, ResilienceOptions::default()).unwrap();
/// assert_eq!(orders.place("abc".into(), 2).await.unwrap(), 5);
/// assert!(orders.resilience().state("place").is_some());
/// # }
/// ```
#[macro_export]
macro_rules! resilient_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident for $inner:ty as $service:literal {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> Result<$ok:ty, $err:ty> ;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            resilience: $crate::ResilientClient<$inner>,
        }

        #[allow(dead_code)]
        impl $name {
            $vis fn new(
                inner: $inner,
                options: $crate::ResilienceOptions,
            ) -> ::core::result::Result<Self, $crate::OptionsError> {
                ::core::result::Result::Ok(Self {
                    resilience: $crate::ResilientClient::new($service, inner, options)?,
                })
            }

            $vis fn from_client(resilience: $crate::ResilientClient<$inner>) -> Self {
                Self { resilience }
            }

            /// Breaker state, metrics and options for the wrapped stub.
            $vis fn resilience(&self) -> &$crate::ResilientClient<$inner> {
                &self.resilience
            }

            $(
                $(#[$method_meta])*
                $vis async fn $method(
                    &self,
                    $( $arg: $arg_ty ),*
                ) -> ::core::result::Result<$ok, $crate::NormalizedError> {
                    #[allow(unused_mut)]
                    let attempt = |mut client: $inner| {
                        $( let $arg = ::core::clone::Clone::clone(&$arg); )*
                        async move {
                            let result: ::core::result::Result<$ok, $err> =
                                client.$method($( $arg ),*).await;
                            result
                        }
                    };
                    self.resilience.call(stringify!($method), attempt).await
                }
            )*
        }
    };
}
