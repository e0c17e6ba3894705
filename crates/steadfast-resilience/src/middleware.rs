//! Call-wrapping primitives shared by every resilience layer.
//!
//! A [`Handler`] turns `(context, request)` into a response. A [`Middleware`]
//! wraps a handler with another handler. [`Chain`] composes middlewares
//! onion-style: the first middleware is the outermost one, so it runs first
//! on the way in and last on the way out.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::Result;

/// An asynchronous call from `(context, request)` to `response`.
#[async_trait]
pub trait Handler<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Performs the call.
    async fn call(&self, ctx: &CallContext, req: Req) -> Result<Resp>;
}

/// Shared, type-erased handler.
pub type BoxHandler<Req, Resp> = Arc<dyn Handler<Req, Resp>>;

/// Wraps a handler with additional behaviour.
pub trait Middleware<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Returns a handler that runs this middleware around `next`.
    fn wrap(&self, next: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp>;
}

/// Shared, type-erased middleware.
pub type BoxMiddleware<Req, Resp> = Arc<dyn Middleware<Req, Resp>>;

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler<Req, Resp> for FnHandler<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp>> + Send,
{
    async fn call(&self, ctx: &CallContext, req: Req) -> Result<Resp> {
        (self.f)(ctx.clone(), req).await
    }
}

/// Adapts an async closure into a [`BoxHandler`].
pub fn handler_fn<Req, Resp, F, Fut>(f: F) -> BoxHandler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Middleware backed by a closure over the next handler.
pub struct FnMiddleware<F, Req, Resp> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp> Middleware<Req, Resp> for FnMiddleware<F, Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> + Send + Sync,
{
    fn wrap(&self, next: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> {
        (self.f)(next)
    }
}

/// Adapts a closure into a [`BoxMiddleware`].
pub fn middleware_fn<Req, Resp, F>(f: F) -> BoxMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware {
        f,
        _marker: PhantomData,
    })
}

/// An ordered composition of middlewares; the first one is outermost.
pub struct Chain<Req, Resp> {
    layers: Vec<BoxMiddleware<Req, Resp>>,
}

impl<Req, Resp> Chain<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Creates a chain from outermost to innermost.
    pub fn new(layers: Vec<BoxMiddleware<Req, Resp>>) -> Self {
        Self { layers }
    }

    /// Number of middlewares in the chain.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True if the chain wraps nothing.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<Req, Resp> Middleware<Req, Resp> for Chain<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> {
        self.layers
            .iter()
            .rev()
            .fold(next, |inner, layer| layer.wrap(inner))
    }
}

/// Composes middlewares into one; `layers[0]` ends up outermost.
pub fn chain<Req, Resp>(layers: Vec<BoxMiddleware<Req, Resp>>) -> BoxMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Arc::new(Chain::new(layers))
}
