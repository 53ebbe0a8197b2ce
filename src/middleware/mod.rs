//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration without coupling handlers
//! to infrastructure concerns. Idempotency replay is one such short-circuit.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`Stack`]: an ordered list of middleware in front of a terminal endpoint.
//! - [`IntoHandler`]: blanket conversion for async `Fn(Context) -> Response`.
//! - [`LoggerMiddleware`]: built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, context::Context};

/// Boxed future returned by middleware and endpoints.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxFuture + Send + Sync + 'static>;

/// A type-erased terminal handler: the route logic the stack protects.
pub type Endpoint = Arc<dyn Fn(Context) -> BoxFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture {
        Box::pin((self)(ctx))
    }
}

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once. Cloning the chain is an `Arc` bump.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Option<Endpoint>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Creates a cursor over `middlewares` with no terminal endpoint.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares: middlewares.into(),
            endpoint: None,
            index: 0,
        }
    }

    /// Invokes the next middleware, or the endpoint once the chain is exhausted.
    ///
    /// Without an endpoint an exhausted chain yields `500 Internal Server Error`.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else if let Some(endpoint) = self.endpoint {
            endpoint(ctx).await
        } else {
            Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a [`Response`] without calling `next`, or decorate the downstream
/// response.
///
/// Implementations must be `Send + Sync` because middleware is shared across
/// Tokio tasks, and should not hold locks across an `.await`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture;
}

/// An ordered middleware stack in front of a terminal endpoint.
///
/// Layers run in the order they were added: the first layer sees the request
/// first and the response last.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_idempotency::{Response, StatusCode};
/// use rttp_idempotency::middleware::{LoggerMiddleware, Stack};
///
/// let stack = Stack::new(|_ctx| async { Response::new(StatusCode::Ok) })
///     .layer(Arc::new(LoggerMiddleware));
/// ```
#[derive(Clone)]
pub struct Stack {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Endpoint,
}

impl Stack {
    pub fn new(endpoint: impl IntoHandler) -> Self {
        Self {
            middlewares: Arc::from(Vec::new()),
            endpoint: Arc::new(move |ctx| endpoint.call(ctx)),
        }
    }

    /// Appends a middleware layer.
    #[must_use]
    pub fn layer<M>(self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        let mut layers: Vec<MiddlewareHandler> = self.middlewares.iter().cloned().collect();
        layers.push(from_middleware(middleware));
        Self {
            middlewares: layers.into(),
            endpoint: self.endpoint,
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `ctx` through every layer and the endpoint.
    pub async fn call(&self, ctx: Context) -> Response {
        let next = Next {
            middlewares: Arc::clone(&self.middlewares),
            endpoint: Some(Arc::clone(&self.endpoint)),
            index: 0,
        };
        next.run(ctx).await
    }

    /// Convenience wrapper over [`call`](Self::call) for a bare request.
    pub async fn handle(&self, request: Request) -> Response {
        self.call(Context::new(request)).await
    }
}

/// Logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` record after the downstream handler
/// completes. Never short-circuits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let cache = response.headers().get("x-cache").unwrap_or("-").to_owned();
            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                %cache,
                elapsed = ?start.elapsed(),
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
            let tag = self.0;
            Box::pin(async move {
                let mut response = next.run(ctx).await;
                response.add_header("X-Trace", tag);
                response
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxFuture {
            Box::pin(async { Response::new(StatusCode::Forbidden) })
        }
    }

    fn request() -> Request {
        Request::new(Method::Get, "/")
    }

    #[tokio::test]
    async fn empty_next_returns_500() {
        let res = Next::new(vec![]).run(Context::new(request())).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn stack_runs_layers_in_order_then_endpoint() {
        let stack = Stack::new(|_ctx| async { Response::new(StatusCode::Accepted) })
            .layer(Arc::new(Tag("outer")))
            .layer(Arc::new(Tag("inner")));
        assert_eq!(stack.len(), 2);

        let res = stack.handle(request()).await;
        assert_eq!(res.status(), StatusCode::Accepted);
        // inner decorates first on the way out
        let trace: Vec<_> = res.headers().get_all("x-trace").collect();
        assert_eq!(trace, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let stack = Stack::new(|_ctx| async { Response::new(StatusCode::Ok) })
            .layer(Arc::new(LoggerMiddleware))
            .layer(Arc::new(Deny));
        let res = stack.handle(request()).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }
}
