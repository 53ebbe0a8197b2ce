//! Idempotency-Key request deduplication.
//!
//! A request carrying an idempotency token is executed at most once per
//! [`CacheKey`]; every other request with the same key, concurrent or later,
//! receives the stored response tagged `X-Cache: HIT`.
//!
//! [`IdempotencyEngine::execute`] holds the dispatch loop:
//!
//! 1. Cache hit → replay.
//! 2. Miss → try to claim the key. If another request owns it, wait for the
//!    owner to finish (or its lease to run out) and start over at 1.
//! 3. Owner → re-check the cache once (the previous owner may have stored its
//!    response between our miss and our claim), run the handler, store the
//!    response, release the key.
//!
//! [`IdempotencyMiddleware`] mounts the engine in a [`Stack`](crate::middleware::Stack).
//! Requests without a token pass straight through and never touch the engine.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{ResponseCache, StoredResponse};
use crate::config::{ConfigError, IdempotencyConfig};
use crate::context::Context;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::{Request, Response};

pub mod inflight;
pub mod key;

pub use inflight::{Admission, InFlightCoordinator, InFlightGuard, WaitOutcome, Waiter};
pub use key::{CacheKey, RequestIdentity, derive_key};

/// The caller-supplied token, as found on the request.
///
/// Inserted into the request [`Extensions`](crate::context::Extensions) by
/// [`IdempotencyMiddleware`] so handlers can log or echo it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Returns `None` for blank values, which do not opt in to idempotency.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether a response was replayed or freshly produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Outcome of [`IdempotencyEngine::execute`].
#[derive(Debug)]
pub struct Dispatch {
    pub response: Response,
    pub status: CacheStatus,
}

impl Dispatch {
    fn replayed(stored: &StoredResponse) -> Self {
        Self {
            response: stored.replay(),
            status: CacheStatus::Hit,
        }
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

/// Process-wide idempotency state: the response cache and the in-flight set.
///
/// Create one at startup, share it behind an [`Arc`], and call
/// [`drain`](Self::drain) on shutdown. Independent engines do not share state.
pub struct IdempotencyEngine {
    config: IdempotencyConfig,
    cache: ResponseCache,
    in_flight: InFlightCoordinator,
}

impl IdempotencyEngine {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(config: IdempotencyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cache: ResponseCache::from_config(&config),
            in_flight: InFlightCoordinator::new(config.in_flight_timeout),
            config,
        })
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn in_flight(&self) -> &InFlightCoordinator {
        &self.in_flight
    }

    /// Reads the token from the configured header.
    pub fn token_for(&self, request: &Request) -> Option<IdempotencyToken> {
        request
            .headers()
            .get(&self.config.header_name)
            .and_then(IdempotencyToken::new)
    }

    pub fn key_for(&self, request: &Request, token: &IdempotencyToken) -> CacheKey {
        derive_key(
            &RequestIdentity::from_request(request, &self.config),
            token.as_str(),
        )
    }

    /// Runs `handler` at most once per key and replays its response to every
    /// duplicate.
    ///
    /// `handler` is only invoked when this call becomes the owner of `key`.
    /// If this future is dropped while waiting, the owner is unaffected; if it
    /// is dropped (or panics) while owning, the key is released.
    pub async fn execute<F, Fut>(&self, key: &CacheKey, handler: F) -> Dispatch
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let guard = loop {
            if let Some(stored) = self.cache.get(key) {
                debug!(%key, "replaying stored response");
                return Dispatch::replayed(&stored);
            }

            match self.in_flight.try_acquire(key) {
                Admission::Owner(guard) => {
                    if let Some(stored) = self.cache.recheck(key) {
                        debug!(%key, "owner admitted after predecessor stored; replaying");
                        return Dispatch::replayed(&stored);
                    }
                    break guard;
                }
                Admission::Busy(waiter) => {
                    debug!(%key, "duplicate request waiting on in-flight owner");
                    let outcome = waiter.wait(self.config.poll_interval).await;
                    debug!(%key, ?outcome, "re-evaluating after wait");
                }
            }
        };

        let response = handler().await;
        if guard.is_current() {
            self.capture(guard.key(), &response);
        } else {
            warn!(%key, "owner outlived its lease; response not stored");
        }
        drop(guard);

        Dispatch {
            response,
            status: CacheStatus::Miss,
        }
    }

    // Storage failures are logged and swallowed: the caller still gets its response.
    fn capture(&self, key: &CacheKey, response: &Response) {
        let status = response.status().as_u16();
        if response.status().is_server_error() && !self.config.cache_server_errors {
            warn!(%key, status, "handler failed; response not stored, key released for retry");
            return;
        }

        match self.cache.set(key.clone(), StoredResponse::capture(response)) {
            Ok(()) => debug!(%key, status, "stored response for replay"),
            Err(e) => warn!(%key, status, error = %e, "response not cached"),
        }
    }

    /// Periodically purges expired responses until the engine is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let purged = engine.cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "purged expired responses");
                }
            }
        })
    }

    /// Waits up to `timeout` for in-flight requests to finish, then empties the
    /// cache. Returns `false` if requests were still running at the deadline.
    ///
    /// Call after the server has stopped accepting new requests.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = self
            .in_flight
            .wait_idle(timeout, self.config.poll_interval)
            .await;
        if !idle {
            warn!(
                in_flight = self.in_flight.len(),
                "drain timed out with requests still in flight"
            );
        }
        self.cache.clear();
        idle
    }
}

/// Middleware adapter for [`IdempotencyEngine`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_idempotency::{Response, StatusCode};
/// use rttp_idempotency::config::IdempotencyConfig;
/// use rttp_idempotency::idempotency::{IdempotencyEngine, IdempotencyMiddleware};
/// use rttp_idempotency::middleware::Stack;
///
/// let engine = Arc::new(IdempotencyEngine::new(IdempotencyConfig::default()).unwrap());
/// let stack = Stack::new(|_ctx| async { Response::new(StatusCode::Created) })
///     .layer(Arc::new(IdempotencyMiddleware::new(engine)));
/// ```
pub struct IdempotencyMiddleware {
    engine: Arc<IdempotencyEngine>,
}

impl IdempotencyMiddleware {
    pub fn new(engine: Arc<IdempotencyEngine>) -> Self {
        Self { engine }
    }
}

impl Middleware for IdempotencyMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxFuture {
        let engine = Arc::clone(&self.engine);
        Box::pin(async move {
            let Some(token) = engine.token_for(ctx.request()) else {
                return next.run(ctx).await;
            };
            let key = engine.key_for(ctx.request(), &token);
            ctx.extensions_mut().insert(token);

            engine
                .execute(&key, move || next.run(ctx))
                .await
                .into_response()
        })
    }
}
