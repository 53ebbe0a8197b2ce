//! # rttp-idempotency
//!
//! Idempotency-Key request deduplication for an async HTTP/1.1 server.
//!
//! Requests that carry an `Idempotency-Key` header run their handler at most
//! once per key. Concurrent duplicates wait for the first one to finish, and
//! every duplicate (concurrent or later, within the TTL) receives the stored
//! response with `X-Cache: HIT`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rttp_idempotency::middleware::{LoggerMiddleware, Stack};
//! use rttp_idempotency::{
//!     IdempotencyConfig, IdempotencyEngine, IdempotencyMiddleware, Response, Server, StatusCode,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(IdempotencyEngine::new(IdempotencyConfig::from_env()?)?);
//!     let stack = Stack::new(|_ctx| async { Response::new(StatusCode::Created).body("charged") })
//!         .layer(Arc::new(LoggerMiddleware))
//!         .layer(Arc::new(IdempotencyMiddleware::new(engine)));
//!
//!     Server::bind("127.0.0.1:8080").await?.serve(stack).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod idempotency;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{ResponseCache, StoredResponse};
pub use config::{ConfigError, IdempotencyConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use idempotency::{CacheKey, IdempotencyEngine, IdempotencyMiddleware, IdempotencyToken};
pub use server::{Server, ServerError};
