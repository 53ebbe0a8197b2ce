//! A payments endpoint guarded by `Idempotency-Key`.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example idempotent_server
//!
//! curl -i -X POST localhost:8080/payments \
//!      -H 'Idempotency-Key: 4f1c' -d '{"amount": 1200}'
//! ```
//!
//! Repeating the `curl` returns the same charge id with `X-Cache: HIT`.
//! Configuration is read from `RTTP_IDEMPOTENCY_*` environment variables.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rttp_idempotency::context::Context;
use rttp_idempotency::middleware::{LoggerMiddleware, Stack};
use rttp_idempotency::{
    IdempotencyConfig, IdempotencyEngine, IdempotencyMiddleware, Response, Server, StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct ChargeRequest {
    amount: u64,
}

#[derive(Serialize)]
struct Charge {
    id: u64,
    amount: u64,
}

async fn route(ctx: Context, charges: Arc<AtomicU64>) -> Response {
    let request = ctx.request();
    match (request.method().as_str(), request.path()) {
        ("GET", "/health") => Response::new(StatusCode::Ok).body("ok"),
        ("POST", "/payments") => {
            let Ok(charge) = ctx.json::<ChargeRequest>() else {
                return Response::new(StatusCode::UnprocessableEntity).body("expected {\"amount\": u64}");
            };
            // simulate a slow downstream so concurrent retries overlap
            tokio::time::sleep(Duration::from_millis(250)).await;
            let id = charges.fetch_add(1, Ordering::SeqCst) + 1;
            Response::json(StatusCode::Created, &Charge { id, amount: charge.amount })
                .unwrap_or_else(|_| Response::new(StatusCode::InternalServerError))
        }
        _ => Response::new(StatusCode::NotFound).body("Not Found"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = IdempotencyConfig::from_env()?;
    tracing::info!(
        header = %config.header_name,
        ttl = ?config.ttl,
        max_entries = config.max_entries,
        "idempotency configured"
    );

    let engine = Arc::new(IdempotencyEngine::new(config)?);
    let janitor = engine.spawn_janitor(Duration::from_secs(60));

    let charges = Arc::new(AtomicU64::new(0));
    let stack = Stack::new(move |ctx| route(ctx, Arc::clone(&charges)))
        .layer(Arc::new(LoggerMiddleware))
        .layer(Arc::new(IdempotencyMiddleware::new(Arc::clone(&engine))));

    let server = Server::bind("127.0.0.1:8080").await?;
    server
        .serve_with_shutdown(stack, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if !engine.drain(Duration::from_secs(5)).await {
        tracing::warn!("exiting with requests still in flight");
    }
    janitor.abort();
    Ok(())
}
