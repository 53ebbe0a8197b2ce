//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function, usually a [`Stack`] with the idempotency middleware mounted.
//! Supports persistent connections and stops accepting on a shutdown signal.

use std::future::{Future, pending};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Stack;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server.
///
/// ```rust,no_run
/// use rttp_idempotency::server::Server;
/// use rttp_idempotency::middleware::Stack;
/// use rttp_idempotency::{Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let stack = Stack::new(|_ctx| async { Response::new(StatusCode::Ok).body("Hello!") });
///     Server::bind("127.0.0.1:8080").await?.serve(stack).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `stack` until the process exits.
    pub async fn serve(self, stack: Stack) -> Result<(), ServerError> {
        self.serve_with_shutdown(stack, pending()).await
    }

    /// Serves `stack` until `shutdown` resolves.
    pub async fn serve_with_shutdown(
        self,
        stack: Stack,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        self.run_until(
            move |request| {
                let stack = stack.clone();
                async move { stack.handle(request).await }
            },
            shutdown,
        )
        .await
    }

    /// Accepts connections and dispatches requests to `handler` until
    /// `shutdown` resolves.
    ///
    /// On shutdown the listener is closed and connections that are mid-request
    /// are allowed to finish writing their current response; idle keep-alive
    /// connections are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<H, F>(
        self,
        handler: H,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut connections = JoinSet::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        info!(address = %self.local_addr, "listening");

        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let stop_rx = stop_rx.clone();

            connections.spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, stop_rx).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        info!(open = connections.len(), "shutting down; no longer accepting");
        let _ = stop_tx.send(true);
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or the server begins shutting down.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Only an idle read is interrupted by shutdown; a dispatched request runs to completion.
        let bytes_read = tokio::select! {
            read = stream.read_buf(&mut buf) => read?,
            _ = stop.changed() => {
                debug!(peer = %peer_addr, "server shutting down, closing idle connection");
                break;
            }
        };

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // A single read may carry several pipelined requests.
        while !buf.is_empty() {
            let (mut request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => break,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                    let response = Response::new(StatusCode::BadRequest)
                        .body(format!("Bad Request: {e}"))
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    return Ok(());
                }
            };

            let content_length = request.content_length().unwrap_or(0);
            let Some(total_needed) = frame_length(body_offset, content_length) else {
                warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                let response = Response::new(StatusCode::PayloadTooLarge)
                    .body("Request entity too large")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                return Ok(());
            };
            if buf.len() < total_needed {
                break;
            }

            let frame = buf.split_to(total_needed).freeze();
            request.set_body(frame.slice(body_offset..));
            let client_keep_alive = request.is_keep_alive();

            debug!(
                peer = %peer_addr,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let mut response = handler(request).await;
            let keep_alive = client_keep_alive && response.is_keep_alive();
            if !keep_alive {
                response = response.keep_alive(false);
            }
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            if !keep_alive {
                debug!(peer = %peer_addr, "connection close requested");
                return Ok(());
            }
        }
    }

    Ok(())
}

// Total bytes of a request frame, or `None` if it cannot fit under `MAX_REQUEST_SIZE`.
fn frame_length(body_offset: usize, content_length: usize) -> Option<usize> {
    body_offset
        .checked_add(content_length)
        .filter(|&total| total <= MAX_REQUEST_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_rejects_overflow_and_oversize() {
        assert_eq!(frame_length(40, 5), Some(45));
        assert_eq!(frame_length(40, MAX_REQUEST_SIZE - 40), Some(MAX_REQUEST_SIZE));
        assert_eq!(frame_length(40, MAX_REQUEST_SIZE), None);
        assert_eq!(frame_length(40, usize::MAX), None);
    }
}
