use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rttp_idempotency::middleware::{LoggerMiddleware, Stack};
use rttp_idempotency::{
    IdempotencyConfig, IdempotencyEngine, IdempotencyMiddleware, Response, Server, StatusCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    engine: Arc<IdempotencyEngine>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn start() -> TestServer {
    let engine = Arc::new(IdempotencyEngine::new(IdempotencyConfig::default()).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let stack = Stack::new(move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Response::new(StatusCode::Created).body(format!("charge-{n}"))
        }
    })
    .layer(Arc::new(LoggerMiddleware))
    .layer(Arc::new(IdempotencyMiddleware::new(Arc::clone(&engine))));

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let (shutdown, stop) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .serve_with_shutdown(stack, async {
                let _ = stop.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        calls,
        engine,
        shutdown,
        task,
    }
}

async fn send(addr: SocketAddr, token: Option<&str>, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let key_header = token
        .map(|t| format!("Idempotency-Key: {t}\r\n"))
        .unwrap_or_default();
    let raw = format!(
        "POST /payments HTTP/1.1\r\nHost: localhost\r\n{key_header}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

fn body_of(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

#[tokio::test]
async fn repeated_key_is_replayed_over_the_wire() {
    let server = start().await;

    let first = send(server.addr, Some("k-1"), r#"{"amount":10}"#).await;
    assert!(first.starts_with("HTTP/1.1 201 Created\r\n"), "{first}");
    assert!(!first.contains("X-Cache"));

    let second = send(server.addr, Some("k-1"), r#"{"amount":10}"#).await;
    assert!(second.starts_with("HTTP/1.1 201 Created\r\n"), "{second}");
    assert!(second.contains("X-Cache: HIT\r\n"));
    assert_eq!(body_of(&first), body_of(&second));
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);

    // a different key runs the handler again
    let other = send(server.addr, Some("k-2"), r#"{"amount":10}"#).await;
    assert_eq!(body_of(&other), "charge-2");

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn requests_without_a_key_always_execute() {
    let server = start().await;

    let a = send(server.addr, None, "{}").await;
    let b = send(server.addr, None, "{}").await;
    assert_eq!(body_of(&a), "charge-1");
    assert_eq!(body_of(&b), "charge-2");
    assert!(!b.contains("X-Cache"));
    assert!(server.engine.cache().is_empty());

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn overflowing_content_length_is_rejected() {
    let server = start().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(
            b"POST /payments HTTP/1.1\r\nHost: localhost\r\nIdempotency-Key: big\r\n\
              Content-Length: 18446744073709551615\r\n\r\n{}",
        )
        .await
        .unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    let response = String::from_utf8(out).unwrap();

    assert!(
        response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
        "{response}"
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    assert!(server.engine.in_flight().is_empty());

    // the server keeps serving other connections
    let ok = send(server.addr, Some("after"), "{}").await;
    assert_eq!(body_of(&ok), "charge-1");

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn concurrent_duplicates_share_one_execution() {
    let server = start().await;

    let requests = (0..8).map(|_| send(server.addr, Some("burst"), r#"{"amount":5}"#));
    let responses = spawn_all(requests).await;

    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    let hits = responses
        .iter()
        .filter(|r| r.contains("X-Cache: HIT\r\n"))
        .count();
    assert_eq!(hits, 7);
    assert!(responses.iter().all(|r| body_of(r) == "charge-1"));

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap();
    assert!(server.engine.in_flight().is_empty());
}

async fn spawn_all<F>(futures: impl Iterator<Item = F>) -> Vec<String>
where
    F: std::future::Future<Output = String> + Send + 'static,
{
    let handles: Vec<_> = futures.map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}
