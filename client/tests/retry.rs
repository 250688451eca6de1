//! Client behavior against a scripted local HTTP server

use std::sync::Arc;
use std::time::{Duration, Instant};

use boutsim_client::{Client, HttpConfig};
use boutsim_core::sse::parse_stream;
use boutsim_core::{Method, Transport, TransportError};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// One canned response
#[derive(Clone)]
struct Scripted {
    status: u16,
    content_type: &'static str,
    body: String,
}

fn status(status: u16) -> Scripted {
    Scripted {
        status,
        content_type: "application/json",
        body: "{}".to_string(),
    }
}

fn sse(body: &str) -> Scripted {
    Scripted {
        status: 200,
        content_type: "text/event-stream",
        body: body.to_string(),
    }
}

/// A recorded request: lower-cased head and raw body
#[derive(Debug, Clone)]
struct Seen {
    head: String,
    body: String,
}

struct StubServer {
    url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl StubServer {
    /// Serve `script` in order, repeating the last entry once exhausted
    async fn start(script: Vec<Scripted>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = seen.clone();
        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let reply = script[served.min(script.len() - 1)].clone();
                served += 1;
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    handle(socket, reply, recorded).await;
                });
            }
        });

        Self { url, seen }
    }

    fn requests(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

async fn handle(mut socket: TcpStream, reply: Scripted, seen: Arc<Mutex<Vec<Seen>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();
    seen.lock().push(Seen { head, body });

    let response = format!(
        "HTTP/1.1 {} Scripted\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        reply.status,
        reply.content_type,
        reply.body.len(),
        reply.body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn client(url: &str, retries: u32) -> Client {
    Client::new(
        HttpConfig::new(url)
            .with_max_retries(retries)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .with_request_timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

// ============================================================================
// Buffered calls
// ============================================================================

#[tokio::test]
async fn test_retries_until_success() {
    let server = StubServer::start(vec![status(503), status(503), status(200)]).await;
    let client = client(&server.url, 3);

    let resp = client
        .execute(&CancellationToken::new(), Method::Get, "/", None, None)
        .await
        .unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(resp.attempts, 3);
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_status() {
    let server = StubServer::start(vec![status(429)]).await;
    let client = client(&server.url, 2);

    let resp = client
        .execute(&CancellationToken::new(), Method::Get, "/", None, None)
        .await
        .unwrap();

    assert_eq!(resp.status, 429);
    assert_eq!(resp.attempts, 3);
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = StubServer::start(vec![status(400), status(200)]).await;
    let client = client(&server.url, 3);

    let resp = client
        .execute(&CancellationToken::new(), Method::Get, "/", None, None)
        .await
        .unwrap();

    assert_eq!(resp.status, 400);
    assert_eq!(resp.attempts, 1);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_bearer_token_only_for_registered_accounts() {
    let server = StubServer::start(vec![status(200)]).await;
    let client = client(&server.url, 0);
    client.register_token("alice", "secret-a");
    let cancel = CancellationToken::new();

    client
        .execute(&cancel, Method::Get, "/a", Some("alice"), None)
        .await
        .unwrap();
    client
        .execute(&cancel, Method::Get, "/b", Some("mallory"), None)
        .await
        .unwrap();
    client.execute(&cancel, Method::Get, "/c", None, None).await.unwrap();

    let seen = server.requests();
    assert_eq!(seen.len(), 3);
    let with_auth: Vec<_> = seen
        .iter()
        .filter(|s| s.head.contains("authorization: bearer secret-a"))
        .collect();
    assert_eq!(with_auth.len(), 1);
    assert!(with_auth[0].head.starts_with("get /a "));
    assert!(seen.iter().filter(|s| s.head.contains("authorization")).count() == 1);
}

#[tokio::test]
async fn test_default_headers_and_json_body() {
    let server = StubServer::start(vec![status(200)]).await;
    let client = Client::new(
        HttpConfig::new(format!("{}/", server.url)).with_header("x-bypass-key", "letmein"),
    )
    .unwrap();

    let body = serde_json::json!({ "presetId": "darwin-special" });
    client
        .execute(&CancellationToken::new(), Method::Post, "/api/run-bout", None, Some(&body))
        .await
        .unwrap();

    let seen = &server.requests()[0];
    assert!(seen.head.starts_with("post /api/run-bout "));
    assert!(seen.head.contains("x-bypass-key: letmein"));
    assert!(seen.head.contains("user-agent: boutsim/"));
    assert!(seen.head.contains("accept: text/event-stream, application/json"));
    let sent: serde_json::Value = serde_json::from_str(&seen.body).unwrap();
    assert_eq!(sent, body);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = client(&url, 1);
    let result = client
        .execute(&CancellationToken::new(), Method::Get, "/", None, None)
        .await;
    assert!(matches!(result, Err(TransportError::Network(_))));
}

#[tokio::test]
async fn test_cancelled_before_send() {
    let server = StubServer::start(vec![status(200)]).await;
    let client = client(&server.url, 3);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = client.execute(&cancel, Method::Get, "/", None, None).await;
    assert!(matches!(result, Err(TransportError::Cancelled)));
    let result = client
        .execute_stream(&cancel, Method::Post, "/api/run-bout", None, None)
        .await;
    assert!(matches!(result, Err(TransportError::Cancelled)));
}

// ============================================================================
// Streaming calls
// ============================================================================

#[tokio::test]
async fn test_stream_parses_bout() {
    let body = concat!(
        "data: {\"type\":\"start\"}\n",
        "data: {\"type\":\"data-turn\",\"data\":{\"turn\":0,\"agentId\":\"a\",\"agentName\":\"Ada\"}}\n",
        "data: {\"type\":\"text-delta\",\"delta\":\"Hello \"}\n",
        "data: {\"type\":\"text-delta\",\"delta\":\"there\"}\n",
        "data: {\"type\":\"text-end\"}\n",
        "data: [DONE]\n",
    );
    let server = StubServer::start(vec![sse(body)]).await;
    let client = client(&server.url, 3);

    let started = Instant::now();
    let resp = client
        .execute_stream(&CancellationToken::new(), Method::Post, "/api/run-bout", None, None)
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert!(resp
        .headers
        .iter()
        .any(|(k, v)| k == "content-type" && v == "text/event-stream"));

    let result = parse_stream(resp.body, started).await.unwrap();
    assert!(result.completed);
    assert_eq!(result.turns.len(), 1);
    assert_eq!(result.turns[0].agent_name, "Ada");
    assert_eq!(result.turns[0].text, "Hello there");
    assert_eq!(result.delta_count, 2);
}

#[tokio::test]
async fn test_stream_status_is_error_without_retry() {
    let server = StubServer::start(vec![status(503), sse("data: [DONE]\n")]).await;
    let client = client(&server.url, 3);

    let result = client
        .execute_stream(&CancellationToken::new(), Method::Post, "/api/run-bout", None, None)
        .await;

    match result {
        Err(TransportError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "{}");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_stream_error_body_read_honours_cancel() {
    // Sends an error head promising a body that never arrives
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut chunk = [0u8; 4096];
        let _ = socket.read(&mut chunk).await;
        let head = "HTTP/1.1 503 Busy\r\ncontent-type: text/plain\r\ncontent-length: 1000000\r\n\r\npartial";
        let _ = socket.write_all(head.as_bytes()).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let client = client(&url, 0);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = client
        .execute_stream(&cancel, Method::Post, "/api/run-bout", None, None)
        .await;
    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}
