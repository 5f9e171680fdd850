//! Tests for the unified request executor: retry, cancellation, credential
//! validation, and single-record logging against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use easel::ApiConfig;
use easel::dispatch::http::Executor;
use easel::dispatch::{RequestBody, RequestKind, RequestSpec, RetryPolicy};
use easel::error::EaselError;
use easel::request_log::{LogStatus, RequestLog};
use easel::store::MemStore;

/// Helper: route tracing output from the code under test to stderr,
/// filtered by RUST_LOG. Safe to call from every test.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    });
}

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn json_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Helper: read one full HTTP request (headers plus content-length body)
/// and return it as text.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let n = socket.read(&mut tmp).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Helper: answer one connection with a canned response, returning the
/// request text.
async fn serve_once(listener: &TcpListener, response: String) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let request = read_request(&mut socket).await;
    socket.write_all(response.as_bytes()).await.unwrap();
    socket.shutdown().await.ok();
    request
}

/// Executor with fast backoff so retry tests finish quickly.
fn fast_executor() -> (Executor, Arc<RequestLog>) {
    init_tracing();
    let log = Arc::new(RequestLog::new(Arc::new(MemStore::new())));
    let policy = RetryPolicy {
        timeout: Duration::from_secs(5),
        base_backoff: Duration::from_millis(10),
        ..RetryPolicy::default()
    };
    (Executor::with_policy(Arc::clone(&log), policy), log)
}

fn config_for(port: u16) -> ApiConfig {
    ApiConfig::new(format!("http://127.0.0.1:{port}"), "sk-test")
}

fn image_spec(config: &ApiConfig) -> RequestSpec {
    RequestSpec::post(
        config.url_for(RequestKind::Image),
        RequestKind::Image,
        RequestBody::Json(json!({"prompt": "a cat", "model": "m"})),
    )
    .with_model("m")
}

// ---------------------------------------------------------------------------
// Success path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffered_success_parses_json_and_logs_one_record() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        serve_once(&listener, json_response("200 OK", r#"{"data":[{"url":"u"}]}"#)).await
    });

    let (executor, log) = fast_executor();
    let config = config_for(port);
    let dispatched = tokio_test::assert_ok!(executor.execute(&config, &image_spec(&config)).await);
    assert_eq!(dispatched.into_json().unwrap(), json!({"data": [{"url": "u"}]}));

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /images/generations"));
    assert!(request.contains("Bearer sk-test"));

    let records = log.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, LogStatus::Success);
    assert_eq!(records[0].http_status, Some(200));
    assert_eq!(records[0].method, "POST");
    assert!(records[0].duration_ms.is_some());
}

// ---------------------------------------------------------------------------
// Retry behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retryable_status_is_retried_then_succeeds() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        serve_once(&listener, json_response("500 Internal Server Error", "{}")).await;
        serve_once(&listener, json_response("200 OK", r#"{"ok":true}"#)).await;
    });

    let (executor, log) = fast_executor();
    let config = config_for(port);
    let body = executor
        .execute(&config, &image_spec(&config))
        .await
        .unwrap()
        .into_json()
        .unwrap();
    assert_eq!(body, json!({"ok": true}));
    server.await.unwrap();

    // Retries reuse the original record.
    let records = log.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, LogStatus::Success);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (listener, port) = mock_listener().await;
    let served = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count = Arc::clone(&served);
    tokio::spawn(async move {
        loop {
            serve_once(
                &listener,
                json_response("400 Bad Request", r#"{"error":"bad prompt"}"#),
            )
            .await;
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let (executor, log) = fast_executor();
    let config = config_for(port);
    let err = executor
        .execute(&config, &image_spec(&config))
        .await
        .unwrap_err();

    match &err {
        EaselError::Http { status, body } => {
            assert_eq!(*status, 400);
            assert!(body.contains("bad prompt"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }
    assert!(err.user_message().starts_with("invalid request parameters"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 1);

    let records = log.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, LogStatus::Error);
    assert_eq!(records[0].http_status, Some(400));
}

#[tokio::test]
async fn exhausted_retries_surface_the_final_status() {
    let (listener, port) = mock_listener().await;
    tokio::spawn(async move {
        loop {
            serve_once(&listener, json_response("503 Service Unavailable", "{}")).await;
        }
    });

    init_tracing();
    let log = Arc::new(RequestLog::new(Arc::new(MemStore::new())));
    let policy = RetryPolicy {
        max_retries: 2,
        base_backoff: Duration::from_millis(5),
        ..RetryPolicy::default()
    };
    let executor = Executor::with_policy(Arc::clone(&log), policy);
    let config = config_for(port);

    let err = executor
        .execute(&config, &image_spec(&config))
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), Some(503));
    assert_eq!(log.snapshot()[0].status, LogStatus::Error);
}

// ---------------------------------------------------------------------------
// Validation before any network activity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_credential_fails_without_connecting() {
    let (executor, log) = fast_executor();
    // Unroutable port: reaching the network at all would hang or error
    // differently than the expected Config error.
    let config = ApiConfig::new("http://127.0.0.1:1", "");

    let err = tokio_test::assert_err!(executor.execute(&config, &image_spec(&config)).await);
    assert!(matches!(err, EaselError::Config(_)));

    let records = log.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, LogStatus::Error);
    assert!(records[0].error_message.contains("API key"));
}

#[tokio::test]
async fn authorization_header_override_skips_credential_check() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(
        async move { serve_once(&listener, json_response("200 OK", "{}")).await },
    );

    let (executor, _log) = fast_executor();
    let config = ApiConfig::new(format!("http://127.0.0.1:{port}"), "");
    let spec = image_spec(&config).with_header("Authorization", "Bearer other-credential");

    tokio_test::assert_ok!(executor.execute(&config, &spec).await);
    let request = server.await.unwrap();
    assert!(request.contains("Bearer other-credential"));
    assert!(!request.contains("sk-test"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_aborts_the_request_and_is_not_retried() {
    let (listener, port) = mock_listener().await;
    tokio::spawn(async move {
        // Accept and hold the connection open without responding.
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let (executor, log) = fast_executor();
    let config = config_for(port);
    let token = CancellationToken::new();
    let spec = image_spec(&config).with_cancel(Some(token.clone()));

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = executor.execute(&config, &spec).await.unwrap_err();
    assert!(matches!(err, EaselError::Cancelled(_)));
    assert!(started.elapsed() < Duration::from_secs(2));

    let records = log.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, LogStatus::Error);
    assert!(records[0].error_message.contains("cancelled"));
}

#[tokio::test]
async fn cancellation_during_backoff_prevents_the_next_attempt() {
    let (listener, port) = mock_listener().await;
    let served = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count = Arc::clone(&served);
    tokio::spawn(async move {
        loop {
            serve_once(&listener, json_response("500 Internal Server Error", "{}")).await;
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    });

    init_tracing();
    let log = Arc::new(RequestLog::new(Arc::new(MemStore::new())));
    let policy = RetryPolicy {
        base_backoff: Duration::from_secs(10),
        ..RetryPolicy::default()
    };
    let executor = Executor::with_policy(Arc::clone(&log), policy);
    let config = config_for(port);
    let token = CancellationToken::new();
    let spec = image_spec(&config).with_cancel(Some(token.clone()));

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let err = executor.execute(&config, &spec).await.unwrap_err();
    assert!(matches!(err, EaselError::Cancelled(_)));
    assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_json_success_body_is_a_protocol_error() {
    let (listener, port) = mock_listener().await;
    tokio::spawn(async move {
        serve_once(&listener, json_response("200 OK", "this is not json")).await;
    });

    let (executor, log) = fast_executor();
    let config = config_for(port);
    let err = executor
        .execute(&config, &image_spec(&config))
        .await
        .unwrap_err();
    assert!(matches!(err, EaselError::Protocol(_)));
    assert_eq!(log.snapshot()[0].status, LogStatus::Error);
}
