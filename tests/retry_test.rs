//! Retry-engine integration tests against a scripted stub server.
//!
//! Covers the transient-status retries (503, 429 with Retry-After), the
//! attempt bound, and byte-identical body replay across attempts.

mod common;

use common::{response_with_body, StubServer};
use snag::client;
use snag::request::{normalize_url, BodySource, Request};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

async fn execute(req: &Request) -> Result<client::Exchange, snag::error::Error> {
    let parts = snag::request::build_parts(req).unwrap();
    let (body, _) = client::materialize_body(req.body.as_ref()).await.unwrap();
    let mut transport = client::build_transport(req).unwrap();
    let mut session = None;
    client::execute(req, &parts, body, &mut transport, &mut session, &CancellationToken::new()).await
}

#[tokio::test]
async fn test_503_then_200_succeeds_on_second_attempt() {
    let server = StubServer::start(vec![
        response_with_body(503, "Service Unavailable", &[], b"try later"),
        response_with_body(200, "OK", &[], b"hello"),
    ])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/flaky")).unwrap());
    req.method = Some(http::Method::POST);
    req.body = Some(BodySource::Raw(b"request payload".to_vec()));
    req.retries = 2;
    req.retry_delay = Duration::from_millis(10);

    let exchange = execute(&req).await.unwrap();
    assert_eq!(exchange.response.status(), 200);

    let seen = server.requests();
    assert_eq!(seen.len(), 2, "one retry after the 503");
    // Body replay: both attempts carried identical bytes.
    assert_eq!(seen[0].body, b"request payload");
    assert_eq!(seen[0].body, seen[1].body);
}

#[tokio::test]
async fn test_attempts_bounded_by_retry_plus_one() {
    let server = StubServer::start(vec![response_with_body(
        503,
        "Service Unavailable",
        &[],
        b"no",
    )])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/down")).unwrap());
    req.retries = 2;
    req.retry_delay = Duration::from_millis(5);

    let exchange = execute(&req).await.unwrap();
    // The terminal attempt's 503 is handed to the pipeline, not an error.
    assert_eq!(exchange.response.status(), 503);
    assert_eq!(server.request_count(), 3, "retry=2 means at most 3 attempts");
}

#[tokio::test]
async fn test_429_retry_after_floors_the_delay() {
    let server = StubServer::start(vec![
        response_with_body(429, "Too Many Requests", &[("Retry-After", "1")], b"slow down"),
        response_with_body(200, "OK", &[], b"fine"),
    ])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/limited")).unwrap());
    req.retries = 1;
    req.retry_delay = Duration::from_millis(1);

    let started = Instant::now();
    let exchange = execute(&req).await.unwrap();
    assert_eq!(exchange.response.status(), 200);
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "Retry-After must floor the computed backoff, waited {:?}",
        started.elapsed()
    );
    assert_eq!(server.request_count(), 2);
}

#[tokio::test]
async fn test_success_does_not_retry() {
    let server = StubServer::start(vec![response_with_body(200, "OK", &[], b"first")]).await;

    let mut req = Request::new(normalize_url(&server.url("/ok")).unwrap());
    req.retries = 3;
    req.retry_delay = Duration::from_millis(5);

    let exchange = execute(&req).await.unwrap();
    assert_eq!(exchange.response.status(), 200);
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_4xx_is_not_retried() {
    let server = StubServer::start(vec![response_with_body(404, "Not Found", &[], b"gone")]).await;

    let mut req = Request::new(normalize_url(&server.url("/missing")).unwrap());
    req.retries = 3;
    req.retry_delay = Duration::from_millis(5);

    let exchange = execute(&req).await.unwrap();
    assert_eq!(exchange.response.status(), 404);
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_connection_refused_retries_then_errors() {
    // Bind then drop to find a dead port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut req = Request::new(normalize_url(&format!("127.0.0.1:{port}/")).unwrap());
    req.retries = 1;
    req.retry_delay = Duration::from_millis(5);

    let err = execute(&req).await.unwrap_err();
    assert!(err.is_retryable(), "refused connections classify transient: {err}");
}
