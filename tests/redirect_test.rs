//! Redirect-following and cookie-session integration tests.

mod common;

use common::{response_with_body, StubServer};
use snag::client;
use snag::request::{normalize_url, BodySource, Request};
use snag::session::Session;
use tokio_util::sync::CancellationToken;

async fn execute_with_session(
    req: &Request,
    session: &mut Option<Session>,
) -> Result<client::Exchange, snag::error::Error> {
    let parts = snag::request::build_parts(req).unwrap();
    let (body, _) = client::materialize_body(req.body.as_ref()).await.unwrap();
    let mut transport = client::build_transport(req).unwrap();
    client::execute(req, &parts, body, &mut transport, session, &CancellationToken::new()).await
}

#[tokio::test]
async fn test_follows_redirect_and_demotes_to_get() {
    let server = StubServer::start(vec![
        response_with_body(302, "Found", &[("Location", "/after")], b""),
        response_with_body(200, "OK", &[], b"landed"),
    ])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/start")).unwrap());
    req.method = Some(http::Method::POST);
    req.body = Some(BodySource::Raw(b"payload".to_vec()));

    let mut session = None;
    let exchange = execute_with_session(&req, &mut session).await.unwrap();
    assert_eq!(exchange.response.status(), 200);
    assert!(exchange.had_redirects);

    let seen = server.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/start");
    // 302 demotes to GET and drops the body.
    assert_eq!(seen[1].method, "GET");
    assert_eq!(seen[1].path, "/after");
    assert!(seen[1].body.is_empty());
}

#[tokio::test]
async fn test_redirect_cap_zero_returns_the_redirect() {
    let server = StubServer::start(vec![response_with_body(
        301,
        "Moved Permanently",
        &[("Location", "/elsewhere")],
        b"",
    )])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/start")).unwrap());
    req.redirects = Some(0);

    let mut session = None;
    let exchange = execute_with_session(&req, &mut session).await.unwrap();
    assert_eq!(exchange.response.status(), 301);
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_redirect_cap_exceeded_errors() {
    // Every hop redirects again.
    let server = StubServer::start(vec![
        response_with_body(302, "Found", &[("Location", "/a")], b""),
        response_with_body(302, "Found", &[("Location", "/b")], b""),
        response_with_body(302, "Found", &[("Location", "/c")], b""),
    ])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/start")).unwrap());
    req.redirects = Some(2);

    let mut session = None;
    let err = execute_with_session(&req, &mut session).await.unwrap_err();
    assert!(matches!(err, snag::error::Error::TooManyRedirects(2)));
}

#[tokio::test]
async fn test_temporary_redirect_replays_body() {
    let server = StubServer::start(vec![
        response_with_body(307, "Temporary Redirect", &[("Location", "/retry")], b""),
        response_with_body(200, "OK", &[], b"done"),
    ])
    .await;

    let mut req = Request::new(normalize_url(&server.url("/start")).unwrap());
    req.method = Some(http::Method::PUT);
    req.body = Some(BodySource::Raw(b"same bytes".to_vec()));

    let mut session = None;
    let exchange = execute_with_session(&req, &mut session).await.unwrap();
    assert_eq!(exchange.response.status(), 200);

    let seen = server.requests();
    assert_eq!(seen[1].method, "PUT");
    assert_eq!(seen[0].body, seen[1].body);
}

#[tokio::test]
async fn test_session_cookie_set_on_hop_sent_on_next() {
    let server = StubServer::start(vec![
        response_with_body(
            302,
            "Found",
            &[("Location", "/next"), ("Set-Cookie", "sid=abc123; Path=/")],
            b"",
        ),
        response_with_body(200, "OK", &[], b"in"),
    ])
    .await;

    let dir = tempfile::TempDir::new().unwrap();
    let mut session = Some(Session::load("redirects", dir.path()).unwrap());

    let req = Request::new(normalize_url(&server.url("/login")).unwrap());
    let exchange = execute_with_session(&req, &mut session).await.unwrap();
    assert_eq!(exchange.response.status(), 200);

    let seen = server.requests();
    assert_eq!(seen[0].header("cookie"), None);
    assert_eq!(seen[1].header("cookie"), Some("sid=abc123"));

    // The jar persists what the server set.
    let session = session.unwrap();
    session.save().unwrap();
    let reloaded = Session::load("redirects", dir.path()).unwrap();
    assert_eq!(reloaded.cookies().len(), 1);
    assert_eq!(reloaded.cookies()[0].name, "sid");
}

#[tokio::test]
async fn test_fixed_headers_present() {
    let server = StubServer::start(vec![response_with_body(200, "OK", &[], b"ok")]).await;

    let req = Request::new(normalize_url(&server.url("/")).unwrap());
    let mut session = None;
    execute_with_session(&req, &mut session).await.unwrap();

    let seen = server.requests();
    assert!(seen[0].header("user-agent").unwrap().starts_with("snag/"));
    assert_eq!(seen[0].header("accept-encoding"), Some("gzip, zstd"));
    assert!(seen[0].header("accept").unwrap().contains("application/json"));
}
