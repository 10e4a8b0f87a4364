//! Response-pipeline integration tests: transparent decoding, exit codes,
//! and output-to-file through the real present() path.

mod common;

use common::{response_with_body, StubServer};
use snag::client;
use snag::format::Registry;
use snag::output::{self, PresentOptions};
use snag::request::{normalize_url, OutputTarget, PreparedParts, Request};
use snag::term::TermEnv;
use tokio_util::sync::CancellationToken;

async fn fetch(req: &Request) -> (client::Exchange, PreparedParts) {
    let parts = snag::request::build_parts(req).unwrap();
    let (body, _) = client::materialize_body(req.body.as_ref()).await.unwrap();
    let mut transport = client::build_transport(req).unwrap();
    let mut session = None;
    let exchange = client::execute(
        req,
        &parts,
        body,
        &mut transport,
        &mut session,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    (exchange, parts)
}

async fn gzip(data: &[u8]) -> Vec<u8> {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await.unwrap();
    encoder.shutdown().await.unwrap();
    encoder.into_inner()
}

#[tokio::test]
async fn test_gzip_response_decoded_to_file() {
    let compressed = gzip(b"decompressed payload").await;
    let response = response_with_body(
        200,
        "OK",
        &[("Content-Encoding", "gzip")],
        &compressed,
    );
    let server = StubServer::start(vec![response]).await;

    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("out.txt");

    let mut req = Request::new(normalize_url(&server.url("/data.gz")).unwrap());
    req.output = OutputTarget::Path(target.clone());

    let (exchange, parts) = fetch(&req).await;
    assert!(parts.encoding_requested);

    let env = TermEnv::plain();
    let registry = Registry::with_defaults();
    let code = output::present(
        exchange,
        PresentOptions {
            req: &req,
            env: &env,
            registry: &registry,
            grpc_method: None,
            parts: &parts,
        },
    )
    .await
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(std::fs::read(&target).unwrap(), b"decompressed payload");
}

#[tokio::test]
async fn test_exit_codes_from_status() {
    for (status, reason, expected) in [
        (200u16, "OK", 0),
        (404, "Not Found", 4),
        (500, "Internal Server Error", 5),
    ] {
        let server =
            StubServer::start(vec![response_with_body(status, reason, &[], b"body")]).await;
        let mut req = Request::new(normalize_url(&server.url("/")).unwrap());
        req.discard = true;

        let (exchange, parts) = fetch(&req).await;
        let env = TermEnv::plain();
        let registry = Registry::with_defaults();
        let code = output::present(
            exchange,
            PresentOptions {
                req: &req,
                env: &env,
                registry: &registry,
                grpc_method: None,
                parts: &parts,
            },
        )
        .await
        .unwrap();
        assert_eq!(code, expected, "status {status}");
    }
}

#[tokio::test]
async fn test_ignore_status_forces_zero() {
    let server =
        StubServer::start(vec![response_with_body(503, "Service Unavailable", &[], b"x")]).await;
    let mut req = Request::new(normalize_url(&server.url("/")).unwrap());
    req.discard = true;
    req.ignore_status = true;

    let (exchange, parts) = fetch(&req).await;
    let env = TermEnv::plain();
    let registry = Registry::with_defaults();
    let code = output::present(
        exchange,
        PresentOptions {
            req: &req,
            env: &env,
            registry: &registry,
            grpc_method: None,
            parts: &parts,
        },
    )
    .await
    .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_clobber_guard_on_existing_file() {
    let server = StubServer::start(vec![response_with_body(200, "OK", &[], b"new")]).await;

    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("present.txt");
    std::fs::write(&target, b"old").unwrap();

    let mut req = Request::new(normalize_url(&server.url("/present.txt")).unwrap());
    req.output = OutputTarget::Path(target.clone());

    let (exchange, parts) = fetch(&req).await;
    let env = TermEnv::plain();
    let registry = Registry::with_defaults();
    let err = output::present(
        exchange,
        PresentOptions {
            req: &req,
            env: &env,
            registry: &registry,
            grpc_method: None,
            parts: &parts,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, snag::error::Error::Output(_)));
    assert_eq!(std::fs::read(&target).unwrap(), b"old");
}
