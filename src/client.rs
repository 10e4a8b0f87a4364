//! Request execution: the attempt loop with retries, redirects, cookies,
//! signing, and per-attempt timeouts.
//!
//! One invocation runs `max(1, retry+1)` attempts. Each attempt follows
//! redirects under the configured cap, applies session cookies per hop,
//! signs per hop (SigV4 sees the finalized headers, including `Cookie`),
//! and classifies the outcome: transient network errors and 429/502/503/504
//! feed the backoff; everything else is terminal. Backoff is exponential
//! with +/-25% jitter, capped at 30s, and floored by `Retry-After`.

use crate::body::RequestBody;
use crate::dial::{Dialer, TlsParams};
use crate::error::{retry_reason, Error};
use crate::multipart;
use crate::request::{Auth, BodySource, PreparedParts, Request};
use crate::resolver::Resolver;
use crate::session::Session;
use crate::sigv4;
use crate::timing::ConnMetrics;
use crate::transport::{InBody, Transport};
use chrono::Utc;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The terminal attempt's result, handed to the response pipeline.
#[derive(Debug)]
pub struct Exchange {
    pub response: http::Response<InBody>,
    pub url: Url,
    pub metrics: ConnMetrics,
    pub had_redirects: bool,
    pub attempts: u32,
}

/// Materialize the request body from its selector. Multipart returns its
/// content type alongside, since only the producer knows the boundary.
pub async fn materialize_body(
    source: Option<&BodySource>,
) -> Result<(RequestBody, Option<String>), Error> {
    match source {
        None => Ok((RequestBody::empty(), None)),
        Some(BodySource::Raw(data)) => Ok((RequestBody::from_bytes(data.clone()), None)),
        Some(BodySource::Json(data)) | Some(BodySource::Xml(data)) => {
            Ok((RequestBody::from_bytes(data.clone()), None))
        }
        Some(BodySource::Form(pairs)) => {
            let encoded = serde_urlencoded::to_string(pairs)
                .map_err(|e| Error::Input(format!("encoding form body: {e}")))?;
            Ok((RequestBody::from_bytes(encoded), None))
        }
        Some(BodySource::Multipart(fields)) => {
            let stream = multipart::stream(fields.clone());
            Ok((stream.body, Some(stream.content_type)))
        }
        Some(BodySource::File(path)) => {
            Ok((RequestBody::from_file(path.clone()).await?, None))
        }
        Some(BodySource::GrpcJson(_)) => Err(Error::Input(
            "gRPC bodies are framed by the gRPC adapter, not sent directly".to_string(),
        )),
    }
}

/// Build the transport stack described by the request.
pub fn build_transport(req: &Request) -> Result<Transport, Error> {
    let resolver = Resolver::new(req.dns_server.as_deref())?;
    let dialer = Dialer {
        resolver,
        connect_timeout: req.connect_timeout,
        unix_socket: req.unix_socket.clone(),
        tls: TlsParams {
            floor: req.tls_floor,
            insecure: req.insecure,
            ca_certs: req.ca_certs.clone(),
            client_cert: req.client_cert.clone(),
        },
    };
    Ok(Transport::new(dialer, req.http_version))
}

/// Run the attempt loop to completion.
pub async fn execute(
    req: &Request,
    parts: &PreparedParts,
    mut body: RequestBody,
    transport: &mut Transport,
    session: &mut Option<Session>,
    cancel: &CancellationToken,
) -> Result<Exchange, Error> {
    let max_attempts = req.retries.saturating_add(1).max(1);

    // A replayable body exists only when retries are enabled: seekable
    // bodies replay in place, one-shot streams get buffered once.
    if max_attempts > 1 {
        body.make_replayable().await?;
    }

    let mut last_err: Option<Error> = None;
    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let attempt_fut = run_attempt(req, parts, &mut body, transport, session, cancel);
        let outcome = match req.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, attempt_fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::TimedOut(timeout)),
                }
            }
            None => attempt_fut.await,
        };

        let (retryable, retry_after, err) = match outcome {
            Ok(mut exchange) => {
                exchange.attempts = attempt + 1;
                let status = exchange.response.status();
                let retryable = matches!(
                    status,
                    StatusCode::TOO_MANY_REQUESTS
                        | StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                );
                if !retryable || attempt + 1 >= max_attempts {
                    return Ok(exchange);
                }
                let retry_after = parse_retry_after(exchange.response.headers());
                drain(exchange.response.into_body()).await;
                (true, retry_after, Error::Input(format!("server returned {status}")))
            }
            Err(e) => {
                let retryable = e.is_retryable() && !cancel.is_cancelled();
                if !retryable || attempt + 1 >= max_attempts {
                    return Err(e);
                }
                (true, None, e)
            }
        };
        debug_assert!(retryable);

        let delay = backoff_delay(attempt, req.retry_delay, retry_after);
        info!(
            "attempt {}/{} in {:?} ({})",
            attempt + 2,
            max_attempts,
            delay,
            retry_reason(&err)
        );
        last_err = Some(err);

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Err(last_err.unwrap_or(Error::Canceled))
}

/// One attempt: the redirect-following loop.
async fn run_attempt(
    req: &Request,
    parts: &PreparedParts,
    body: &mut RequestBody,
    transport: &mut Transport,
    session: &mut Option<Session>,
    cancel: &CancellationToken,
) -> Result<Exchange, Error> {
    let mut url = parts.url.clone();
    let mut method = parts.method.clone();
    let mut send_body = true;
    let mut hops: u32 = 0;
    let mut had_redirects = false;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let mut headers = parts.headers.clone();

        // Redirects away from the original host drop credentials.
        if url.host_str() != parts.url.host_str() {
            headers.remove(http::header::AUTHORIZATION);
        }

        if let Some(session) = session.as_ref() {
            if let Some(cookie) = session.cookie_header(&url) {
                headers.insert(
                    http::header::COOKIE,
                    HeaderValue::from_str(&cookie)
                        .map_err(|e| Error::Input(format!("invalid cookie value: {e}")))?,
                );
            }
        }

        // Explicit Content-Length for bodies hyper cannot size itself
        // (file streams).
        if send_body {
            if let Some(len) = body.len() {
                if len > 0 && !headers.contains_key(http::header::CONTENT_LENGTH) {
                    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
                }
            }
        } else {
            headers.remove(http::header::CONTENT_LENGTH);
            headers.remove(http::header::CONTENT_TYPE);
        }

        // SigV4 signs last, over the final header set for this hop.
        if let Some(Auth::AwsSigV4(cfg)) = &req.auth {
            if url.host_str() == parts.url.host_str() {
                let hash = payload_hash(body, &headers, &cfg.service, send_body).await?;
                sigv4::sign(&method, &url, &mut headers, &hash, cfg, Utc::now())?;
            }
        }

        let http_body = if send_body {
            body.take_http()?
        } else {
            RequestBody::empty().take_http()?
        };

        let mut metrics = ConnMetrics::default();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            r = transport.round_trip(&method, &url, &headers, http_body, &mut metrics) => r?,
        };

        if let Some(session) = session.as_mut() {
            for value in response.headers().get_all(http::header::SET_COOKIE) {
                if let Ok(value) = value.to_str() {
                    session.record_set_cookie(&url, value);
                }
            }
        }

        let status = response.status();
        if status.is_redirection() {
            if let Some(location) = response.headers().get(http::header::LOCATION) {
                // --redirects 0 returns the redirect response unfollowed;
                // no cap configured follows forever.
                if req.redirects == Some(0) {
                    return Ok(Exchange {
                        response,
                        url,
                        metrics,
                        had_redirects,
                        attempts: 0,
                    });
                }
                if let Some(cap) = req.redirects {
                    if hops >= cap {
                        return Err(Error::TooManyRedirects(cap));
                    }
                }

                let location = location
                    .to_str()
                    .map_err(|e| Error::Input(format!("invalid Location header: {e}")))?;
                let next = url
                    .join(location)
                    .map_err(|e| Error::Input(format!("invalid redirect target {location:?}: {e}")))?;
                debug!("redirect {} -> {}", status, next);
                had_redirects = true;
                hops += 1;

                // 303 (and 301/302, by convention) demote to GET and drop
                // the body; 307/308 must replay it.
                match status {
                    StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
                        if send_body && !body.is_replayable() {
                            return Err(Error::Input(
                                "cannot follow redirect: request body cannot be replayed"
                                    .to_string(),
                            ));
                        }
                    }
                    _ => {
                        if method != Method::HEAD {
                            method = Method::GET;
                        }
                        send_body = false;
                    }
                }

                drain(response.into_body()).await;
                url = next;
                continue;
            }
            warn!("{} response without a Location header", status);
        }

        return Ok(Exchange {
            response,
            url,
            metrics,
            had_redirects,
            attempts: 0,
        });
    }
}

/// The payload-hash ladder: an existing `X-Amz-Content-Sha256` wins, then
/// the empty-body constant, then hashing a replayable/seekable body. A
/// one-shot stream becomes `UNSIGNED-PAYLOAD` for S3, and is buffered into
/// memory for every other service.
async fn payload_hash(
    body: &mut RequestBody,
    headers: &HeaderMap,
    service: &str,
    send_body: bool,
) -> Result<String, Error> {
    if let Some(existing) = headers.get("x-amz-content-sha256") {
        return Ok(existing
            .to_str()
            .map_err(|e| Error::Input(format!("invalid x-amz-content-sha256: {e}")))?
            .to_string());
    }
    if !send_body || body.is_empty() {
        return Ok(sigv4::EMPTY_SHA256.to_string());
    }
    if let Some(hash) = body.sha256_hex().await? {
        return Ok(hash);
    }
    if service == "s3" {
        return Ok(sigv4::UNSIGNED_PAYLOAD.to_string());
    }
    body.make_replayable().await?;
    body.sha256_hex()
        .await?
        .ok_or_else(|| Error::Input("request body cannot be hashed for signing".to_string()))
}

/// Exponential backoff with multiplicative +/-25% jitter, capped at 30s,
/// floored by the server's `Retry-After`.
pub fn backoff_delay(attempt: u32, initial: Duration, retry_after: Option<Duration>) -> Duration {
    let base = initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    let computed = base.mul_f64(jitter);
    match retry_after {
        Some(ra) if ra > computed => ra,
        _ => computed,
    }
}

/// Parse `Retry-After`: delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = when.signed_duration_since(Utc::now());
    delta.to_std().ok()
}

/// Read a response body to completion and drop it, so the connection can
/// be reused (or closed cleanly) before the next attempt.
async fn drain(mut body: InBody) {
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}
