//! Transport selection: HTTP/1.1, HTTP/2, or HTTP/3 round-trippers over a
//! freshly dialed conduit.
//!
//! The default preference negotiates h2-or-http/1.1 over ALPN and speaks
//! HTTP/1.1 over cleartext. Forcing HTTP/2 requires TLS (`h2c` stays off);
//! HTTP/3 rides QUIC. Response bodies come back as frame streams so
//! trailers survive for the gRPC adapter, and decompression is left
//! entirely to the response pipeline.

use crate::body::OutBody;
use crate::dial::Dialer;
use crate::error::Error;
use crate::request::HttpVersion;
use crate::timing::ConnMetrics;
use bytes::{Buf, Bytes};
use http::header::{HeaderMap, HeaderValue};
use http::{Method, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Instant;
use tracing::{debug, trace};
use url::{Position, Url};

/// Response body type: a boxed frame stream preserving data and trailers.
pub type InBody = BoxBody<Bytes, std::io::Error>;

fn io_err(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::other(e)
}

enum Sender {
    H1(hyper::client::conn::http1::SendRequest<OutBody>),
    H2(hyper::client::conn::http2::SendRequest<OutBody>),
}

/// One transport per request. A connection is kept for same-origin
/// redirect hops and later retry attempts; anything else redials.
pub struct Transport {
    pub dialer: Dialer,
    pub version: HttpVersion,
    cached: Option<(String, Sender)>,
}

impl Transport {
    pub fn new(dialer: Dialer, version: HttpVersion) -> Self {
        Self {
            dialer,
            version,
            cached: None,
        }
    }

    /// Send one request and return the response with its body still
    /// streaming. Fills in TTFB and connection metrics for the attempt.
    pub async fn round_trip(
        &mut self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: OutBody,
        metrics: &mut ConnMetrics,
    ) -> Result<Response<InBody>, Error> {
        if self.version == HttpVersion::Http3 {
            return self.round_trip_h3(method, url, headers, body, metrics).await;
        }

        let origin = origin_key(url);
        let sender = match self.cached.take() {
            Some((key, sender)) if key == origin && sender_ready(&sender) => {
                metrics.reused = true;
                debug!("reusing connection to {}", origin);
                sender
            }
            _ => self.connect(url, metrics).await?,
        };

        let req = build_request(method, url, headers, matches!(sender, Sender::H1(_)), body)?;

        let ttfb_start = Instant::now();
        metrics.ttfb_start = Some(ttfb_start);
        let response = match sender {
            Sender::H1(mut sender) => {
                let resp = sender.send_request(req).await?;
                self.cached = Some((origin, Sender::H1(sender)));
                resp.map(|b| b.map_err(io_err).boxed())
            }
            Sender::H2(mut sender) => {
                let resp = sender.send_request(req).await?;
                self.cached = Some((origin, Sender::H2(sender)));
                resp.map(|b| b.map_err(io_err).boxed())
            }
        };
        metrics.ttfb_duration = Some(ttfb_start.elapsed());
        trace!("response headers: {:?}", response.headers());
        Ok(response)
    }

    /// Dial and perform the protocol handshake for the configured version.
    async fn connect(&mut self, url: &Url, metrics: &mut ConnMetrics) -> Result<Sender, Error> {
        let tls_url = matches!(url.scheme(), "https" | "wss");

        let alpn: Vec<Vec<u8>> = match self.version {
            HttpVersion::Http1 => vec![b"http/1.1".to_vec()],
            HttpVersion::Http2 => {
                if !tls_url {
                    return Err(Error::Input(
                        "HTTP/2 requires TLS; cleartext h2c is not supported".to_string(),
                    ));
                }
                vec![b"h2".to_vec()]
            }
            _ => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        };

        let conduit = self.dialer.dial(url, &alpn, metrics).await?;
        let negotiated = conduit.alpn();

        let use_h2 = match self.version {
            HttpVersion::Http2 => {
                if negotiated.as_deref() != Some(b"h2") {
                    return Err(Error::Tls(
                        "server did not negotiate HTTP/2 over ALPN".to_string(),
                    ));
                }
                true
            }
            HttpVersion::Http1 => false,
            _ => negotiated.as_deref() == Some(b"h2"),
        };

        if use_h2 {
            let (sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(conduit))
                    .await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("h2 connection closed: {}", e);
                }
            });
            Ok(Sender::H2(sender))
        } else {
            let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(conduit)).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("h1 connection closed: {}", e);
                }
            });
            Ok(Sender::H1(sender))
        }
    }

    /// HTTP/3: QUIC dial (DNS through the resolver), driver task, frame
    /// forwarding through a channel so the response body looks like any
    /// other frame stream.
    async fn round_trip_h3(
        &mut self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        mut body: OutBody,
        metrics: &mut ConnMetrics,
    ) -> Result<Response<InBody>, Error> {
        if url.scheme() != "https" {
            return Err(Error::Input("HTTP/3 requires an https url".to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Input(format!("url has no host: {url}")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let dns_start = Instant::now();
        let addrs = self.dialer.resolver.resolve(&host).await?;
        metrics.dns_start = Some(dns_start);
        metrics.dns_duration = Some(dns_start.elapsed());
        metrics.dns_host = Some(host.clone());
        metrics.dns_addrs = addrs.clone();
        let addr = std::net::SocketAddr::new(addrs[0], port);

        let mut tls = crate::dial::build_tls_config(&self.dialer.tls, &[b"h3".to_vec()])?;
        tls.enable_early_data = true;
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| Error::Tls(format!("quic tls config: {e}")))?;
        let client_config = quinn::ClientConfig::new(std::sync::Arc::new(quic_tls));

        let bind: std::net::SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let mut endpoint = quinn::Endpoint::client(bind)
            .map_err(|e| Error::Connect(format!("quic endpoint: {e}")))?;
        endpoint.set_default_client_config(client_config);

        let tls_start = Instant::now();
        let connection = endpoint
            .connect(addr, &host)
            .map_err(|e| Error::Connect(format!("quic connect {addr}: {e}")))?
            .await
            .map_err(|e| Error::Connect(format!("quic handshake {addr}: {e}")))?;
        metrics.tls_start = Some(tls_start);
        metrics.tls_duration = Some(tls_start.elapsed());
        metrics.tls = Some(crate::timing::TlsInfo {
            version: Some("TLSv1_3".to_string()),
            alpn: Some("h3".to_string()),
            ..Default::default()
        });

        let h3_conn = h3_quinn::Connection::new(connection);
        let (mut driver, mut send_request) = h3::client::new(h3_conn)
            .await
            .map_err(|e| Error::Connect(format!("h3 setup: {e}")))?;
        tokio::spawn(async move {
            let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        let mut builder = Request::builder().method(method.clone()).uri(url.as_str());
        for (name, value) in headers {
            if name != http::header::HOST {
                builder = builder.header(name, value);
            }
        }
        let req = builder
            .body(())
            .map_err(|e| Error::Input(format!("building request: {e}")))?;

        let ttfb_start = Instant::now();
        metrics.ttfb_start = Some(ttfb_start);
        let mut stream = send_request
            .send_request(req)
            .await
            .map_err(|e| Error::Connect(format!("h3 request: {e}")))?;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(Error::Io)?;
            if let Ok(data) = frame.into_data() {
                stream
                    .send_data(data)
                    .await
                    .map_err(|e| Error::Connect(format!("h3 send body: {e}")))?;
            }
        }
        stream
            .finish()
            .await
            .map_err(|e| Error::Connect(format!("h3 finish: {e}")))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| Error::Connect(format!("h3 response: {e}")))?;
        metrics.ttfb_duration = Some(ttfb_start.elapsed());

        // Forward data frames and trailers through a channel; the reader
        // side is an ordinary frame-stream body.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<http_body::Frame<Bytes>, std::io::Error>>(8);
        tokio::spawn(async move {
            loop {
                match stream.recv_data().await {
                    Ok(Some(mut buf)) => {
                        let data = buf.copy_to_bytes(buf.remaining());
                        if tx.send(Ok(http_body::Frame::data(data))).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(io_err(e))).await;
                        return;
                    }
                }
            }
            match stream.recv_trailers().await {
                Ok(Some(trailers)) => {
                    let _ = tx.send(Ok(http_body::Frame::trailers(trailers))).await;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(io_err(e))).await;
                }
            }
        });

        let stream_body = http_body_util::StreamBody::new(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        }));
        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, stream_body.boxed()))
    }
}

fn sender_ready(sender: &Sender) -> bool {
    match sender {
        Sender::H1(s) => s.is_ready(),
        Sender::H2(s) => s.is_ready(),
    }
}

fn origin_key(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or(""),
        url.port_or_known_default().unwrap_or(0)
    )
}

/// Assemble the hyper request. HTTP/1.1 uses origin-form plus a `Host`
/// header; HTTP/2 wants the absolute URI (hyper derives `:authority`).
fn build_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    http1: bool,
    body: OutBody,
) -> Result<Request<OutBody>, Error> {
    let uri: http::Uri = if http1 {
        let origin_form = &url[Position::BeforePath..Position::AfterQuery];
        let origin_form = if origin_form.is_empty() { "/" } else { origin_form };
        origin_form
            .parse()
            .map_err(|e| Error::Input(format!("invalid request path: {e}")))?
    } else {
        url.as_str()
            .parse()
            .map_err(|e| Error::Input(format!("invalid request url: {e}")))?
    };

    let mut builder = Request::builder().method(method.clone()).uri(uri);
    if http1 && !headers.contains_key(http::header::HOST) {
        builder = builder.header(
            http::header::HOST,
            HeaderValue::from_str(url.authority())
                .map_err(|e| Error::Input(format!("invalid host: {e}")))?,
        );
    }
    for (name, value) in headers {
        if !http1 && name == http::header::HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map_err(|e| Error::Input(format!("building request: {e}")))
}
