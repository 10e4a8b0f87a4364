//! WebSocket sessions.
//!
//! The upgrade handshake rides the same dialer as every HTTP request (so
//! DNS, TLS policy and unix sockets all apply) and is bounded by the
//! per-attempt timeout. After the upgrade, the loop is bidirectional: with
//! piped or file stdin a writer task sends each non-empty line as a text
//! frame; with a terminal (or no) stdin only the reader runs. Stdin EOF
//! grants the server a two-second drain window. Cancellation closes the
//! connection with a normal-closure status.

use crate::dial::Dialer;
use crate::error::Error;
use crate::request::{PreparedParts, Request};
use crate::term::TermEnv;
use crate::timing::ConnMetrics;
use futures::{SinkExt, StreamExt};
use std::io::Write as _;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Server drain window after stdin EOF.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// Headers that make sense on an upgrade request. The HTTP content
/// negotiation set does not.
const SKIPPED: &[http::header::HeaderName] = &[
    http::header::ACCEPT,
    http::header::ACCEPT_ENCODING,
    http::header::CONTENT_TYPE,
    http::header::CONTENT_LENGTH,
];

/// Run one WebSocket session to completion. Returns the process exit code.
pub async fn run_session(
    req: &Request,
    parts: &PreparedParts,
    dialer: &Dialer,
    cancel: &CancellationToken,
    env: &TermEnv,
) -> Result<i32, Error> {
    let url = ws_url(&parts.url)?;

    let mut metrics = ConnMetrics::default();
    let conduit = dialer
        .dial(&url, &[b"http/1.1".to_vec()], &mut metrics)
        .await?;

    let mut builder = http::Request::builder().method(http::Method::GET).uri(url.as_str());
    builder = builder.header(http::header::HOST, url.authority());
    for (name, value) in &parts.headers {
        if !SKIPPED.contains(name) {
            builder = builder.header(name, value);
        }
    }
    let handshake_req = builder
        .body(())
        .map_err(|e| Error::WebSocket(format!("building upgrade request: {e}")))?;

    // Timeout covers the handshake only; the session itself is unbounded.
    let handshake = tokio_tungstenite::client_async(handshake_req, conduit);
    let (ws, response) = match req.timeout {
        Some(t) => tokio::time::timeout(t, handshake)
            .await
            .map_err(|_| Error::TimedOut(t))?,
        None => handshake.await,
    }
    .map_err(|e| Error::WebSocket(e.to_string()))?;

    if let Some(proto) = response.headers().get("sec-websocket-protocol") {
        debug!("negotiated subprotocol: {:?}", proto);
    }

    let (mut sink, mut stream) = ws.split();

    // Initial message: the request body, sent once before the loop.
    if let Some(initial) = initial_message(req) {
        sink.send(initial)
            .await
            .map_err(|e| Error::WebSocket(format!("sending initial message: {e}")))?;
    }

    // Writer: lines from piped/file stdin. A terminal stdin means
    // reader-only operation. Channel close doubles as the EOF signal.
    let mut writer_rx = if !env.stdin_tty {
        let session_cancel = cancel.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<String>(16);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = session_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !line.is_empty() && tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                }
            }
        });
        Some(rx)
    } else {
        None
    };

    let mut stdout = std::io::stdout();
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    loop {
        let drain_sleep = async move {
            match drain_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                close_normally(&mut sink).await;
                return Ok(0);
            }
            _ = drain_sleep => {
                debug!("drain window elapsed after stdin EOF");
                close_normally(&mut sink).await;
                return Ok(0);
            }
            line = recv_line(&mut writer_rx) => {
                match line {
                    Some(line) => {
                        sink.send(Message::Text(line))
                            .await
                            .map_err(|e| Error::WebSocket(format!("send: {e}")))?;
                    }
                    None => {
                        // Stdin EOF: stop writing, grant the drain window.
                        writer_rx = None;
                        drain_deadline = Some(tokio::time::Instant::now() + DRAIN_WINDOW);
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    None => return Ok(0),
                    Some(Err(e)) => return Err(Error::WebSocket(e.to_string())),
                    Some(Ok(Message::Text(text))) => {
                        writeln!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        stdout.write_all(&data)?;
                        stdout.flush()?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("server closed: {:?}", frame);
                        return Ok(0);
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn recv_line(rx: &mut Option<tokio::sync::mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn close_normally<S>(sink: &mut S)
where
    S: futures::Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if sink.send(Message::Close(Some(frame))).await.is_err() {
        warn!("connection dropped before close frame");
    }
}

/// Map the request scheme onto ws/wss.
fn ws_url(url: &Url) -> Result<Url, Error> {
    let mut url = url.clone();
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::Input(format!(
                "cannot open a websocket over {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Input("invalid websocket url".to_string()))?;
    Ok(url)
}

/// The request body becomes one initial frame: UTF-8 text when it decodes,
/// binary otherwise.
fn initial_message(req: &Request) -> Option<Message> {
    use crate::request::BodySource;
    let data = match req.body.as_ref()? {
        BodySource::Raw(data) | BodySource::Json(data) | BodySource::Xml(data) => data.clone(),
        _ => return None,
    };
    if data.is_empty() {
        return None;
    }
    Some(match String::from_utf8(data) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_mapping() {
        let map = |s: &str| ws_url(&Url::parse(s).unwrap()).unwrap().scheme().to_string();
        assert_eq!(map("http://example.com/ws"), "ws");
        assert_eq!(map("https://example.com/ws"), "wss");
        assert_eq!(map("wss://example.com/ws"), "wss");
        assert!(ws_url(&Url::parse("ftp://example.com/").unwrap()).is_err());
    }

    #[test]
    fn test_initial_message_from_body() {
        let mut req = Request::new(Url::parse("wss://example.com/").unwrap());
        assert!(initial_message(&req).is_none());

        req.body = Some(crate::request::BodySource::Raw(b"hello".to_vec()));
        match initial_message(&req) {
            Some(Message::Text(t)) => assert_eq!(t, "hello"),
            other => panic!("unexpected: {other:?}"),
        }

        req.body = Some(crate::request::BodySource::Raw(vec![0xFF, 0xFE]));
        assert!(matches!(initial_message(&req), Some(Message::Binary(_))));
    }
}
