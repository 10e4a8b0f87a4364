//! Error taxonomy and exit-code mapping.
//!
//! Errors fall into the kinds the retry engine cares about: fatal input
//! problems, transient network failures, TLS trust failures (never retried),
//! gRPC logical errors surfaced after the body is drained, and output-side
//! failures. Classification always unwraps inner causes first so a
//! `hyper::Error` wrapping an I/O timeout is judged by the timeout.

use std::time::Duration;
use thiserror::Error;

/// Top-level error for one invocation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Input(String),

    #[error("invalid session name {0:?}: must match [A-Za-z0-9_-]+")]
    SessionName(String),

    #[error("loading protobuf schema: {0}")]
    Schema(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("dns: {0}")]
    Dns(String),

    #[error("connect: {0}")]
    Connect(String),

    #[error("tls: {0}")]
    Tls(String),

    /// Certificate-invalid / hostname-mismatch / unknown-authority.
    /// Never retried; the hint nudges toward `--insecure`.
    #[error("tls certificate verification failed: {0} (use --insecure to skip verification)")]
    CertTrust(String),

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),

    #[error("grpc error {code}: {message}")]
    Grpc { code: u32, message: String },

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("{0}")]
    Output(String),

    #[error("request canceled")]
    Canceled,
}

impl Error {
    /// All core (non-HTTP-status) errors exit 1. HTTP status exit codes
    /// (4/5/6) are computed by the response pipeline, not here.
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Whether the retry engine may run another attempt after this error.
    ///
    /// Cancellation and TLS trust failures are terminal. Timeouts, DNS,
    /// connect and generic I/O errors are transient. `hyper` errors are
    /// unwrapped down to their source before judging.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Canceled | Error::CertTrust(_) => false,
            Error::TimedOut(_) | Error::Dns(_) | Error::Connect(_) => true,
            Error::Io(e) => io_error_retryable(e),
            Error::Http(e) => hyper_error_retryable(e),
            Error::Tls(_) => true,
            _ => false,
        }
    }
}

/// Short reason string for the retry log line.
pub fn retry_reason(err: &Error) -> String {
    match err {
        Error::TimedOut(d) => format!("timeout after {:.1?}", d),
        Error::Dns(_) => "dns error".to_string(),
        Error::Connect(_) => "connection error".to_string(),
        other => other.to_string(),
    }
}

fn io_error_retryable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
            | ErrorKind::Interrupted
    )
}

fn hyper_error_retryable(err: &hyper::Error) -> bool {
    if err.is_canceled() {
        return false;
    }
    if err.is_timeout() || err.is_incomplete_message() || err.is_closed() {
        return true;
    }
    // Walk the source chain: a wrapped io::Error decides for itself.
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return io_error_retryable(io);
        }
        source = cause.source();
    }
    false
}
