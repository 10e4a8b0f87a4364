//! Request body materialization and replay.
//!
//! The retry engine and redirect follower both need to send the same bytes
//! more than once. In-memory bodies replay trivially; file bodies replay by
//! reopening from the start; one-shot streams (multipart pipes, gRPC client
//! streams) are buffered into memory up front when replay might be needed.
//!
//! Invariant: every fresh [`RequestBody::take_http`] call yields a body
//! that reads identical bytes to the previous one.

use crate::error::Error;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;

/// The body type handed to the transports.
pub type OutBody = BoxBody<Bytes, std::io::Error>;

/// A boxed one-shot byte source (pipe read end, generated stream).
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// A request body that can produce an HTTP body per attempt.
pub enum RequestBody {
    Empty,
    /// In-memory bytes, replayable any number of times.
    Bytes(Bytes),
    /// Streamed from disk; replay reopens the file. The length was
    /// determined by stat at materialization time.
    File { path: PathBuf, len: u64 },
    /// A one-shot stream. `None` after it has been taken.
    Stream {
        reader: Option<ByteReader>,
        len: Option<u64>,
    },
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Empty
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        RequestBody::Bytes(data.into())
    }

    /// Stat the file now so the transport can set `Content-Length`.
    pub async fn from_file(path: PathBuf) -> Result<Self, Error> {
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            Error::Input(format!("cannot read body file {}: {e}", path.display()))
        })?;
        Ok(RequestBody::File {
            path,
            len: meta.len(),
        })
    }

    pub fn from_stream(reader: ByteReader, len: Option<u64>) -> Self {
        RequestBody::Stream {
            reader: Some(reader),
            len,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Known content length, when there is one.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::File { len, .. } => Some(*len),
            RequestBody::Stream { len, .. } => *len,
        }
    }

    /// Whether another attempt can read the same bytes again.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream { .. })
    }

    /// Drain a one-shot stream into memory so later attempts can replay it.
    /// Replayable variants are untouched.
    pub async fn make_replayable(&mut self) -> Result<(), Error> {
        if let RequestBody::Stream { reader, .. } = self {
            let mut reader = reader
                .take()
                .ok_or_else(|| Error::Input("request body already consumed".to_string()))?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            *self = RequestBody::Bytes(buf.into());
        }
        Ok(())
    }

    /// Payload hash for SigV4 without consuming the body, where possible.
    /// Returns `None` for one-shot streams; the caller decides between
    /// `UNSIGNED-PAYLOAD` (S3) and buffering.
    pub async fn sha256_hex(&self) -> Result<Option<String>, Error> {
        match self {
            RequestBody::Empty => Ok(Some(crate::sigv4::EMPTY_SHA256.to_string())),
            RequestBody::Bytes(b) => Ok(Some(hex::encode(Sha256::digest(b)))),
            RequestBody::File { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(Some(hex::encode(hasher.finalize())))
            }
            RequestBody::Stream { .. } => Ok(None),
        }
    }

    /// Produce the HTTP body for one attempt. Replayable variants can be
    /// taken repeatedly; a one-shot stream errors the second time.
    pub fn take_http(&mut self) -> Result<OutBody, Error> {
        match self {
            RequestBody::Empty => Ok(Empty::new().map_err(|never| match never {}).boxed()),
            RequestBody::Bytes(b) => Ok(Full::new(b.clone()).map_err(|never| match never {}).boxed()),
            RequestBody::File { path, .. } => {
                let path = path.clone();
                // Opening lazily keeps take_http sync; open errors surface
                // as body read errors on the connection.
                let stream = futures::stream::once(async move {
                    tokio::fs::File::open(path).await.map(ReaderStream::new)
                })
                .try_flatten()
                .map_ok(http_body::Frame::data);
                Ok(StreamBody::new(stream).boxed())
            }
            RequestBody::Stream { reader, .. } => {
                let reader = reader
                    .take()
                    .ok_or_else(|| Error::Input("request body cannot be replayed".to_string()))?;
                let stream = ReaderStream::new(reader).map_ok(http_body::Frame::data);
                Ok(StreamBody::new(stream).boxed())
            }
        }
    }
}
