//! gRPC over HTTP/2: framing, dynamic protobuf conversion, trailer status.
//!
//! The adapter maps the URL path `/package.Service/Method` to a method
//! descriptor from a loaded schema (a `FileDescriptorSet` file, or `.proto`
//! sources compiled through the external `protoc`), converts JSON bodies to
//! protobuf leniently (unknown fields are discarded), frames messages with
//! the 5-byte length prefix, and decodes `Grpc-Status` / `Grpc-Message`
//! after the body has been fully consumed — from headers when the server
//! answered trailers-only.

use crate::body::RequestBody;
use crate::error::Error;
use crate::request::SchemaSource;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue};
use prost::Message as _;
use prost_reflect::{DescriptorPool, DeserializeOptions, DynamicMessage, MethodDescriptor};
use serde::Serialize as _;
use std::process::Command;
use tracing::debug;

/// Frames above this are rejected rather than buffered.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Canonical gRPC status-code names, indexed by code.
const STATUS_NAMES: &[&str] = &[
    "OK",
    "Canceled",
    "Unknown",
    "InvalidArgument",
    "DeadlineExceeded",
    "NotFound",
    "AlreadyExists",
    "PermissionDenied",
    "ResourceExhausted",
    "FailedPrecondition",
    "Aborted",
    "OutOfRange",
    "Unimplemented",
    "Internal",
    "Unavailable",
    "DataLoss",
    "Unauthenticated",
];

pub fn status_name(code: u32) -> &'static str {
    STATUS_NAMES.get(code as usize).copied().unwrap_or("Unknown")
}

/// Load the descriptor pool from the configured schema source.
pub fn load_schema(source: &SchemaSource) -> Result<DescriptorPool, Error> {
    match source {
        SchemaSource::DescriptorSet(path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| Error::Schema(format!("reading {}: {e}", path.display())))?;
            DescriptorPool::decode(Bytes::from(bytes))
                .map_err(|e| Error::Schema(format!("decoding {}: {e}", path.display())))
        }
        SchemaSource::ProtoFiles { files, imports } => compile_protos(files, imports),
    }
}

/// Shell out to `protoc` for `.proto` sources; imports become `-I` flags.
fn compile_protos(
    files: &[std::path::PathBuf],
    imports: &[std::path::PathBuf],
) -> Result<DescriptorPool, Error> {
    let out = tempfile::NamedTempFile::new()
        .map_err(|e| Error::Schema(format!("creating descriptor temp file: {e}")))?;

    let mut cmd = Command::new("protoc");
    cmd.arg(format!("--descriptor_set_out={}", out.path().display()))
        .arg("--include_imports");
    for dir in imports {
        cmd.arg("-I").arg(dir);
    }
    // Default the include path to each file's directory so bare invocations
    // work without -I.
    if imports.is_empty() {
        for file in files {
            if let Some(parent) = file.parent() {
                cmd.arg("-I").arg(parent);
            }
        }
    }
    for file in files {
        cmd.arg(file);
    }

    let output = cmd
        .output()
        .map_err(|e| Error::Schema(format!("running protoc: {e}")))?;
    if !output.status.success() {
        return Err(Error::Schema(format!(
            "protoc failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let bytes = std::fs::read(out.path())
        .map_err(|e| Error::Schema(format!("reading descriptor set: {e}")))?;
    DescriptorPool::decode(Bytes::from(bytes))
        .map_err(|e| Error::Schema(format!("decoding descriptor set: {e}")))
}

/// Resolve `/package.Service/Method` against the pool.
pub fn resolve_method(pool: &DescriptorPool, url_path: &str) -> Result<MethodDescriptor, Error> {
    let trimmed = url_path.trim_matches('/');
    let (service_name, method_name) = trimmed.split_once('/').ok_or_else(|| {
        Error::Input(format!(
            "grpc url path must be /package.Service/Method, got {url_path:?}"
        ))
    })?;

    let service = pool
        .services()
        .find(|s| s.full_name() == service_name)
        .ok_or_else(|| Error::Schema(format!("service {service_name:?} not found in schema")))?;
    let method = service.methods().find(|m| m.name() == method_name);
    method.ok_or_else(|| {
        Error::Schema(format!(
            "method {method_name:?} not found on {service_name}"
        ))
    })
}

/// Headers every gRPC request carries. HTTP/2 and POST are forced by the
/// caller before this point.
pub fn apply_headers(headers: &mut HeaderMap) {
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc+proto"),
    );
    headers.insert(http::header::TE, HeaderValue::from_static("trailers"));
    headers.insert(
        "grpc-accept-encoding",
        HeaderValue::from_static("identity"),
    );
}

/// Wrap one encoded message in the 5-byte frame: compression flag 0 plus
/// big-endian length.
pub fn encode_frame(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + message.len());
    out.push(0);
    out.put_u32(message.len() as u32);
    out.extend_from_slice(message);
    out
}

/// Build the request body for the call. Unary methods send one frame;
/// client-streaming methods frame each top-level JSON value, with an
/// unknown content length so the transfer is chunked.
pub fn build_body(method: &MethodDescriptor, json: &[u8]) -> Result<RequestBody, Error> {
    let input = method.input();

    if method.is_client_streaming() {
        let mut frames = Vec::new();
        let mut count = 0usize;
        let stream = serde_json::Deserializer::from_slice(json).into_iter::<serde_json::Value>();
        for value in stream {
            let value = value.map_err(|e| Error::Input(format!("invalid grpc json body: {e}")))?;
            let msg = json_to_message(&input, &value)?;
            frames.extend_from_slice(&encode_frame(&msg.encode_to_vec()));
            count += 1;
        }
        debug!("grpc client stream: {} frame(s)", count);
        let reader: crate::body::ByteReader = Box::pin(std::io::Cursor::new(frames));
        return Ok(RequestBody::from_stream(reader, None));
    }

    let value: serde_json::Value = if json.iter().all(|b| b.is_ascii_whitespace()) {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(json).map_err(|e| Error::Input(format!("invalid grpc json body: {e}")))?
    };
    let msg = json_to_message(&input, &value)?;
    Ok(RequestBody::from_bytes(encode_frame(&msg.encode_to_vec())))
}

/// Lenient JSON-to-protobuf: unknown fields are dropped, not rejected.
fn json_to_message(
    desc: &prost_reflect::MessageDescriptor,
    value: &serde_json::Value,
) -> Result<DynamicMessage, Error> {
    let options = DeserializeOptions::new().deny_unknown_fields(false);
    DynamicMessage::deserialize_with_options(desc.clone(), value.clone(), &options)
        .map_err(|e| Error::Input(format!("grpc body does not match {}: {e}", desc.full_name())))
}

/// Incremental decoder for length-prefixed response frames.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame payload, if any.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, Error> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let compressed = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if compressed != 0 {
            return Err(Error::Input(
                "compressed grpc frames are not supported".to_string(),
            ));
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::Input(format!(
                "grpc frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        if self.buf.len() < 5 + len {
            return Ok(None);
        }
        self.buf.advance(5);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Leftover bytes that never formed a complete frame.
    pub fn residue(&self) -> usize {
        self.buf.len()
    }
}

/// Decode one response message to pretty JSON.
pub fn decode_message(method: &MethodDescriptor, frame: &[u8]) -> Result<String, Error> {
    let msg = DynamicMessage::decode(method.output(), frame)
        .map_err(|e| Error::Input(format!("decoding grpc response message: {e}")))?;
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::pretty(&mut out);
    msg.serialize(&mut serializer)
        .map_err(|e| Error::Input(format!("rendering grpc response: {e}")))?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Read `Grpc-Status` / `Grpc-Message` once the body is drained. The status
/// lives in the trailers normally, or in the headers for a trailers-only
/// response. A non-zero status is a logical error with exit code >= 1.
pub fn check_status(headers: &HeaderMap, trailers: Option<&HeaderMap>) -> Result<(), Error> {
    let source = if headers.contains_key("grpc-status") {
        headers
    } else {
        match trailers {
            Some(t) => t,
            None => return Ok(()),
        }
    };

    let Some(status) = source.get("grpc-status") else {
        return Ok(());
    };
    let code: u32 = status
        .to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);
    if code == 0 {
        return Ok(());
    }

    let message = source
        .get("grpc-message")
        .and_then(|v| v.to_str().ok())
        .map(|m| {
            percent_encoding::percent_decode_str(m)
                .decode_utf8_lossy()
                .into_owned()
        })
        .unwrap_or_default();

    Err(Error::Grpc {
        code,
        message: if message.is_empty() {
            status_name(code).to_string()
        } else {
            format!("{} ({})", message, status_name(code))
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let framed = encode_frame(b"payload");
        assert_eq!(framed[0], 0);
        assert_eq!(&framed[1..5], &7u32.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.push(&framed[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&framed[3..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"payload");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.residue(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut header = vec![0u8];
        header.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        decoder.push(&header);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_compressed_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[1, 0, 0, 0, 1, 0xFF]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_method_path_parsing_errors() {
        let pool = DescriptorPool::new();
        assert!(matches!(
            resolve_method(&pool, "/not-a-method"),
            Err(Error::Input(_))
        ));
        assert!(matches!(
            resolve_method(&pool, "/pkg.Svc/Call"),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_grpc_headers() {
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers);
        assert_eq!(headers.get("content-type").unwrap(), "application/grpc+proto");
        assert_eq!(headers.get("te").unwrap(), "trailers");
        assert_eq!(headers.get("grpc-accept-encoding").unwrap(), "identity");
    }

    #[test]
    fn test_status_from_trailers() {
        let headers = HeaderMap::new();
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        assert!(check_status(&headers, Some(&trailers)).is_ok());

        trailers.insert("grpc-status", HeaderValue::from_static("14"));
        trailers.insert(
            "grpc-message",
            HeaderValue::from_static("connection%20refused"),
        );
        let err = check_status(&headers, Some(&trailers)).unwrap_err();
        match err {
            Error::Grpc { code, message } => {
                assert_eq!(code, 14);
                assert!(message.contains("connection refused"));
                assert!(message.contains("Unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_trailers_only_status_in_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("12"));
        let err = check_status(&headers, None).unwrap_err();
        assert!(matches!(err, Error::Grpc { code: 12, .. }));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(0), "OK");
        assert_eq!(status_name(14), "Unavailable");
        assert_eq!(status_name(99), "Unknown");
    }
}
