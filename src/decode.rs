//! Transparent response decoding: content-encoding and charset.
//!
//! Decompression only happens when this client asked for the encoding
//! itself (`Accept-Encoding: gzip, zstd` was added by the builder); a
//! user-supplied Accept-Encoding means the user wants the raw bytes. The
//! last `Content-Encoding` value decides the wrapper, and a decoded body's
//! length becomes unknown.

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use http::header::HeaderMap;
use std::borrow::Cow;
use tokio::io::{AsyncRead, BufReader};

/// Content encodings the pipeline can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Zstd,
}

/// The encoding to undo, from the last `Content-Encoding` value.
/// `identity` and anything unrecognized mean "pass through".
pub fn response_encoding(headers: &HeaderMap) -> Option<Encoding> {
    let value = headers.get_all(http::header::CONTENT_ENCODING).iter().last()?;
    let value = value.to_str().ok()?;
    // A comma list like "gzip, br" decodes outermost-last; only the final
    // token matters to us.
    let last = value.split(',').next_back()?.trim();
    match last.to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => Some(Encoding::Gzip),
        "zstd" => Some(Encoding::Zstd),
        _ => None,
    }
}

/// Wrap a body reader in the matching decompressor.
pub fn wrap(
    reader: impl AsyncRead + Send + 'static,
    encoding: Encoding,
) -> Box<dyn AsyncRead + Send + Unpin> {
    let buffered = BufReader::new(Box::pin(reader));
    match encoding {
        Encoding::Gzip => Box::new(GzipDecoder::new(buffered)),
        Encoding::Zstd => Box::new(ZstdDecoder::new(buffered)),
    }
}

/// Transcode a buffered text payload to UTF-8. Unknown labels and UTF-8
/// itself pass through unchanged.
pub fn to_utf8<'a>(data: &'a [u8], charset: &str) -> Cow<'a, [u8]> {
    let Some(encoding) = encoding_rs::Encoding::for_label(charset.as_bytes()) else {
        return Cow::Borrowed(data);
    };
    if encoding == encoding_rs::UTF_8 {
        return Cow::Borrowed(data);
    }
    let (text, _, _) = encoding.decode(data);
    match text {
        Cow::Borrowed(_) => Cow::Borrowed(data),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    }
}

/// Incremental charset transcoder for streaming formatters (SSE).
pub struct StreamTranscoder {
    decoder: Option<encoding_rs::Decoder>,
}

impl StreamTranscoder {
    /// `None` charset (or UTF-8) is a passthrough.
    pub fn new(charset: Option<&str>) -> Self {
        let decoder = charset
            .and_then(|cs| encoding_rs::Encoding::for_label(cs.as_bytes()))
            .filter(|&enc| enc != encoding_rs::UTF_8)
            .map(|enc| enc.new_decoder());
        Self { decoder }
    }

    pub fn transcode(&mut self, chunk: &[u8]) -> Vec<u8> {
        match &mut self.decoder {
            None => chunk.to_vec(),
            Some(decoder) => {
                let mut out = String::with_capacity(chunk.len() * 2);
                let _ = decoder.decode_to_string(chunk, &mut out, false);
                out.into_bytes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use tokio::io::AsyncReadExt;

    fn headers_with_encoding(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::CONTENT_ENCODING, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn test_encoding_detection() {
        assert_eq!(
            response_encoding(&headers_with_encoding("gzip")),
            Some(Encoding::Gzip)
        );
        assert_eq!(
            response_encoding(&headers_with_encoding("zstd")),
            Some(Encoding::Zstd)
        );
        assert_eq!(response_encoding(&headers_with_encoding("br")), None);
        assert_eq!(
            response_encoding(&headers_with_encoding("identity, gzip")),
            Some(Encoding::Gzip)
        );
        assert_eq!(response_encoding(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        use async_compression::tokio::write::GzipEncoder;
        use tokio::io::AsyncWriteExt;

        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(b"hello compressed world").await.unwrap();
        encoder.shutdown().await.unwrap();
        let compressed = encoder.into_inner();

        let mut decoder = wrap(std::io::Cursor::new(compressed), Encoding::Gzip);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello compressed world");
    }

    #[test]
    fn test_charset_transcode() {
        // "héllo" in ISO-8859-1.
        let latin1 = b"h\xE9llo";
        let utf8 = to_utf8(latin1, "iso-8859-1");
        assert_eq!(std::str::from_utf8(&utf8).unwrap(), "héllo");

        // UTF-8 label passes through untouched.
        assert!(matches!(to_utf8(b"plain", "utf-8"), Cow::Borrowed(_)));
        assert!(matches!(to_utf8(latin1, "no-such-charset"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_stream_transcoder() {
        let mut t = StreamTranscoder::new(Some("iso-8859-1"));
        let out = t.transcode(b"caf\xE9");
        assert_eq!(std::str::from_utf8(&out).unwrap(), "café");

        let mut passthrough = StreamTranscoder::new(None);
        assert_eq!(passthrough.transcode(b"abc"), b"abc");
    }
}
