//! Streaming multipart/form-data bodies.
//!
//! A producer task writes parts into a channel-backed pipe; the read end
//! becomes the request body, so large files never sit in memory. Fields
//! whose value starts with `@` reference files: their content type comes
//! from the extension table first, then from sniffing the first 512 bytes.
//! Producer errors close the pipe with the error, which surfaces on the
//! sending side instead of hanging it.

use crate::body::{ByteReader, RequestBody};
use crate::sniff;
use bytes::Bytes;
use rand::RngCore;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;

/// How much of an extension-less file is read for MIME sniffing.
const SNIFF_LEN: usize = 512;

/// File stream chunk size.
const CHUNK: usize = 64 * 1024;

/// A multipart body ready to send: the pipe's read end plus the
/// `Content-Type` header value carrying the boundary.
pub struct MultipartStream {
    pub body: RequestBody,
    pub content_type: String,
}

/// Spawn the producer and hand back the consuming end.
pub fn stream(fields: Vec<(String, String)>) -> MultipartStream {
    let boundary = make_boundary();
    let content_type = format!("multipart/form-data; boundary={boundary}");

    let (tx, mut rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);
    tokio::spawn(async move {
        if let Err(e) = produce(&fields, &boundary, &tx).await {
            debug!("multipart producer failed: {}", e);
            let _ = tx.send(Err(e)).await;
        }
    });

    let chunk_stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    let reader: ByteReader = Box::pin(StreamReader::new(chunk_stream));

    MultipartStream {
        body: RequestBody::from_stream(reader, None),
        content_type,
    }
}

fn make_boundary() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("snag{}", hex::encode(raw))
}

async fn produce(
    fields: &[(String, String)],
    boundary: &str,
    tx: &tokio::sync::mpsc::Sender<std::io::Result<Bytes>>,
) -> std::io::Result<()> {
    for (name, value) in fields {
        send(tx, format!("--{boundary}\r\n")).await?;

        match value.strip_prefix('@') {
            Some(path) => write_file_part(tx, name, Path::new(path)).await?,
            None => {
                send(
                    tx,
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"),
                )
                .await?;
            }
        }
    }
    send(tx, format!("--{boundary}--\r\n")).await?;
    Ok(())
}

async fn write_file_part(
    tx: &tokio::sync::mpsc::Sender<std::io::Result<Bytes>>,
    name: &str,
    path: &Path,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    // Extension table first; sniff the head of the file otherwise.
    let mut sniffed = Vec::new();
    let content_type = match mime_guess::from_path(path).first_raw() {
        Some(mime) => mime.to_string(),
        None => {
            let mut head = vec![0u8; SNIFF_LEN];
            let mut filled = 0;
            while filled < head.len() {
                let n = file.read(&mut head[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            head.truncate(filled);
            let mime = sniff_mime(&head);
            sniffed = head;
            mime.to_string()
        }
    };

    send(
        tx,
        format!(
            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
             Content-Type: {content_type}\r\n\r\n"
        ),
    )
    .await?;

    // The sniff buffer goes first, then the rest of the file.
    if !sniffed.is_empty() {
        send_bytes(tx, Bytes::from(sniffed)).await?;
    }
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        send_bytes(tx, Bytes::copy_from_slice(&buf[..n])).await?;
    }
    send(tx, "\r\n".to_string()).await?;
    Ok(())
}

/// MIME type from the first bytes of a file with no usable extension.
fn sniff_mime(head: &[u8]) -> &'static str {
    use sniff::ImageFormat;
    if let Some(img) = sniff::sniff_image(head) {
        return match img {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
        };
    }
    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if head.starts_with(b"\x1f\x8b") {
        return "application/gzip";
    }
    if head.starts_with(b"\x28\xb5\x2f\xfd") {
        return "application/zstd";
    }
    if !sniff::looks_binary(head) {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}

async fn send(
    tx: &tokio::sync::mpsc::Sender<std::io::Result<Bytes>>,
    text: String,
) -> std::io::Result<()> {
    send_bytes(tx, Bytes::from(text)).await
}

async fn send_bytes(
    tx: &tokio::sync::mpsc::Sender<std::io::Result<Bytes>>,
    data: Bytes,
) -> std::io::Result<()> {
    tx.send(Ok(data))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "body reader dropped"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal parser for the bodies we produce: returns
    /// (name, filename, content_type, payload) per part.
    fn parse_multipart(
        body: &[u8],
        boundary: &str,
    ) -> Vec<(String, Option<String>, Option<String>, Vec<u8>)> {
        let text = body;
        let delim = format!("--{boundary}\r\n");
        let closing = format!("--{boundary}--\r\n");
        let as_str = String::from_utf8_lossy(text);
        assert!(as_str.ends_with(&closing), "missing closing boundary");

        let mut parts = Vec::new();
        for raw in as_str.split(&delim).skip(1) {
            let raw = raw.strip_suffix(&closing).unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }
            let (head, payload) = raw.split_once("\r\n\r\n").expect("part header separator");
            let mut name = None;
            let mut filename = None;
            let mut content_type = None;
            for line in head.split("\r\n") {
                if let Some(rest) = line.strip_prefix("Content-Disposition: form-data; ") {
                    for attr in rest.split("; ") {
                        if let Some(v) = attr.strip_prefix("name=\"") {
                            name = Some(v.trim_end_matches('"').to_string());
                        }
                        if let Some(v) = attr.strip_prefix("filename=\"") {
                            filename = Some(v.trim_end_matches('"').to_string());
                        }
                    }
                }
                if let Some(ct) = line.strip_prefix("Content-Type: ") {
                    content_type = Some(ct.to_string());
                }
            }
            let payload = payload.strip_suffix("\r\n").unwrap_or(payload);
            parts.push((
                name.expect("part name"),
                filename,
                content_type,
                payload.as_bytes().to_vec(),
            ));
        }
        parts
    }

    async fn collect_body(ms: MultipartStream) -> Vec<u8> {
        let mut body = ms.body;
        let mut out = Vec::new();
        let mut http = body.take_http().unwrap();
        use http_body_util::BodyExt;
        while let Some(frame) = http.frame().await {
            if let Some(data) = frame.unwrap().data_ref() {
                out.extend_from_slice(data);
            }
        }
        out
    }

    fn boundary_of(ms: &MultipartStream) -> String {
        ms.content_type
            .split_once("boundary=")
            .unwrap()
            .1
            .to_string()
    }

    #[tokio::test]
    async fn test_literal_fields_round_trip() {
        let ms = stream(vec![
            ("alpha".to_string(), "one".to_string()),
            ("beta".to_string(), "two words".to_string()),
        ]);
        let boundary = boundary_of(&ms);
        let body = collect_body(ms).await;

        let parts = parse_multipart(&body, &boundary);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, "alpha");
        assert_eq!(parts[0].3, b"one");
        assert!(parts[0].1.is_none());
        assert_eq!(parts[1].3, b"two words");
    }

    #[tokio::test]
    async fn test_file_part_typed_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"\xFF\xD8\xFFfake-jpeg-data").unwrap();

        let ms = stream(vec![(
            "upload".to_string(),
            format!("@{}", path.display()),
        )]);
        let boundary = boundary_of(&ms);
        let body = collect_body(ms).await;

        let parts = parse_multipart(&body, &boundary);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].1.as_deref(), Some("photo.jpg"));
        assert_eq!(parts[0].2.as_deref(), Some("image/jpeg"));
        assert_eq!(parts[0].3, b"\xFF\xD8\xFFfake-jpeg-data");
    }

    #[tokio::test]
    async fn test_extensionless_file_sniffed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mystery");
        std::fs::write(&path, b"\xFF\xD8\xFF\xE0more-jpeg-bytes").unwrap();

        let ms = stream(vec![("f".to_string(), format!("@{}", path.display()))]);
        let boundary = boundary_of(&ms);
        let body = collect_body(ms).await;

        let parts = parse_multipart(&body, &boundary);
        assert_eq!(parts[0].2.as_deref(), Some("image/jpeg"));
        assert_eq!(parts[0].3, b"\xFF\xD8\xFF\xE0more-jpeg-bytes");
    }

    #[tokio::test]
    async fn test_missing_file_propagates_error() {
        let ms = stream(vec![("f".to_string(), "@/nonexistent/file".to_string())]);
        let mut body = ms.body;
        let mut http = body.take_http().unwrap();
        use http_body_util::BodyExt;
        let mut saw_error = false;
        while let Some(frame) = http.frame().await {
            if frame.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error, "producer error must surface on the read side");
    }

    #[test]
    fn test_sniff_mime_table() {
        assert_eq!(sniff_mime(b"\x89PNG\r\n\x1a\nxxxx"), "image/png");
        assert_eq!(sniff_mime(b"%PDF-1.7"), "application/pdf");
        assert_eq!(sniff_mime(b"PK\x03\x04"), "application/zip");
        assert_eq!(sniff_mime(b"plain old text"), "text/plain; charset=utf-8");
        assert_eq!(sniff_mime(&[0u8, 1, 2, 3]), "application/octet-stream");
    }
}
