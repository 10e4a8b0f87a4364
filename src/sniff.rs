//! Content-type resolution and payload sniffing.
//!
//! Resolution looks at the `Content-Type` header first: a fixed table of
//! media types plus the structured-syntax suffixes (`+json`, `+xml`,
//! `+yaml`, `+proto`). When the header is missing or unhelpful, the first
//! bytes of the payload are sniffed.

/// Image container formats recognized by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
}

/// The resolved kind of a response payload, used to pick a formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Json,
    Xml,
    Yaml,
    Csv,
    Html,
    Css,
    Msgpack,
    Protobuf,
    Grpc,
    NdJson,
    Sse,
    Image(ImageFormat),
    Text,
    Unknown,
}

impl ContentKind {
    /// Streaming kinds bypass the buffered formatter path entirely.
    pub fn is_streaming(&self) -> bool {
        matches!(self, ContentKind::Grpc | ContentKind::NdJson | ContentKind::Sse)
    }
}

/// Content type plus the charset parameter, as pulled from a header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    pub kind: ContentKind,
    pub charset: Option<String>,
}

/// Resolve a `Content-Type` header value.
pub fn resolve_content_type(value: &str) -> ResolvedType {
    let mut parts = value.split(';');
    let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();

    let charset = parts.find_map(|p| {
        let p = p.trim();
        p.strip_prefix("charset=")
            .map(|cs| cs.trim_matches('"').to_ascii_lowercase())
    });

    let kind = match essence.as_str() {
        "application/json" | "text/json" => ContentKind::Json,
        "application/xml" | "text/xml" => ContentKind::Xml,
        "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml" => {
            ContentKind::Yaml
        }
        "text/csv" => ContentKind::Csv,
        "text/html" => ContentKind::Html,
        "text/css" => ContentKind::Css,
        "application/vnd.msgpack" | "application/msgpack" | "application/x-msgpack" => {
            ContentKind::Msgpack
        }
        "application/grpc" | "application/grpc+proto" => ContentKind::Grpc,
        "application/protobuf" | "application/x-protobuf" => ContentKind::Protobuf,
        "application/x-ndjson" | "application/ndjson" | "application/jsonl" => ContentKind::NdJson,
        "text/event-stream" => ContentKind::Sse,
        "image/png" => ContentKind::Image(ImageFormat::Png),
        "image/jpeg" => ContentKind::Image(ImageFormat::Jpeg),
        "image/gif" => ContentKind::Image(ImageFormat::Gif),
        "image/webp" => ContentKind::Image(ImageFormat::Webp),
        "image/bmp" => ContentKind::Image(ImageFormat::Bmp),
        "image/tiff" => ContentKind::Image(ImageFormat::Tiff),
        _ => match essence.rsplit_once('+').map(|(_, suffix)| suffix) {
            // application/grpc+proto is caught above; any other +proto is
            // a bare protobuf payload.
            Some("json") => ContentKind::Json,
            Some("xml") => ContentKind::Xml,
            Some("yaml") => ContentKind::Yaml,
            Some("proto") => ContentKind::Protobuf,
            _ if essence.starts_with("text/") => ContentKind::Text,
            _ => ContentKind::Unknown,
        },
    };

    ResolvedType { kind, charset }
}

/// Sniff a payload whose content type is unknown.
///
/// Order matters: image magic is unambiguous, markup needs tag matching,
/// JSON/YAML are judged from the first non-whitespace byte. Anything else
/// stays `Unknown` (e.g. CSV is indistinguishable from plain text).
pub fn sniff(data: &[u8]) -> ContentKind {
    if let Some(img) = sniff_image(data) {
        return ContentKind::Image(img);
    }

    let trimmed = skip_leading_whitespace(data);
    if trimmed.is_empty() {
        return ContentKind::Unknown;
    }

    match trimmed[0] {
        b'{' | b'[' => return ContentKind::Json,
        b'<' => {
            if is_html(trimmed) {
                return ContentKind::Html;
            }
            if is_xml(trimmed) {
                return ContentKind::Xml;
            }
        }
        _ => {}
    }

    if trimmed.starts_with(b"---") {
        return ContentKind::Yaml;
    }

    ContentKind::Unknown
}

/// Standard magic-byte image detection.
pub fn sniff_image(data: &[u8]) -> Option<ImageFormat> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if data.starts_with(b"\xFF\xD8\xFF") {
        Some(ImageFormat::Jpeg)
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else if data.starts_with(b"BM") && data.len() >= 14 {
        Some(ImageFormat::Bmp)
    } else if data.starts_with(b"II*\x00") || data.starts_with(b"MM\x00*") {
        Some(ImageFormat::Tiff)
    } else {
        None
    }
}

/// Terminal safety check: refuse to write bytes that would garble a TTY.
/// True when the first KiB contains a NUL byte or is under 90% printable.
pub fn looks_binary(data: &[u8]) -> bool {
    let window = &data[..data.len().min(1024)];
    if window.is_empty() {
        return false;
    }
    if window.contains(&0) {
        return true;
    }

    let mut printable = 0usize;
    let mut total = 0usize;
    let mut rest = window;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                for c in s.chars() {
                    total += 1;
                    if !c.is_control() || matches!(c, '\n' | '\r' | '\t') {
                        printable += 1;
                    }
                }
                break;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                for c in std::str::from_utf8(valid).unwrap_or("").chars() {
                    total += 1;
                    if !c.is_control() || matches!(c, '\n' | '\r' | '\t') {
                        printable += 1;
                    }
                }
                // An incomplete trailing sequence is a window artifact, not
                // binary data.
                if e.error_len().is_none() {
                    break;
                }
                total += 1;
                rest = &invalid[e.error_len().unwrap_or(1)..];
            }
        }
    }

    total > 0 && (printable as f64 / total as f64) < 0.90
}

fn skip_leading_whitespace(data: &[u8]) -> &[u8] {
    let mut data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    while let Some((first, rest)) = data.split_first() {
        if first.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    data
}

fn is_html(data: &[u8]) -> bool {
    const TAGS: &[&str] = &[
        "<!doctype html",
        "<html",
        "<head",
        "<body",
        "<script",
        "<iframe",
        "<h1",
        "<div",
        "<font",
        "<table",
        "<a ",
        "<style",
        "<title",
        "<b>",
        "<br",
        "<p>",
        "<p ",
        "<!--",
    ];
    let prefix = String::from_utf8_lossy(&data[..data.len().min(64)]).to_ascii_lowercase();
    TAGS.iter().any(|t| prefix.starts_with(t))
}

fn is_xml(data: &[u8]) -> bool {
    let prefix = String::from_utf8_lossy(&data[..data.len().min(64)]).to_ascii_lowercase();
    prefix.starts_with("<?xml")
        || prefix.starts_with("<![cdata[")
        || (prefix.starts_with("<!doctype ") && !prefix.starts_with("<!doctype html"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_table() {
        assert_eq!(resolve_content_type("application/json").kind, ContentKind::Json);
        assert_eq!(resolve_content_type("application/foo+json").kind, ContentKind::Json);
        assert_eq!(resolve_content_type("application/grpc+proto").kind, ContentKind::Grpc);
        assert_eq!(resolve_content_type("text/event-stream").kind, ContentKind::Sse);
        assert_eq!(resolve_content_type("application/atom+xml").kind, ContentKind::Xml);
        assert_eq!(resolve_content_type("application/custom+proto").kind, ContentKind::Protobuf);
        assert_eq!(resolve_content_type("image/png").kind, ContentKind::Image(ImageFormat::Png));
        assert_eq!(resolve_content_type("text/plain").kind, ContentKind::Text);
        assert_eq!(resolve_content_type("application/octet-stream").kind, ContentKind::Unknown);
    }

    #[test]
    fn test_charset_extraction() {
        let r = resolve_content_type("text/html; charset=ISO-8859-1");
        assert_eq!(r.kind, ContentKind::Html);
        assert_eq!(r.charset.as_deref(), Some("iso-8859-1"));
        assert_eq!(resolve_content_type("application/json").charset, None);
    }

    #[test]
    fn test_sniff_json() {
        assert_eq!(sniff(br#"{"key":"val"}"#), ContentKind::Json);
        assert_eq!(sniff(b"  [1, 2, 3]"), ContentKind::Json);
    }

    #[test]
    fn test_sniff_markup() {
        assert_eq!(sniff(b"<!DOCTYPE html><html></html>"), ContentKind::Html);
        assert_eq!(sniff(b"<?xml version=\"1.0\"?><root/>"), ContentKind::Xml);
        assert_eq!(sniff(b"<!DOCTYPE note SYSTEM \"note.dtd\">"), ContentKind::Xml);
    }

    #[test]
    fn test_sniff_yaml_and_images() {
        assert_eq!(sniff(b"---\nkey: val\n"), ContentKind::Yaml);
        assert_eq!(
            sniff(b"\x89PNG\r\n\x1a\n0000"),
            ContentKind::Image(ImageFormat::Png)
        );
        assert_eq!(
            sniff(b"\xFF\xD8\xFF\xE0rest"),
            ContentKind::Image(ImageFormat::Jpeg)
        );
    }

    #[test]
    fn test_sniff_unknown() {
        assert_eq!(sniff(b"hello world"), ContentKind::Unknown);
        assert_eq!(sniff(b"name,age\nalice,30"), ContentKind::Unknown);
        assert_eq!(sniff(b""), ContentKind::Unknown);
    }

    #[test]
    fn test_binary_detection() {
        assert!(looks_binary(b"abc\x00def"));
        assert!(looks_binary(&[0xFF; 512]));
        assert!(!looks_binary(b"plain text with\nnewlines\n"));
        assert!(!looks_binary("UTF-8 text: héllo wörld ✓".as_bytes()));
        assert!(!looks_binary(b""));
    }
}
