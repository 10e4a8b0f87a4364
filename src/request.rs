//! The fully resolved description of one invocation, and the deterministic
//! builder that turns it into a sendable request.
//!
//! Body selectors and auth descriptors are tagged variants so dispatch is
//! exhaustive: exactly zero or one body may be set, and the auth modes are
//! mutually exclusive by construction.

use crate::error::Error;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::{Host, Url};

/// Fixed User-Agent for every outgoing request.
pub const USER_AGENT: &str = concat!("snag/", env!("CARGO_PKG_VERSION"));

/// Fixed Accept header advertising everything the formatter registry can render.
pub const ACCEPT: &str =
    "application/json, application/vnd.msgpack, application/xml, image/webp, */*";

/// HTTP version preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// Negotiate: attempt HTTP/2 over ALPN, fall back to HTTP/1.1.
    #[default]
    Default,
    Http1,
    Http2,
    Http3,
}

/// Minimum accepted TLS version; the default floor is 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsFloor {
    #[default]
    Tls12,
    Tls13,
}

/// AWS SigV4 signing configuration.
#[derive(Debug, Clone)]
pub struct SigV4Config {
    pub region: String,
    pub service: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Auth descriptor. At most one applies; SigV4 signs last so it sees the
/// finalized header set.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { user: String, pass: Option<String> },
    Bearer(String),
    AwsSigV4(SigV4Config),
}

/// Body selector: exactly zero or one of these is set on a request.
#[derive(Debug, Clone)]
pub enum BodySource {
    /// Raw bytes from `--data` (or `@-` stdin, already drained by the CLI).
    Raw(Vec<u8>),
    /// URL-encoded form pairs.
    Form(Vec<(String, String)>),
    /// Multipart fields; values starting with `@` reference files.
    Multipart(Vec<(String, String)>),
    /// A JSON document sent as `application/json`.
    Json(Vec<u8>),
    /// An XML document sent as `application/xml`.
    Xml(Vec<u8>),
    /// Stream a file from disk.
    File(PathBuf),
    /// JSON converted to length-prefixed protobuf frames by the gRPC adapter.
    GrpcJson(Vec<u8>),
}

/// Where the protobuf schema for gRPC calls comes from.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// Compile `.proto` files with the external compiler.
    ProtoFiles { files: Vec<PathBuf>, imports: Vec<PathBuf> },
    /// A serialized `FileDescriptorSet` produced with `--include_imports`.
    DescriptorSet(PathBuf),
}

/// Output target for the response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputTarget {
    #[default]
    Stdout,
    /// `--output -`: raw stdout, no pager, no binary refusal.
    StdoutRaw,
    Path(PathBuf),
}

/// Formatting setting for the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatMode {
    /// Format when stdout is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

/// Whether images are handed to the terminal renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageMode {
    /// Render when the terminal supports an inline-image protocol.
    #[default]
    Auto,
    Never,
}

/// The fully resolved description of one invocation. Created by the CLI,
/// consumed once. Mutated only to rewrite a missing URL scheme, append
/// gRPC headers, and record the resolved response-message descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Option<Method>,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<BodySource>,
    pub content_type: Option<String>,
    pub auth: Option<Auth>,
    pub proxy: Option<Url>,
    pub dns_server: Option<String>,
    pub http_version: HttpVersion,
    pub tls_floor: TlsFloor,
    pub insecure: bool,
    pub ca_certs: Vec<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub unix_socket: Option<PathBuf>,
    /// `None` = follow without cap; `Some(0)` = return the redirect
    /// response unfollowed; `Some(n)` = error after n hops.
    pub redirects: Option<u32>,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub session: Option<String>,
    pub proto_schema: Option<SchemaSource>,
    pub range: Vec<String>,
    pub image: ImageMode,
    pub format: FormatMode,
    pub verbosity: u8,
    pub output: OutputTarget,
    pub clobber: bool,
    pub remote_name: bool,
    pub remote_header_name: bool,
    pub websocket: bool,
    pub grpc: bool,
    pub edit: bool,
    pub discard: bool,
    pub copy: bool,
    pub timing: bool,
    pub ignore_status: bool,
    pub no_pager: bool,
    pub no_encode: bool,
}

impl Request {
    /// A request with defaults for everything but the URL.
    pub fn new(url: Url) -> Self {
        Self {
            method: None,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            content_type: None,
            auth: None,
            proxy: None,
            dns_server: None,
            http_version: HttpVersion::Default,
            tls_floor: TlsFloor::Tls12,
            insecure: false,
            ca_certs: Vec::new(),
            client_cert: None,
            unix_socket: None,
            redirects: None,
            retries: 0,
            retry_delay: Duration::from_secs(1),
            timeout: None,
            connect_timeout: None,
            session: None,
            proto_schema: None,
            range: Vec::new(),
            image: ImageMode::Auto,
            format: FormatMode::Auto,
            verbosity: 0,
            output: OutputTarget::Stdout,
            clobber: false,
            remote_name: false,
            remote_header_name: false,
            websocket: false,
            grpc: false,
            edit: false,
            discard: false,
            copy: false,
            timing: false,
            ignore_status: false,
            no_pager: false,
            no_encode: false,
        }
    }
}

/// Parse a user-supplied URL, defaulting the scheme when absent: `http`
/// when the host is loopback (`localhost`, 127.0.0.0/8, `::1`), `https`
/// otherwise.
pub fn normalize_url(raw: &str) -> Result<Url, Error> {
    match Url::parse(raw) {
        Ok(url) if url.has_host() => Ok(url),
        // "localhost:3000/x" parses as scheme "localhost"; anything without
        // a real host gets the scheme-defaulting treatment.
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
            let authority = raw
                .split(['/', '?', '#'])
                .next()
                .unwrap_or(raw);
            let host = authority
                .rsplit_once('@')
                .map(|(_, h)| h)
                .unwrap_or(authority);
            let host = strip_port(host);
            let loopback = match Host::parse(host) {
                Ok(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
                Ok(Host::Ipv4(ip)) => ip.is_loopback(),
                Ok(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
                Err(_) => false,
            };
            let scheme = if loopback { "http" } else { "https" };
            Ok(Url::parse(&format!("{scheme}://{raw}"))?)
        }
        Err(e) => Err(e.into()),
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // Bracketed IPv6 literal, possibly with a port.
        host.split_once(']')
            .map(|(h, _)| &h[1..])
            .unwrap_or(host)
    } else {
        host.rsplit_once(':')
            .filter(|(_, p)| p.chars().all(|c| c.is_ascii_digit()))
            .map(|(h, _)| h)
            .unwrap_or(host)
    }
}

/// Headers and metadata ready for the transport, produced by [`build_parts`].
#[derive(Debug)]
pub struct PreparedParts {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    /// Set when we asked for `Accept-Encoding: gzip, zstd` ourselves; the
    /// response pipeline only decodes transparently when this is true.
    pub encoding_requested: bool,
}

/// Apply the deterministic build ordering: query merge, scheme/method
/// defaults, fixed headers, content type precedence, ranges, user header
/// overwrite, compression preference, then basic/bearer auth. SigV4 runs
/// later, per attempt, once the header set is final.
pub fn build_parts(req: &Request) -> Result<PreparedParts, Error> {
    let mut url = req.url.clone();

    // 1. Merge query params into the URL.
    if !req.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &req.query {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }

    // 2-4. Body choice is encoded in the BodySource variant; scheme was
    // defaulted at parse time. Method defaults to GET.
    let method = match &req.method {
        Some(m) => m.clone(),
        None => Method::GET,
    };

    // 5. Fixed Accept and User-Agent.
    let mut headers = HeaderMap::new();
    headers.insert(http::header::ACCEPT, HeaderValue::from_static(ACCEPT));
    headers.insert(http::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

    // 6. Content-Type: form > multipart > explicit override. Form and
    // multipart values are set by the body materializer (the multipart
    // boundary is not known yet); the override lands here.
    let content_type = match &req.body {
        Some(BodySource::Form(_)) => Some("application/x-www-form-urlencoded".to_string()),
        Some(BodySource::Multipart(_)) => None,
        Some(BodySource::Json(_)) => Some(
            req.content_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string()),
        ),
        Some(BodySource::Xml(_)) => Some(
            req.content_type
                .clone()
                .unwrap_or_else(|| "application/xml".to_string()),
        ),
        _ => req.content_type.clone(),
    };
    if let Some(ct) = &content_type {
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_str(ct).map_err(|e| Error::Input(format!("invalid content type: {e}")))?,
        );
    }

    // 7. Range.
    if !req.range.is_empty() {
        let val = format!("bytes={}", req.range.join(","));
        headers.insert(
            http::header::RANGE,
            HeaderValue::from_str(&val).map_err(|e| Error::Input(format!("invalid range: {e}")))?,
        );
    }

    // 8. User-provided headers overwrite.
    for (name, value) in &req.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Input(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Input(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }

    // 9. Ask for compressed responses unless disabled, HEAD, or the user
    // set their own Accept-Encoding. The flag travels with the parts so the
    // pipeline knows the decode is ours to do.
    let mut encoding_requested = false;
    if !req.no_encode
        && method != Method::HEAD
        && !headers.contains_key(http::header::ACCEPT_ENCODING)
    {
        headers.insert(
            http::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, zstd"),
        );
        encoding_requested = true;
    }

    // 11. Basic/bearer auth. (10, file content-length, happens at body
    // materialization; SigV4 happens per attempt in the client.)
    match &req.auth {
        Some(Auth::Basic { user, pass }) => {
            use base64::Engine as _;
            let creds = format!("{}:{}", user, pass.as_deref().unwrap_or(""));
            let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {encoded}"))
                    .map_err(|e| Error::Input(format!("invalid basic credentials: {e}")))?,
            );
        }
        Some(Auth::Bearer(token)) => {
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| Error::Input(format!("invalid bearer token: {e}")))?,
            );
        }
        Some(Auth::AwsSigV4(_)) | None => {}
    }

    Ok(PreparedParts {
        method,
        url,
        headers,
        content_type,
        encoding_requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_defaults_to_http_on_loopback() {
        assert_eq!(normalize_url("localhost:3000/x").unwrap().scheme(), "http");
        assert_eq!(normalize_url("127.0.0.1/x").unwrap().scheme(), "http");
        assert_eq!(normalize_url("127.8.8.8").unwrap().scheme(), "http");
        assert_eq!(normalize_url("[::1]:8080").unwrap().scheme(), "http");
    }

    #[test]
    fn test_scheme_defaults_to_https_elsewhere() {
        assert_eq!(normalize_url("example.com/x").unwrap().scheme(), "https");
        assert_eq!(normalize_url("10.0.0.1").unwrap().scheme(), "https");
    }

    #[test]
    fn test_explicit_scheme_untouched() {
        assert_eq!(normalize_url("http://example.com").unwrap().scheme(), "http");
        assert_eq!(normalize_url("wss://example.com/ws").unwrap().scheme(), "wss");
    }

    #[test]
    fn test_default_method_and_fixed_headers() {
        let req = Request::new(normalize_url("example.com").unwrap());
        let parts = build_parts(&req).unwrap();
        assert_eq!(parts.method, Method::GET);
        assert_eq!(parts.headers.get("accept").unwrap(), ACCEPT);
        assert_eq!(parts.headers.get("user-agent").unwrap(), USER_AGENT);
        assert_eq!(parts.headers.get("accept-encoding").unwrap(), "gzip, zstd");
        assert!(parts.encoding_requested);
    }

    #[test]
    fn test_head_does_not_request_encoding() {
        let mut req = Request::new(normalize_url("example.com").unwrap());
        req.method = Some(Method::HEAD);
        let parts = build_parts(&req).unwrap();
        assert!(!parts.headers.contains_key("accept-encoding"));
        assert!(!parts.encoding_requested);
    }

    #[test]
    fn test_user_accept_encoding_wins() {
        let mut req = Request::new(normalize_url("example.com").unwrap());
        req.headers.push(("Accept-Encoding".into(), "br".into()));
        let parts = build_parts(&req).unwrap();
        assert_eq!(parts.headers.get("accept-encoding").unwrap(), "br");
        assert!(!parts.encoding_requested);
    }

    #[test]
    fn test_query_merge_and_range() {
        let mut req = Request::new(normalize_url("https://example.com/api?a=1").unwrap());
        req.query.push(("b".into(), "2".into()));
        req.range = vec!["0-9".into(), "20-29".into()];
        let parts = build_parts(&req).unwrap();
        assert_eq!(parts.url.query(), Some("a=1&b=2"));
        assert_eq!(parts.headers.get("range").unwrap(), "bytes=0-9,20-29");
    }

    #[test]
    fn test_form_content_type_beats_override() {
        let mut req = Request::new(normalize_url("example.com").unwrap());
        req.body = Some(BodySource::Form(vec![("a".into(), "1".into())]));
        req.content_type = Some("text/weird".into());
        let parts = build_parts(&req).unwrap();
        assert_eq!(
            parts.headers.get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let mut req = Request::new(normalize_url("example.com").unwrap());
        req.auth = Some(Auth::Basic {
            user: "user".into(),
            pass: Some("pass".into()),
        });
        let parts = build_parts(&req).unwrap();
        assert_eq!(
            parts.headers.get("authorization").unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }
}

#[cfg(test)]
mod debug_probe {
    #[test]
    fn probe() {
        let host = "127.8.8.8";
        let parsed = url::Host::parse(host);
        println!("parsed = {:?}", parsed);
    }
}
