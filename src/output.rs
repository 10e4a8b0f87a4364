//! The response pipeline: from response headers to terminal-ready output.
//!
//! Order of operations: exit code from status, verbosity-gated metadata,
//! output-target decision, transparent decoding (only when we asked for the
//! encoding), content-type resolution, streaming formatters (gRPC frames,
//! NDJSON, SSE), image handoff, buffered formatting capped at 1 MiB with
//! raw passthrough beyond, binary-stdout refusal, pager, clipboard, timing
//! waterfall, and the gRPC trailer check last, after the body is drained.

use crate::client::Exchange;
use crate::decode;
use crate::error::Error;
use crate::format::Registry;
use crate::grpc;
use crate::image::{ImageRenderer, InlineRenderer};
use crate::request::{FormatMode, OutputTarget, PreparedParts, Request};
use crate::sniff::{self, ContentKind};
use crate::term::TermEnv;
use crate::timing::format_duration;
use http::header::HeaderMap;
use http::StatusCode;
use http_body_util::BodyExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

/// Formatter buffering cap; larger bodies pass through unformatted.
const BUFFER_CAP: usize = 1024 * 1024;

/// `--copy` tee cap.
const COPY_CAP: usize = 1024 * 1024;

/// Everything `present` needs besides the exchange itself.
#[derive(Clone, Copy)]
pub struct PresentOptions<'a> {
    pub req: &'a Request,
    pub env: &'a TermEnv,
    pub registry: &'a Registry,
    pub grpc_method: Option<&'a prost_reflect::MethodDescriptor>,
    /// The request as it was built and sent: `-vv` prints its line and
    /// headers, and its `encoding_requested` flag licenses transparent
    /// decoding.
    pub parts: &'a PreparedParts,
}

/// Exit code from the response status: 2xx-3xx are success, 4xx -> 4,
/// 5xx -> 5, anything else -> 6.
pub fn exit_code_for(status: StatusCode, ignore_status: bool) -> i32 {
    if ignore_status {
        return 0;
    }
    if status.is_informational() || status.is_success() || status.is_redirection() {
        0
    } else if status.is_client_error() {
        4
    } else if status.is_server_error() {
        5
    } else {
        6
    }
}

/// Drive the pipeline to completion and return the process exit code.
pub async fn present(exchange: Exchange, opts: PresentOptions<'_>) -> Result<i32, Error> {
    let Exchange {
        response,
        url,
        mut metrics,
        ..
    } = exchange;

    let exit = exit_code_for(response.status(), opts.req.ignore_status);
    let (head, body) = response.into_parts();

    print_metadata(
        opts.req.verbosity,
        opts.parts,
        head.version,
        head.status,
        &head.headers,
        opts.env,
    );

    // The body as a reader; trailers (gRPC) land in the shared slot once
    // the stream is consumed.
    let trailers: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
    let reader = body_reader(body, trailers.clone());

    let times: Arc<Mutex<(Option<Instant>, Option<Instant>)>> = Arc::new(Mutex::new((None, None)));
    let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(TimingReader {
        inner: Box::pin(reader),
        times: times.clone(),
    });

    // Transparent decoding: only undo what this client asked for.
    let encoding = decode::response_encoding(&head.headers);
    let encoding_requested = opts.parts.encoding_requested;
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = match encoding {
        Some(enc) if encoding_requested => decode::wrap(reader, enc),
        _ => reader,
    };

    let resolved = head
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(sniff::resolve_content_type);
    let kind = resolved.as_ref().map(|r| r.kind).unwrap_or(ContentKind::Unknown);
    let charset = resolved.as_ref().and_then(|r| r.charset.clone());

    if opts.req.discard {
        let mut sink = tokio::io::sink();
        tokio::io::copy(&mut reader, &mut sink).await?;
        finish_timing(&mut metrics, &times, opts);
        grpc_trailer_check(kind, &head.headers, &trailers)?;
        return Ok(exit);
    }

    // Output-to-file bypasses formatting entirely.
    if let Some(path) = resolve_output_path(opts.req, &url, &head.headers)? {
        let total = content_length(&head.headers, encoding.is_some() && encoding_requested);
        write_to_file(&mut reader, &path, opts.req.clobber, total, opts.env).await?;
        finish_timing(&mut metrics, &times, opts);
        grpc_trailer_check(kind, &head.headers, &trailers)?;
        return Ok(exit);
    }

    let formatting = match opts.req.format {
        FormatMode::Always => true,
        FormatMode::Never => false,
        FormatMode::Auto => opts.env.stdout_tty && opts.req.output == OutputTarget::Stdout,
    };

    let mut copy_buf = if opts.req.copy && !kind.is_streaming() {
        Some(Vec::new())
    } else {
        if opts.req.copy && kind.is_streaming() {
            warn!("--copy is not supported for streaming responses");
        }
        None
    };

    // Streaming kinds bypass buffering entirely.
    if kind.is_streaming() {
        let result = match kind {
            ContentKind::Grpc => {
                stream_grpc(&mut reader, opts.grpc_method, opts.env, opts.req).await
            }
            ContentKind::Sse => stream_sse(&mut reader, charset.as_deref(), opts).await,
            _ => stream_ndjson(&mut reader, formatting, opts).await,
        };
        result?;
        finish_timing(&mut metrics, &times, opts);
        grpc_trailer_check(kind, &head.headers, &trailers)?;
        return Ok(exit);
    }

    // Buffer up to the cap; a longer body is emitted raw with the rest
    // streamed through untouched.
    let mut buf = vec![0u8; BUFFER_CAP + 1];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let overflow = filled > BUFFER_CAP;
    buf.truncate(filled);

    if let Some(copy) = copy_buf.as_mut() {
        copy.extend_from_slice(&buf[..buf.len().min(COPY_CAP)]);
    }

    // Sniff when the header said nothing useful.
    let kind = if kind == ContentKind::Unknown || kind == ContentKind::Text {
        match sniff::sniff(&buf) {
            ContentKind::Unknown => kind,
            sniffed => sniffed,
        }
    } else {
        kind
    };

    // Image handoff.
    if let ContentKind::Image(img_format) = kind {
        if crate::image::should_render(opts.req.image, opts.env) {
            let renderer = InlineRenderer::new(opts.env.image_protocol.unwrap());
            let mut stdout = std::io::stdout().lock();
            if renderer.render(&buf, img_format, &mut stdout)? {
                drop(stdout);
                if let Some(copy) = copy_buf {
                    crate::term::copy_to_clipboard(&copy)?;
                }
                finish_timing(&mut metrics, &times, opts);
                return Ok(exit);
            }
        }
    }

    // Charset, then formatter, unless the body overflowed the cap.
    let mut output = buf;
    if !overflow {
        if let Some(cs) = &charset {
            output = decode::to_utf8(&output, cs).into_owned();
        }
        if formatting {
            match opts.registry.format(kind, &output) {
                Some(Ok(formatted)) => output = formatted,
                Some(Err(e)) => debug!("formatter failed, emitting raw bytes: {}", e),
                None => {}
            }
        }
    }

    write_to_stdout(&output, &mut reader, overflow, opts).await?;

    if let Some(copy) = copy_buf {
        crate::term::copy_to_clipboard(&copy)?;
    }
    finish_timing(&mut metrics, &times, opts);
    grpc_trailer_check(kind, &head.headers, &trailers)?;
    Ok(exit)
}

/// Final stdout leg: binary refusal on a terminal, optional pager.
async fn write_to_stdout(
    output: &[u8],
    rest: &mut (dyn AsyncRead + Send + Unpin),
    overflow: bool,
    opts: PresentOptions<'_>,
) -> Result<(), Error> {
    let raw_stdout = opts.req.output == OutputTarget::StdoutRaw;
    if opts.env.stdout_tty && !raw_stdout && sniff::looks_binary(output) {
        warn!(
            "response body looks binary; refusing to write it to the terminal \
             (use --output <file> or --output - to force)"
        );
        return Ok(());
    }

    let pager = if opts.env.stdout_tty && !raw_stdout && !opts.req.no_pager && !overflow {
        crate::term::spawn_pager()
    } else {
        None
    };

    match pager {
        Some(mut child) => {
            // The pager owns stdout until it exits.
            if let Some(stdin) = child.stdin.as_mut() {
                if stdin.write_all(output).is_err() {
                    // Pager quit early; nothing left to show.
                }
            }
            drop(child.stdin.take());
            let _ = child.wait();
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output)?;
            if overflow {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = rest.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    stdout.write_all(&buf[..n])?;
                }
            }
            stdout.flush()?;
        }
    }
    Ok(())
}

/// gRPC streaming: consume length-prefixed frames, decode each message
/// with the response descriptor, emit pretty JSON.
async fn stream_grpc(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    method: Option<&prost_reflect::MethodDescriptor>,
    _env: &TermEnv,
    _req: &Request,
) -> Result<(), Error> {
    let method = method.ok_or_else(|| {
        Error::Input("received a gRPC response without a loaded schema".to_string())
    })?;

    let mut decoder = grpc::FrameDecoder::new();
    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            let json = grpc::decode_message(method, &frame)?;
            writeln!(stdout, "{json}")?;
        }
    }
    if decoder.residue() > 0 {
        warn!("gRPC stream ended mid-frame ({} byte(s) left)", decoder.residue());
    }
    stdout.flush()?;
    Ok(())
}

/// SSE: transcode to UTF-8 and pass events through unbuffered.
async fn stream_sse(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    charset: Option<&str>,
    _opts: PresentOptions<'_>,
) -> Result<(), Error> {
    let mut transcoder = decode::StreamTranscoder::new(charset);
    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&transcoder.transcode(&buf[..n]))?;
        stdout.flush()?;
    }
    Ok(())
}

/// NDJSON: emit line by line, pretty-printing each object when formatting
/// is on.
async fn stream_ndjson(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    formatting: bool,
    opts: PresentOptions<'_>,
) -> Result<(), Error> {
    let mut stdout = std::io::stdout().lock();
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            write_ndjson_line(&mut stdout, &line, formatting, opts)?;
        }
        stdout.flush()?;
    }
    if !pending.is_empty() {
        write_ndjson_line(&mut stdout, &pending, formatting, opts)?;
        stdout.flush()?;
    }
    Ok(())
}

fn write_ndjson_line(
    out: &mut impl Write,
    line: &[u8],
    formatting: bool,
    opts: PresentOptions<'_>,
) -> Result<(), Error> {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    if trimmed.is_empty() {
        return Ok(());
    }
    if formatting {
        if let Some(Ok(formatted)) = opts.registry.format(ContentKind::Json, trimmed) {
            out.write_all(&formatted)?;
            return Ok(());
        }
    }
    out.write_all(trimmed)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Print metadata to stderr according to verbosity: `-v` shows the
/// response status line and headers, `-vv` additionally shows the request
/// line and the headers it went out with.
fn print_metadata(
    verbosity: u8,
    request: &PreparedParts,
    version: http::Version,
    status: StatusCode,
    headers: &HeaderMap,
    env: &TermEnv,
) {
    if verbosity == 0 {
        return;
    }
    let mut stderr = std::io::stderr().lock();
    let reset = if env.color { "\x1b[0m" } else { "" };

    if verbosity >= 2 {
        let dim = if env.color { "\x1b[2m" } else { "" };
        let _ = writeln!(stderr, "{dim}> {} {}{reset}", request.method, request.url);
        for (name, value) in &request.headers {
            let _ = writeln!(
                stderr,
                "{dim}> {name}: {}{reset}",
                value.to_str().unwrap_or("<binary>")
            );
        }
        let _ = writeln!(stderr);
    }

    let status_color = if env.color {
        match status.as_u16() {
            200..=299 => "\x1b[32m",
            300..=399 => "\x1b[36m",
            400..=499 => "\x1b[33m",
            _ => "\x1b[31m",
        }
    } else {
        ""
    };
    let _ = writeln!(
        stderr,
        "{status_color}{version:?} {status}{reset}",
    );
    for (name, value) in headers {
        let name_color = if env.color { "\x1b[36m" } else { "" };
        let _ = writeln!(
            stderr,
            "{name_color}{name}{reset}: {}",
            value.to_str().unwrap_or("<binary>")
        );
    }
    let _ = writeln!(stderr);
}

/// Decide the file destination, if any: `--output <path>`, or
/// `--remote-name` (optionally preferring the `Content-Disposition`
/// filename), falling back from path component to hostname. The result is
/// always a sanitized basename.
fn resolve_output_path(
    req: &Request,
    url: &Url,
    headers: &HeaderMap,
) -> Result<Option<PathBuf>, Error> {
    if let OutputTarget::Path(path) = &req.output {
        return Ok(Some(path.clone()));
    }
    if !req.remote_name && !req.remote_header_name {
        return Ok(None);
    }

    let mut candidate: Option<String> = None;
    if req.remote_header_name {
        candidate = headers
            .get(http::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(content_disposition_filename);
    }
    if candidate.is_none() {
        candidate = url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
            .filter(|s| !s.is_empty());
    }
    if candidate.is_none() {
        candidate = url.host_str().map(|h| h.to_string());
    }

    let name = sanitize_filename(candidate.as_deref().unwrap_or(""))?;
    Ok(Some(PathBuf::from(name)))
}

/// Pull the `filename` parameter out of a `Content-Disposition` value.
fn content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("filename=") {
            let v = v.trim().trim_matches('"');
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Reduce a candidate to a safe basename: never contains a separator,
/// never `.` or `..`, never empty. A trailing separator means there is no
/// usable name (`Path::file_name` would silently strip it).
pub fn sanitize_filename(candidate: &str) -> Result<String, Error> {
    let base = candidate
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        return Err(Error::Output(format!(
            "cannot infer an output filename from {candidate:?}"
        )));
    }
    Ok(base.to_string())
}

/// Stream the body into `<name>.<rand>.download` next to the destination,
/// then rename. Refuses to overwrite without `--clobber`.
async fn write_to_file(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    path: &Path,
    clobber: bool,
    total: Option<u64>,
    env: &TermEnv,
) -> Result<(), Error> {
    if !clobber && path.exists() {
        return Err(Error::Output(format!(
            "{} already exists (use --clobber to overwrite)",
            path.display()
        )));
    }

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| Error::Output(format!("invalid output path {}", path.display())))?;

    let mut builder = tempfile::Builder::new();
    let prefix = format!("{name}.");
    builder.prefix(&prefix).suffix(".download");
    let mut tmp = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile_in("."),
    }
    .map_err(|e| Error::Output(format!("creating download temp file: {e}")))?;

    let mut progress = Progress::new(total, env);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tmp.write_all(&buf[..n])?;
        progress.advance(n as u64);
    }
    tmp.flush()?;
    progress.finish();

    tmp.persist(path)
        .map_err(|e| Error::Output(format!("renaming download into place: {e}")))?;
    debug!("wrote {}", path.display());
    Ok(())
}

fn content_length(headers: &HeaderMap, decoded: bool) -> Option<u64> {
    // A decoded body's length is unknown.
    if decoded {
        return None;
    }
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Download progress: bar for known sizes (plus OSC 9;4 on stdout),
/// spinner for unknown, a single summary line when stderr is not a TTY.
struct Progress {
    total: Option<u64>,
    written: u64,
    started: Instant,
    last_render: Instant,
    tty: bool,
    osc: bool,
    spinner_idx: usize,
}

const SPINNER: &[char] = &['|', '/', '-', '\\'];

impl Progress {
    fn new(total: Option<u64>, env: &TermEnv) -> Self {
        let now = Instant::now();
        Self {
            total,
            written: 0,
            started: now,
            last_render: now.checked_sub(Duration::from_secs(1)).unwrap_or(now),
            tty: env.stderr_tty,
            osc: env.stdout_tty && total.is_some(),
            spinner_idx: 0,
        }
    }

    fn advance(&mut self, n: u64) {
        self.written += n;
        if self.last_render.elapsed() < Duration::from_millis(100) {
            return;
        }
        self.last_render = Instant::now();
        if !self.tty {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        match self.total {
            Some(total) if total > 0 => {
                let pct = (self.written * 100 / total).min(100);
                let filled = (pct / 5) as usize;
                let _ = write!(
                    stderr,
                    "\r[{}{}] {:>3}%  {}",
                    "#".repeat(filled),
                    " ".repeat(20 - filled),
                    pct,
                    self.rate()
                );
                if self.osc {
                    // OSC 9;4: terminal-level progress indication.
                    let _ = write!(std::io::stdout(), "\x1b]9;4;1;{pct}\x07");
                    let _ = std::io::stdout().flush();
                }
            }
            _ => {
                self.spinner_idx = (self.spinner_idx + 1) % SPINNER.len();
                let _ = write!(
                    stderr,
                    "\r{} {} bytes  {}",
                    SPINNER[self.spinner_idx], self.written, self.rate()
                );
            }
        }
        let _ = stderr.flush();
    }

    fn rate(&self) -> String {
        let secs = self.started.elapsed().as_secs_f64().max(0.001);
        let rate = self.written as f64 / secs;
        if rate > 1_000_000.0 {
            format!("{:.1} MB/s", rate / 1_000_000.0)
        } else {
            format!("{:.1} KB/s", rate / 1_000.0)
        }
    }

    fn finish(&mut self) {
        let mut stderr = std::io::stderr().lock();
        if self.tty {
            let _ = write!(stderr, "\r\x1b[2K");
        }
        let _ = writeln!(
            stderr,
            "downloaded {} byte(s) in {} ({})",
            self.written,
            format_duration(self.started.elapsed()),
            self.rate()
        );
        if self.osc {
            let _ = write!(std::io::stdout(), "\x1b]9;4;0;0\x07");
            let _ = std::io::stdout().flush();
        }
    }
}

/// Turn a frame-stream body into an `AsyncRead`, stashing trailer frames
/// in the shared slot.
fn body_reader(
    body: crate::transport::InBody,
    trailers: Arc<Mutex<Option<HeaderMap>>>,
) -> impl AsyncRead + Send {
    let stream = futures::stream::unfold(body, move |mut body| {
        let trailers = trailers.clone();
        async move {
            loop {
                match body.frame().await {
                    None => return None,
                    Some(Err(e)) => return Some((Err(e), body)),
                    Some(Ok(frame)) => {
                        let frame = match frame.into_data() {
                            Ok(data) => return Some((Ok(data), body)),
                            Err(frame) => frame,
                        };
                        if let Ok(t) = frame.into_trailers() {
                            *trailers.lock().unwrap() = Some(t);
                        }
                    }
                }
            }
        }
    });
    StreamReader::new(stream)
}

/// Wall-clock reader: records the first and last successful read.
struct TimingReader {
    inner: std::pin::Pin<Box<dyn AsyncRead + Send>>,
    times: Arc<Mutex<(Option<Instant>, Option<Instant>)>>,
}

impl AsyncRead for TimingReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = self.inner.as_mut().poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                let now = Instant::now();
                let mut times = self.times.lock().unwrap();
                if times.0.is_none() {
                    times.0 = Some(now);
                }
                times.1 = Some(now);
            }
        }
        poll
    }
}

/// Fold the body-read timestamps into the metrics and render the
/// waterfall. `--timing` asks for it explicitly; debug verbosity (`-vv`)
/// attaches the trace as well.
fn finish_timing(
    metrics: &mut crate::timing::ConnMetrics,
    times: &Arc<Mutex<(Option<Instant>, Option<Instant>)>>,
    opts: PresentOptions<'_>,
) {
    let (first, last) = *times.lock().unwrap();
    metrics.body_first_read = first;
    metrics.body_last_read = last;
    if opts.req.timing || opts.req.verbosity >= 2 {
        let mut stderr = std::io::stderr().lock();
        let _ = metrics.render_waterfall(&mut stderr, opts.env.color);
    }
}

/// After the body is fully consumed, a gRPC response's trailers decide
/// success; a trailers-only response carries the status in its headers.
fn grpc_trailer_check(
    kind: ContentKind,
    headers: &HeaderMap,
    trailers: &Arc<Mutex<Option<HeaderMap>>>,
) -> Result<(), Error> {
    if kind != ContentKind::Grpc {
        return Ok(());
    }
    let trailers = trailers.lock().unwrap();
    grpc::check_status(headers, trailers.as_ref())
}
