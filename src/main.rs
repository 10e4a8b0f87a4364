//! snag - command-line HTTP client

use clap::Parser;
use snag::client;
use snag::error::Error;
use snag::format::Registry;
use snag::grpc;
use snag::output::{self, PresentOptions};
use snag::request::{
    normalize_url, Auth, BodySource, FormatMode, HttpVersion, ImageMode, OutputTarget, Request,
    SchemaSource, SigV4Config, TlsFloor,
};
use snag::session::{self, Session};
use snag::term::TermEnv;
use snag::ws;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Version string with commit and build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "0.4.1 (1a2b3c4d5e, built 2026-02-23T21:40:07Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        let rev = env!("SNAG_GIT_REV");
        if rev.is_empty() {
            format!(
                "{} (built {})",
                env!("CARGO_PKG_VERSION"),
                env!("SNAG_BUILD_TIME"),
            )
        } else {
            format!(
                "{} ({rev}, built {})",
                env!("CARGO_PKG_VERSION"),
                env!("SNAG_BUILD_TIME"),
            )
        }
    })
}

/// snag — fetch a URL and render the response for a terminal
#[derive(Parser, Debug)]
#[command(name = "snag")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Target URL (scheme optional: loopback hosts default to http,
    /// everything else to https)
    url: String,

    /// HTTP method (default GET)
    #[arg(short = 'X', long, value_name = "METHOD")]
    method: Option<String>,

    /// Extra header, as "Name: value" or "Name:value" (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// Query parameter, as "key=value" (repeatable)
    #[arg(short = 'q', long = "query", value_name = "KEY=VALUE")]
    query: Vec<String>,

    /// Raw request body ("@-" reads stdin)
    #[arg(short = 'd', long, value_name = "DATA", conflicts_with_all = ["json", "xml", "form", "multipart", "file"])]
    data: Option<String>,

    /// JSON request body
    #[arg(long, value_name = "JSON", conflicts_with_all = ["xml", "form", "multipart", "file"])]
    json: Option<String>,

    /// XML request body
    #[arg(long, value_name = "XML", conflicts_with_all = ["form", "multipart", "file"])]
    xml: Option<String>,

    /// URL-encoded form field, as "key=value" (repeatable)
    #[arg(short = 'f', long = "form", value_name = "KEY=VALUE", conflicts_with_all = ["multipart", "file"])]
    form: Vec<String>,

    /// Multipart field, as "key=value" or "key=@path" (repeatable)
    #[arg(short = 'F', long = "multipart", value_name = "KEY=VALUE", conflicts_with = "file")]
    multipart: Vec<String>,

    /// Stream a file as the request body
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Content-Type override
    #[arg(short = 'c', long, value_name = "TYPE")]
    content_type: Option<String>,

    /// Basic auth, as "user" or "user:password"
    #[arg(long, value_name = "USER[:PASS]", conflicts_with_all = ["bearer", "aws_sigv4"])]
    basic: Option<String>,

    /// Bearer token
    #[arg(long, value_name = "TOKEN", conflicts_with = "aws_sigv4")]
    bearer: Option<String>,

    /// Sign with AWS SigV4, as "REGION/SERVICE". Credentials come from
    /// AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
    #[arg(long = "aws-sigv4", value_name = "REGION/SERVICE")]
    aws_sigv4: Option<String>,

    /// Proxy URL (not supported yet; rejected explicitly)
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// DNS server: "IP[:PORT]" for UDP, or an https:// URL for DoH
    #[arg(long, value_name = "SERVER")]
    dns_server: Option<String>,

    /// Force an HTTP version (1, 2, or 3)
    #[arg(long, value_name = "VERSION")]
    http: Option<String>,

    /// Minimum TLS version (1.2 or 1.3)
    #[arg(long, value_name = "VERSION")]
    tls: Option<String>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// CA certificate PEM file; replaces the root store (repeatable)
    #[arg(long = "cacert", value_name = "FILE")]
    ca_certs: Vec<PathBuf>,

    /// Client certificate PEM file (certificate + key)
    #[arg(long, value_name = "FILE")]
    cert: Option<PathBuf>,

    /// Dial this Unix socket instead of the URL's host
    #[arg(long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Redirect cap: unset follows freely, 0 returns the redirect
    /// response, N errors after N hops
    #[arg(long, value_name = "N")]
    redirects: Option<u32>,

    /// Retry count for transient failures
    #[arg(long, value_name = "N", default_value_t = 0)]
    retry: u32,

    /// Base retry delay in seconds (doubles per attempt, +/-25% jitter)
    #[arg(long, value_name = "SECONDS", default_value_t = 1.0)]
    retry_delay: f64,

    /// Per-attempt timeout in seconds
    #[arg(short = 't', long, value_name = "SECONDS")]
    timeout: Option<f64>,

    /// Connect timeout in seconds (DNS + TCP + TLS)
    #[arg(long, value_name = "SECONDS")]
    connect_timeout: Option<f64>,

    /// Named cookie session to load and persist
    #[arg(short = 's', long, value_name = "NAME")]
    session: Option<String>,

    /// Compile these .proto files for gRPC calls (repeatable)
    #[arg(long = "proto", value_name = "FILE")]
    proto: Vec<PathBuf>,

    /// Import path for protoc (repeatable)
    #[arg(long = "proto-import", value_name = "DIR")]
    proto_imports: Vec<PathBuf>,

    /// Load a serialized FileDescriptorSet instead of compiling
    #[arg(long, value_name = "FILE", conflicts_with = "proto")]
    descriptor_set: Option<PathBuf>,

    /// Byte range, as "N-M" (repeatable)
    #[arg(short = 'r', long = "range", value_name = "RANGE")]
    range: Vec<String>,

    /// Never hand images to the terminal renderer
    #[arg(long)]
    no_image: bool,

    /// Formatting: auto, on, or off
    #[arg(long, value_name = "MODE", default_value = "auto")]
    format: String,

    /// Print response metadata (repeat for request-level detail)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write the body to a file ("-" forces raw stdout)
    #[arg(short = 'o', long, value_name = "PATH")]
    output: Option<String>,

    /// Derive the output filename from the URL
    #[arg(short = 'O', long)]
    remote_name: bool,

    /// Prefer the Content-Disposition filename (implies -O)
    #[arg(long)]
    remote_header_name: bool,

    /// Overwrite an existing output file
    #[arg(long)]
    clobber: bool,

    /// Open a WebSocket session instead of a plain request
    #[arg(long)]
    ws: bool,

    /// Issue a gRPC call (URL path selects /package.Service/Method)
    #[arg(long)]
    grpc: bool,

    /// Edit the request body in $VISUAL / $EDITOR before sending
    #[arg(short = 'e', long)]
    edit: bool,

    /// Read and discard the response body
    #[arg(long, conflicts_with = "output")]
    discard: bool,

    /// Copy the response body to the clipboard (up to 1 MiB)
    #[arg(long)]
    copy: bool,

    /// Render a request-phase timing waterfall on stderr
    #[arg(long)]
    timing: bool,

    /// Exit 0 regardless of the HTTP status
    #[arg(long)]
    ignore_status: bool,

    /// Never pipe output through a pager
    #[arg(long)]
    no_pager: bool,

    /// Do not request compressed responses
    #[arg(long)]
    no_encode: bool,
}

/// 128+signal, recorded by the shutdown task.
static SIGNAL_EXIT: AtomicI32 = AtomicI32::new(0);

fn main() {
    let cli = Cli::parse();

    // Priority: RUST_LOG > verbosity flags > default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("snag=warn"),
        1 => EnvFilter::new("snag=info"),
        _ => EnvFilter::new("snag=debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    // Explicit runtime builder instead of `#[tokio::main]`: a CLI that
    // runs one request has no use for the default blocking pool size.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(8)
        .build()
        .expect("building tokio runtime");

    let code = runtime.block_on(async_main(cli));
    std::process::exit(code);
}

async fn async_main(cli: Cli) -> i32 {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match run(cli, &cancel).await {
        Ok(code) => code,
        Err(Error::Canceled) => {
            let sig = SIGNAL_EXIT.load(Ordering::SeqCst);
            if sig > 0 {
                128 + sig
            } else {
                1
            }
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<i32, Error> {
    let mut req = build_request(&cli).await?;
    let env = TermEnv::detect();

    if let Some(proxy) = &req.proxy {
        return Err(Error::Input(format!(
            "proxying via {proxy} is not supported"
        )));
    }

    // Editing happens before anything reads the body.
    if req.edit {
        apply_editor(&mut req)?;
    }

    // gRPC forces POST over HTTP/2 before the parts are built.
    let mut grpc_method = None;
    if req.grpc {
        let source = req
            .proto_schema
            .clone()
            .ok_or_else(|| Error::Schema("gRPC calls need --proto or --descriptor-set".to_string()))?;
        let pool = grpc::load_schema(&source)?;
        grpc_method = Some(grpc::resolve_method(&pool, req.url.path())?);
        req.method = Some(http::Method::POST);
        req.http_version = HttpVersion::Http2;
    }

    let mut parts = snag::request::build_parts(&req)?;

    // Session jar.
    let sessions_override = std::env::var_os("SNAG_SESSIONS_DIR").map(PathBuf::from);
    let mut session: Option<Session> = match &req.session {
        Some(name) => {
            let dir = session::sessions_dir(sessions_override.as_deref())?;
            Some(Session::load(name, &dir)?)
        }
        None => None,
    };

    let transport = client::build_transport(&req)?;

    // WebSocket sessions branch off after the dialer exists.
    if req.websocket || matches!(req.url.scheme(), "ws" | "wss") {
        return ws::run_session(&req, &parts, &transport.dialer, cancel, &env).await;
    }

    // Materialize the body; gRPC builds its own frames from the JSON body.
    let body = if let Some(BodySource::GrpcJson(json)) = &req.body {
        let method = grpc_method
            .as_ref()
            .ok_or_else(|| Error::Schema("gRPC body without a resolved method".to_string()))?;
        grpc::apply_headers(&mut parts.headers);
        grpc::build_body(method, json)?
    } else {
        let (body, multipart_ct) = client::materialize_body(req.body.as_ref()).await?;
        if let Some(ct) = multipart_ct {
            if !parts.headers.contains_key(http::header::CONTENT_TYPE) {
                parts.headers.insert(
                    http::header::CONTENT_TYPE,
                    http::header::HeaderValue::from_str(&ct)
                        .map_err(|e| Error::Input(format!("invalid content type: {e}")))?,
                );
            }
        }
        body
    };

    let mut transport = transport;
    let exchange = client::execute(&req, &parts, body, &mut transport, &mut session, cancel).await?;

    let registry = Registry::with_defaults();
    let opts = PresentOptions {
        req: &req,
        env: &env,
        registry: &registry,
        grpc_method: grpc_method.as_ref(),
        parts: &parts,
    };
    let code = output::present(exchange, opts).await;

    if let Some(session) = &session {
        if let Err(e) = session.save() {
            // Degraded, not fatal: the response was already delivered.
            tracing::warn!("saving session: {e}");
        }
    }

    code
}

/// Translate CLI flags into the core `Request`.
async fn build_request(cli: &Cli) -> Result<Request, Error> {
    let url = normalize_url(&cli.url)?;
    let mut req = Request::new(url);

    req.method = match &cli.method {
        Some(m) => Some(
            m.to_uppercase()
                .parse()
                .map_err(|_| Error::Input(format!("invalid method {m:?}")))?,
        ),
        None => None,
    };

    for header in &cli.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| Error::Input(format!("invalid header {header:?} (want Name: value)")))?;
        req.headers
            .push((name.trim().to_string(), value.trim().to_string()));
    }
    for pair in &cli.query {
        let (k, v) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
        req.query.push((k.to_string(), v.to_string()));
    }

    req.body = build_body_source(cli).await?;
    req.content_type = cli.content_type.clone();
    req.auth = build_auth(cli)?;
    req.proxy = match &cli.proxy {
        Some(p) => Some(url::Url::parse(p)?),
        None => None,
    };
    req.dns_server = cli.dns_server.clone();
    req.http_version = match cli.http.as_deref() {
        None => HttpVersion::Default,
        Some("1") | Some("1.1") => HttpVersion::Http1,
        Some("2") => HttpVersion::Http2,
        Some("3") => HttpVersion::Http3,
        Some(other) => return Err(Error::Input(format!("unknown HTTP version {other:?}"))),
    };
    req.tls_floor = match cli.tls.as_deref() {
        None | Some("1.2") => TlsFloor::Tls12,
        Some("1.3") => TlsFloor::Tls13,
        Some(other) => return Err(Error::Input(format!("unknown TLS version {other:?}"))),
    };
    req.insecure = cli.insecure;
    req.ca_certs = cli.ca_certs.clone();
    req.client_cert = cli.cert.clone();
    req.unix_socket = cli.unix_socket.clone();
    req.redirects = cli.redirects;
    req.retries = cli.retry;
    req.retry_delay = Duration::from_secs_f64(cli.retry_delay);
    req.timeout = cli.timeout.map(Duration::from_secs_f64);
    req.connect_timeout = cli.connect_timeout.map(Duration::from_secs_f64);
    req.session = cli.session.clone();
    req.proto_schema = if let Some(set) = &cli.descriptor_set {
        Some(SchemaSource::DescriptorSet(set.clone()))
    } else if !cli.proto.is_empty() {
        Some(SchemaSource::ProtoFiles {
            files: cli.proto.clone(),
            imports: cli.proto_imports.clone(),
        })
    } else {
        None
    };
    req.range = cli.range.clone();
    req.image = if cli.no_image {
        ImageMode::Never
    } else {
        ImageMode::Auto
    };
    req.format = match cli.format.as_str() {
        "auto" => FormatMode::Auto,
        "on" | "always" => FormatMode::Always,
        "off" | "never" => FormatMode::Never,
        other => return Err(Error::Input(format!("unknown format mode {other:?}"))),
    };
    req.verbosity = cli.verbose;
    req.output = match cli.output.as_deref() {
        None => OutputTarget::Stdout,
        Some("-") => OutputTarget::StdoutRaw,
        Some(path) => OutputTarget::Path(PathBuf::from(path)),
    };
    req.clobber = cli.clobber;
    req.remote_name = cli.remote_name || cli.remote_header_name;
    req.remote_header_name = cli.remote_header_name;
    req.websocket = cli.ws;
    req.grpc = cli.grpc;
    req.edit = cli.edit;
    req.discard = cli.discard;
    req.copy = cli.copy;
    req.timing = cli.timing;
    req.ignore_status = cli.ignore_status;
    req.no_pager = cli.no_pager;
    req.no_encode = cli.no_encode;

    Ok(req)
}

async fn build_body_source(cli: &Cli) -> Result<Option<BodySource>, Error> {
    // gRPC reframes the raw/JSON body into length-prefixed protobuf.
    if cli.grpc {
        let json = match (&cli.data, &cli.json) {
            (Some(data), _) if data == "@-" => read_stdin().await?,
            (Some(data), _) => data.clone().into_bytes(),
            (None, Some(json)) => json.clone().into_bytes(),
            (None, None) => Vec::new(),
        };
        if cli.xml.is_some() || !cli.form.is_empty() || !cli.multipart.is_empty() || cli.file.is_some()
        {
            return Err(Error::Input("gRPC calls take a raw or JSON body".to_string()));
        }
        return Ok(Some(BodySource::GrpcJson(json)));
    }

    if let Some(data) = &cli.data {
        let bytes = if data == "@-" {
            read_stdin().await?
        } else {
            data.clone().into_bytes()
        };
        return Ok(Some(BodySource::Raw(bytes)));
    }
    if let Some(json) = &cli.json {
        return Ok(Some(BodySource::Json(json.clone().into_bytes())));
    }
    if let Some(xml) = &cli.xml {
        return Ok(Some(BodySource::Xml(xml.clone().into_bytes())));
    }
    if !cli.form.is_empty() {
        let pairs = split_pairs(&cli.form)?;
        return Ok(Some(BodySource::Form(pairs)));
    }
    if !cli.multipart.is_empty() {
        let pairs = split_pairs(&cli.multipart)?;
        return Ok(Some(BodySource::Multipart(pairs)));
    }
    if let Some(path) = &cli.file {
        return Ok(Some(BodySource::File(path.clone())));
    }
    Ok(None)
}

async fn read_stdin() -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut tokio::io::stdin(), &mut buf).await?;
    Ok(buf)
}

fn split_pairs(raw: &[String]) -> Result<Vec<(String, String)>, Error> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| Error::Input(format!("invalid field {pair:?} (want key=value)")))
        })
        .collect()
}

fn build_auth(cli: &Cli) -> Result<Option<Auth>, Error> {
    if let Some(sigv4) = &cli.aws_sigv4 {
        let (region, service) = sigv4
            .split_once('/')
            .ok_or_else(|| Error::Input("--aws-sigv4 wants REGION/SERVICE".to_string()))?;
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Input("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::Input("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        return Ok(Some(Auth::AwsSigV4(SigV4Config {
            region: region.to_string(),
            service: service.to_string(),
            access_key,
            secret_key,
        })));
    }
    if let Some(basic) = &cli.basic {
        let (user, pass) = match basic.split_once(':') {
            Some((u, p)) => (u.to_string(), Some(p.to_string())),
            None => (basic.clone(), None),
        };
        return Ok(Some(Auth::Basic { user, pass }));
    }
    if let Some(token) = &cli.bearer {
        return Ok(Some(Auth::Bearer(token.clone())));
    }
    Ok(None)
}

/// Run the in-memory body through the user's editor.
fn apply_editor(req: &mut Request) -> Result<(), Error> {
    let (initial, suffix, rebuild): (Vec<u8>, &str, fn(Vec<u8>) -> BodySource) = match &req.body {
        Some(BodySource::Raw(d)) => (d.clone(), ".txt", BodySource::Raw),
        Some(BodySource::Json(d)) => (d.clone(), ".json", BodySource::Json),
        Some(BodySource::Xml(d)) => (d.clone(), ".xml", BodySource::Xml),
        Some(BodySource::GrpcJson(d)) => (d.clone(), ".json", BodySource::GrpcJson),
        None => (Vec::new(), ".txt", BodySource::Raw),
        Some(_) => {
            return Err(Error::Input(
                "--edit only applies to raw, JSON, or XML bodies".to_string(),
            ))
        }
    };
    let edited = snag::term::edit_body(&initial, suffix)?;
    debug!("editor returned {} byte(s)", edited.len());
    req.body = Some(rebuild(edited));
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            SIGNAL_EXIT.store(2, Ordering::SeqCst);
        }
        _ = terminate => {
            SIGNAL_EXIT.store(15, Ordering::SeqCst);
        }
    }
    cancel.cancel();
}
