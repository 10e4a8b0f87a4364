//! Dialing: TCP connect, optional TLS handshake, Unix-socket variant.
//!
//! The dialer owns the connect-timeout window (DNS + TCP + TLS together)
//! and fills in the per-phase timings on the attempt's [`ConnMetrics`].
//! TLS policy lives here too: version floor (default 1.2), `--insecure`
//! verification bypass, user CA lists replacing the root store, and an
//! optional client certificate.

use crate::error::Error;
use crate::request::TlsFloor;
use crate::resolver::Resolver;
use crate::timing::{ConnMetrics, TlsInfo};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

/// TLS knobs carried from the request.
#[derive(Debug, Clone, Default)]
pub struct TlsParams {
    pub floor: TlsFloor,
    pub insecure: bool,
    pub ca_certs: Vec<PathBuf>,
    pub client_cert: Option<PathBuf>,
}

/// An established network conduit, plaintext or TLS, TCP or Unix.
#[derive(Debug)]
pub enum Conduit {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(unix)]
    UnixTls(Box<TlsStream<tokio::net::UnixStream>>),
}

macro_rules! conduit_dispatch {
    ($self:ident, $inner:ident => $e:expr) => {
        match $self.get_mut() {
            Conduit::Tcp($inner) => $e,
            Conduit::Tls($inner) => $e,
            #[cfg(unix)]
            Conduit::Unix($inner) => $e,
            #[cfg(unix)]
            Conduit::UnixTls($inner) => $e,
        }
    };
}

impl AsyncRead for Conduit {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        conduit_dispatch!(self, inner => Pin::new(inner).poll_read(cx, buf))
    }
}

impl AsyncWrite for Conduit {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        conduit_dispatch!(self, inner => Pin::new(inner).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        conduit_dispatch!(self, inner => Pin::new(inner).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        conduit_dispatch!(self, inner => Pin::new(inner).poll_shutdown(cx))
    }
}

impl Conduit {
    /// ALPN protocol negotiated on this conduit, when it carries TLS.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        match self {
            Conduit::Tls(s) => s.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
            #[cfg(unix)]
            Conduit::UnixTls(s) => s.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
            _ => None,
        }
    }
}

/// Opens conduits for one request. Owns the resolver so redirect hops keep
/// using the user's DNS server.
pub struct Dialer {
    pub resolver: Resolver,
    pub connect_timeout: Option<Duration>,
    pub unix_socket: Option<PathBuf>,
    pub tls: TlsParams,
}

impl Dialer {
    /// Dial the URL's authority. The connect timeout spans DNS, TCP and
    /// TLS together.
    pub async fn dial(
        &self,
        url: &Url,
        alpn: &[Vec<u8>],
        metrics: &mut ConnMetrics,
    ) -> Result<Conduit, Error> {
        let fut = self.dial_inner(url, alpn, metrics);
        match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| Error::Connect(format!("connect timed out after {timeout:?}")))?,
            None => fut.await,
        }
    }

    async fn dial_inner(
        &self,
        url: &Url,
        alpn: &[Vec<u8>],
        metrics: &mut ConnMetrics,
    ) -> Result<Conduit, Error> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Input(format!("url has no host: {url}")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Input(format!("cannot determine port for {url}")))?;
        let wants_tls = matches!(url.scheme(), "https" | "wss");

        // Unix socket overrides the network entirely; the URL authority
        // only matters for Host/SNI.
        #[cfg(unix)]
        if let Some(path) = &self.unix_socket {
            let start = Instant::now();
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| Error::Connect(format!("unix socket {}: {e}", path.display())))?;
            metrics.tcp_start = Some(start);
            metrics.tcp_duration = Some(start.elapsed());
            if wants_tls {
                let tls = self.handshake(stream, host, alpn, metrics).await?;
                return Ok(Conduit::UnixTls(Box::new(tls)));
            }
            return Ok(Conduit::Unix(stream));
        }
        #[cfg(not(unix))]
        if self.unix_socket.is_some() {
            return Err(Error::Input(
                "unix sockets are not supported on this platform".to_string(),
            ));
        }

        let dns_start = Instant::now();
        let addrs = self.resolver.resolve(host).await?;
        metrics.dns_start = Some(dns_start);
        metrics.dns_duration = Some(dns_start.elapsed());
        metrics.dns_host = Some(host.to_string());
        metrics.dns_addrs = addrs.clone();

        let addr = SocketAddr::new(addrs[0], port);
        let tcp_start = Instant::now();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        metrics.tcp_start = Some(tcp_start);
        metrics.tcp_duration = Some(tcp_start.elapsed());
        debug!("connected to {}", addr);

        if wants_tls {
            let tls = self.handshake(stream, host, alpn, metrics).await?;
            return Ok(Conduit::Tls(Box::new(tls)));
        }
        Ok(Conduit::Tcp(stream))
    }

    async fn handshake<S>(
        &self,
        stream: S,
        host: &str,
        alpn: &[Vec<u8>],
        metrics: &mut ConnMetrics,
    ) -> Result<TlsStream<S>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let config = build_tls_config(&self.tls, alpn)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {host:?}: {e}")))?;
        let connector = TlsConnector::from(Arc::new(config));

        let tls_start = Instant::now();
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(classify_tls_error)?;
        metrics.tls_start = Some(tls_start);
        metrics.tls_duration = Some(tls_start.elapsed());

        let conn = &stream.get_ref().1;
        metrics.tls = Some(TlsInfo {
            version: conn.protocol_version().map(|v| format!("{v:?}")),
            cipher: conn
                .negotiated_cipher_suite()
                .map(|c| format!("{:?}", c.suite())),
            alpn: conn
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            resumed: conn.handshake_kind() == Some(rustls::HandshakeKind::Resumed),
            peer_cert_summary: conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|leaf| format!("leaf certificate, {} bytes DER", leaf.as_ref().len())),
        });
        Ok(stream)
    }
}

/// Map TLS handshake I/O errors, separating trust failures (never retried,
/// `--insecure` hint) from transient handshake problems.
fn classify_tls_error(err: std::io::Error) -> Error {
    if let Some(inner) = err.get_ref() {
        if let Some(rustls_err) = inner.downcast_ref::<rustls::Error>() {
            if let rustls::Error::InvalidCertificate(cert_err) = rustls_err {
                return Error::CertTrust(format!("{cert_err:?}"));
            }
            return Error::Tls(rustls_err.to_string());
        }
    }
    Error::Tls(err.to_string())
}

/// Build the client TLS configuration from request policy plus the ALPN
/// list the chosen transport wants.
pub fn build_tls_config(params: &TlsParams, alpn: &[Vec<u8>]) -> Result<rustls::ClientConfig, Error> {
    let versions: &[&rustls::SupportedProtocolVersion] = match params.floor {
        TlsFloor::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsFloor::Tls13 => &[&rustls::version::TLS13],
    };

    let builder = rustls::ClientConfig::builder_with_protocol_versions(versions);

    let builder = if params.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
    } else {
        let mut roots = RootCertStore::empty();
        if params.ca_certs.is_empty() {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                roots.add(cert).ok();
            }
        } else {
            // A user CA list becomes the whole root store.
            for path in &params.ca_certs {
                for cert in read_pem_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        Error::Tls(format!("bad CA certificate in {}: {e}", path.display()))
                    })?;
                }
            }
        }
        builder.with_root_certificates(roots)
    };

    let mut config = match &params.client_cert {
        Some(path) => {
            let certs = read_pem_certs(path)?;
            let key = read_pem_key(path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Tls(format!("client certificate: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    config.alpn_protocols = alpn.to_vec();
    Ok(config)
}

/// TLS config with native roots and verification on, for internal fetches
/// (DoH queries) that carry no user TLS policy.
pub fn default_tls_config(alpn: &[Vec<u8>]) -> Result<rustls::ClientConfig, Error> {
    build_tls_config(&TlsParams::default(), alpn)
}

fn read_pem_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Input(format!("cannot read {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", path.display())))
}

fn read_pem_key(
    path: &std::path::Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Input(format!("cannot read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::Tls(format!("parsing key in {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Certificate verifier that accepts anything; only reachable behind
/// `--insecure`.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_alpn() {
        let config = default_tls_config(&[b"h2".to_vec(), b"http/1.1".to_vec()]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_insecure_config_builds() {
        let params = TlsParams {
            insecure: true,
            ..Default::default()
        };
        assert!(build_tls_config(&params, &[]).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_input_error() {
        let params = TlsParams {
            ca_certs: vec![PathBuf::from("/nonexistent/ca.pem")],
            ..Default::default()
        };
        assert!(matches!(
            build_tls_config(&params, &[]),
            Err(Error::Input(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_plaintext_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = Dialer {
            resolver: Resolver::System,
            connect_timeout: Some(Duration::from_secs(5)),
            unix_socket: None,
            tls: TlsParams::default(),
        };
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let mut metrics = ConnMetrics::default();
        let conduit = dialer.dial(&url, &[], &mut metrics).await.unwrap();
        assert!(matches!(conduit, Conduit::Tcp(_)));
        assert!(metrics.tcp_duration.is_some());
        assert_eq!(metrics.dns_addrs, vec!["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_connect_refused_classified() {
        let dialer = Dialer {
            resolver: Resolver::System,
            connect_timeout: None,
            unix_socket: None,
            tls: TlsParams::default(),
        };
        // Port 1 on loopback is almost certainly closed.
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let mut metrics = ConnMetrics::default();
        let err = dialer.dial(&url, &[], &mut metrics).await.unwrap_err();
        assert!(err.is_retryable(), "connect errors feed the retry engine");
    }
}
