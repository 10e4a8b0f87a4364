//! Hostname resolution, optionally directed at a user-supplied DNS server.
//!
//! Three modes: the system resolver (default), a plain UDP upstream
//! (`--dns-server 10.0.0.1:53`), or DNS-over-HTTPS when the server has a
//! scheme (`--dns-server https://1.1.1.1/dns-query`), using the JSON query
//! format. DoH asks for A records first and falls through to AAAA on an
//! empty answer.

use crate::error::Error;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;
use url::Url;

/// DNS rcode names for error reporting, indexed by rcode.
const RCODE_NAMES: &[&str] = &[
    "NoError", "FormErr", "ServFail", "NXDomain", "NotImp", "Refused", "YXDomain", "YXRRSet",
    "NXRRSet", "NotAuth", "NotZone",
];

pub enum Resolver {
    System,
    Udp(TokioAsyncResolver),
    Doh(Url),
}

impl Resolver {
    /// Build a resolver from the user's `--dns-server` value, if any.
    pub fn new(dns_server: Option<&str>) -> Result<Self, Error> {
        let Some(server) = dns_server else {
            return Ok(Resolver::System);
        };

        if server.contains("://") {
            let url = Url::parse(server)
                .map_err(|e| Error::Input(format!("invalid DNS server url {server:?}: {e}")))?;
            return Ok(Resolver::Doh(url));
        }

        // Plain address, port defaulting to 53.
        let addr: SocketAddr = if server.contains(':') && server.parse::<SocketAddr>().is_ok() {
            server.parse().unwrap()
        } else {
            let ip: IpAddr = server
                .parse()
                .map_err(|_| Error::Input(format!("invalid DNS server address {server:?}")))?;
            SocketAddr::new(ip, 53)
        };

        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Ok(Resolver::Udp(resolver))
    }

    /// Resolve a hostname to its addresses. An IP literal short-circuits.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = match self {
            Resolver::System => {
                // Port is irrelevant; lookup_host wants one.
                tokio::net::lookup_host((host, 0))
                    .await
                    .map_err(|e| Error::Dns(format!("lookup {host}: {e}")))?
                    .map(|sa| sa.ip())
                    .collect::<Vec<_>>()
            }
            Resolver::Udp(resolver) => resolver
                .lookup_ip(host)
                .await
                .map_err(|e| Error::Dns(format!("lookup {host}: {e}")))?
                .iter()
                .collect(),
            Resolver::Doh(server) => doh_resolve(server, host).await?,
        };

        if addrs.is_empty() {
            return Err(Error::Dns(format!("no such host: {host}")));
        }
        debug!("resolved {} -> {:?}", host, addrs);
        Ok(addrs)
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: String,
}

/// Query the DoH server with the JSON API: A records, then AAAA when the
/// answer section comes back empty.
async fn doh_resolve(server: &Url, host: &str) -> Result<Vec<IpAddr>, Error> {
    for record_type in ["A", "AAAA"] {
        let mut url = server.clone();
        url.query_pairs_mut()
            .append_pair("name", host)
            .append_pair("type", record_type);

        let body = doh_get(&url).await?;
        let parsed: DohResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::Dns(format!("invalid DoH answer from {server}: {e}")))?;

        if parsed.status != 0 {
            let name = RCODE_NAMES.get(parsed.status as usize);
            return Err(Error::Dns(match name {
                Some(name) => format!("no such host: {name}"),
                None => format!("no such host: rcode {}", parsed.status),
            }));
        }

        // The answer section can contain CNAME chain entries; keep what
        // parses as an address.
        let ips: Vec<IpAddr> = parsed
            .answer
            .iter()
            .filter_map(|a| a.data.parse().ok())
            .collect();
        if !ips.is_empty() {
            return Ok(ips);
        }
    }
    Err(Error::Dns(format!("no such host: {host}")))
}

/// One-shot HTTP/1.1 GET used only for DoH queries. The DoH server's own
/// hostname resolves through the system resolver; everything else about
/// the request (TLS roots, timeouts) uses conservative defaults.
async fn doh_get(url: &Url) -> Result<Vec<u8>, Error> {
    use http_body_util::{BodyExt, Empty};
    use hyper_util::rt::TokioIo;

    let host = url
        .host_str()
        .ok_or_else(|| Error::Input("DoH server url has no host".to_string()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(443);

    let tcp = tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| Error::Dns(format!("connect DoH server {host}: {e}")))?;

    let authority = url.authority().to_string();
    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri(path)
        .header(http::header::HOST, &authority)
        .header(http::header::ACCEPT, "application/dns-json")
        .header(http::header::USER_AGENT, crate::request::USER_AGENT)
        .body(Empty::<bytes::Bytes>::new())
        .map_err(|e| Error::Dns(format!("building DoH request: {e}")))?;

    let response = if url.scheme() == "https" {
        let tls_config = crate::dial::default_tls_config(&[b"http/1.1".to_vec()])?;
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| Error::Dns(format!("invalid DoH server name: {e}")))?;
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(tls_config));
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Dns(format!("DoH TLS handshake: {e}")))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| Error::Dns(format!("DoH handshake: {e}")))?;
        tokio::spawn(conn);
        sender
            .send_request(req)
            .await
            .map_err(|e| Error::Dns(format!("DoH request: {e}")))?
    } else {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
            .await
            .map_err(|e| Error::Dns(format!("DoH handshake: {e}")))?;
        tokio::spawn(conn);
        sender
            .send_request(req)
            .await
            .map_err(|e| Error::Dns(format!("DoH request: {e}")))?
    };

    if !response.status().is_success() {
        return Err(Error::Dns(format!(
            "DoH server returned {}",
            response.status()
        )));
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Dns(format!("reading DoH answer: {e}")))?;
    Ok(body.to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_literals_short_circuit() {
        let resolver = Resolver::new(None).unwrap();
        let addrs = tokio_test::block_on(resolver.resolve("127.0.0.1")).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_udp_server_parsing() {
        assert!(matches!(Resolver::new(Some("1.1.1.1")), Ok(Resolver::Udp(_))));
        assert!(matches!(
            Resolver::new(Some("8.8.8.8:5353")),
            Ok(Resolver::Udp(_))
        ));
        assert!(matches!(
            Resolver::new(Some("https://1.1.1.1/dns-query")),
            Ok(Resolver::Doh(_))
        ));
        assert!(Resolver::new(Some("not an address")).is_err());
    }

    #[test]
    fn test_doh_answer_parsing() {
        let raw = br#"{"Status":0,"Answer":[{"name":"example.com","type":1,"data":"93.184.216.34"}]}"#;
        let parsed: DohResponse = serde_json::from_slice(raw).unwrap();
        assert_eq!(parsed.status, 0);
        assert_eq!(parsed.answer[0].data, "93.184.216.34");
    }

    #[test]
    fn test_rcode_names() {
        assert_eq!(RCODE_NAMES[3], "NXDomain");
        assert_eq!(RCODE_NAMES[2], "ServFail");
    }
}
