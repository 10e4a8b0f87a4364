//! On-disk cookie sessions.
//!
//! One JSON file per session name under the user cache directory
//! (overridable with `SNAG_SESSIONS_DIR`). Expired cookies are dropped at
//! load time; saves are atomic (temp file + rename). The session itself is
//! the jar: the client asks it for a `Cookie` header per hop and feeds it
//! every `Set-Cookie` it sees, upserting by `(name, domain, path)`.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

/// SameSite attribute, serialized as `"lax" | "strict" | "none"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

/// One cookie as persisted. Zero-valued fields are omitted from the JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<SameSite>,
}

impl Cookie {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(exp) if exp < now)
    }
}

/// On-disk session file layout: `{"cookies":[...]}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    cookies: Vec<Cookie>,
}

/// A named cookie session backed by one JSON file.
#[derive(Debug)]
pub struct Session {
    path: PathBuf,
    cookies: Vec<Cookie>,
}

/// Session names are path components; keep them boring.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::SessionName(name.to_string()));
    }
    Ok(())
}

/// Resolve the sessions directory: explicit override first, then the
/// per-user cache directory.
pub fn sessions_dir(override_dir: Option<&Path>) -> Result<PathBuf, Error> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    dirs::cache_dir()
        .map(|d| d.join("snag").join("sessions"))
        .ok_or_else(|| Error::Input("cannot determine user cache directory".to_string()))
}

impl Session {
    /// Load a session, filtering out cookies that have already expired.
    /// A missing file is an empty session; a corrupt file is a warning,
    /// not a failure.
    pub fn load(name: &str, dir: &Path) -> Result<Self, Error> {
        validate_name(name)?;
        let path = dir.join(format!("{name}.json"));

        let cookies = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<SessionFile>(&raw) {
                Ok(file) => {
                    let now = Utc::now();
                    file.cookies
                        .into_iter()
                        .filter(|c| !c.is_expired(now))
                        .collect()
                }
                Err(e) => {
                    warn!("session file {:?} is corrupt, starting fresh: {}", path, e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("session {:?}: {} live cookie(s)", name, cookies.len());
        Ok(Self { path, cookies })
    }

    /// Persist atomically: write a temp file next to the target, then rename.
    pub fn save(&self) -> Result<(), Error> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Output("session path has no parent directory".to_string()))?;
        std::fs::create_dir_all(dir)?;

        let file = SessionFile {
            cookies: self.cookies.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::Output(format!("serializing session: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Output(format!("saving session: {e}")))?;
        Ok(())
    }

    /// Record a `Set-Cookie` from a response, upserting by
    /// `(name, domain, path)`. Domain defaults to the request hostname,
    /// path to `/`.
    pub fn record_set_cookie(&mut self, url: &Url, value: &str) {
        let parsed = match cookie::Cookie::parse(value.to_string()) {
            Ok(c) => c,
            Err(e) => {
                warn!("ignoring unparseable Set-Cookie: {}", e);
                return;
            }
        };

        let host = url.host_str().unwrap_or("").to_ascii_lowercase();
        let domain = parsed
            .domain()
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .unwrap_or(host);
        let path = parsed
            .path()
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();

        // Max-Age wins over Expires, per RFC 6265.
        let now = Utc::now();
        let expires = if let Some(max_age) = parsed.max_age() {
            Some(now + chrono::Duration::seconds(max_age.whole_seconds()))
        } else {
            parsed
                .expires_datetime()
                .and_then(|odt| DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), 0))
        };

        let cookie = Cookie {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain,
            path,
            expires,
            secure: parsed.secure().unwrap_or(false),
            http_only: parsed.http_only().unwrap_or(false),
            same_site: parsed.same_site().map(|s| match s {
                cookie::SameSite::Lax => SameSite::Lax,
                cookie::SameSite::Strict => SameSite::Strict,
                cookie::SameSite::None => SameSite::None,
            }),
        };

        // Uniqueness key is (name, domain, path).
        match self.cookies.iter_mut().find(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        }) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// The `Cookie` header value for a request, or `None` when no cookie
    /// matches the URL's host, path, scheme and expiry.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let path = url.path();
        let https = matches!(url.scheme(), "https" | "wss");
        let now = Utc::now();

        let matched: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| !c.is_expired(now))
            .filter(|c| !c.secure || https)
            .filter(|c| domain_match(&host, &c.domain))
            .filter(|c| path_match(path, &c.path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if matched.is_empty() {
            None
        } else {
            Some(matched.join("; "))
        }
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }
}

/// RFC 6265 §5.1.3 domain matching.
fn domain_match(host: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// RFC 6265 §5.1.4 path matching.
fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}
