//! In-memory cookie jar.
//!
//! The session layer talks to the jar through two calls: [`CookieJar::collect`]
//! before a request is written, and [`CookieJar::store`] for each `Set-Cookie`
//! header on a response. Matching covers domain, path, the Secure flag and
//! expiry; jars are internally synchronized so one jar can serve concurrent
//! requests.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::Uri;

/// A single stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Matching domain; a leading `.` marks a domain cookie that also
    /// matches subdomains.
    pub domain: String,
    pub path: String,
    /// Unix seconds; `None` means a session cookie.
    pub expires: Option<u64>,
    /// Only sent over TLS.
    pub secure: bool,
}

impl Cookie {
    fn is_expired(&self, now: u64) -> bool {
        self.expires.is_some_and(|at| at < now)
    }

    fn matches_domain(&self, host: &str) -> bool {
        if let Some(suffix) = self.domain.strip_prefix('.') {
            host == suffix || host.ends_with(&self.domain)
        } else {
            host == self.domain
        }
    }

    fn matches_path(&self, path: &str) -> bool {
        if self.path == "/" {
            return true;
        }
        path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path.as_bytes().get(self.path.len()) == Some(&b'/')))
    }

    fn matches(&self, host: &str, path: &str, secure: bool, now: u64) -> bool {
        !self.is_expired(now)
            && (!self.secure || secure)
            && self.matches_domain(host)
            && self.matches_path(path)
    }
}

/// Thread-safe cookie storage.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cookies applicable to `url`, rendered as a `Cookie` header value.
    /// Returns `None` when nothing matches.
    pub fn collect(&self, url: &Uri) -> Option<String> {
        let host = url.host()?;
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let secure = url.scheme_str() == Some("https");
        let now = unix_now();

        let cookies = self.cookies.lock().expect("cookie jar poisoned");
        let mut header = String::new();
        for cookie in cookies.iter() {
            if cookie.matches(host, path, secure, now) {
                if !header.is_empty() {
                    header.push_str("; ");
                }
                header.push_str(&cookie.name);
                header.push('=');
                header.push_str(&cookie.value);
            }
        }
        (!header.is_empty()).then_some(header)
    }

    /// Records one `Set-Cookie` header value received from `url`'s origin.
    /// Malformed headers are ignored.
    pub fn store(&self, url: &Uri, set_cookie: &str) {
        let Some(host) = url.host() else { return };
        let Some(mut cookie) = parse_set_cookie(set_cookie, host) else {
            return;
        };
        if cookie.path.is_empty() {
            cookie.path = default_path(url.path());
        }

        let mut cookies = self.cookies.lock().expect("cookie jar poisoned");
        cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        // An already-expired expiry is a deletion request.
        if !cookie.is_expired(unix_now()) {
            cookies.push(cookie);
        }
    }

    /// Number of stored (possibly expired) cookies.
    pub fn len(&self) -> usize {
        self.cookies.lock().expect("cookie jar poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every cookie.
    pub fn clear(&self) {
        self.cookies.lock().expect("cookie jar poisoned").clear();
    }

    /// Serializes the jar for persistence.
    #[cfg(feature = "json")]
    pub fn save_to_bytes(&self) -> Vec<u8> {
        let cookies = self.cookies.lock().expect("cookie jar poisoned");
        serde_json::to_vec(&*cookies).unwrap_or_default()
    }

    /// Restores a jar previously written by
    /// [`save_to_bytes`](Self::save_to_bytes). Replaces current contents.
    #[cfg(feature = "json")]
    pub fn load_from_bytes(&self, data: &[u8]) -> crate::Result<()> {
        let restored: Vec<Cookie> = serde_json::from_slice(data)?;
        *self.cookies.lock().expect("cookie jar poisoned") = restored;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// The request path's directory, per RFC 6265 §5.1.4.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_owned();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => request_path[..idx].to_owned(),
    }
}

fn parse_set_cookie(header: &str, request_host: &str) -> Option<Cookie> {
    let mut parts = header.split(';');

    let name_value = parts.next()?.trim();
    let (name, value) = name_value.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_owned(),
        value: value.trim().to_owned(),
        domain: request_host.to_owned(),
        path: String::new(),
        expires: None,
        secure: false,
    };

    let now = unix_now();
    for attr in parts {
        let attr = attr.trim();
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr, ""),
        };
        if key.eq_ignore_ascii_case("domain") {
            let domain = val.trim_start_matches('.');
            if !domain.is_empty() {
                // A Domain attribute always covers subdomains.
                cookie.domain = format!(".{domain}");
            }
        } else if key.eq_ignore_ascii_case("path") {
            if val.starts_with('/') {
                cookie.path = val.to_owned();
            }
        } else if key.eq_ignore_ascii_case("max-age") {
            if let Ok(seconds) = val.parse::<i64>() {
                cookie.expires = Some(if seconds <= 0 {
                    0
                } else {
                    now.saturating_add(seconds as u64)
                });
            }
        } else if key.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
        }
        // Expires, HttpOnly and SameSite attributes are accepted but not
        // interpreted; Max-Age is the supported expiry mechanism.
    }

    Some(cookie)
}
