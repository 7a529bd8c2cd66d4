//! Redirect policy: scope checks, `Location` resolution and the method
//! rewrite rule.

use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::{Error, ErrorKind, Result};
use crate::options::RedirectMode;

/// One followed redirect: the response head that caused the hop.
#[derive(Debug, Clone)]
pub struct Hop {
    /// Redirect status (301, 302, 303, 307 or 308).
    pub status: StatusCode,
    /// Full response headers of the redirecting response.
    pub headers: HeaderMap,
    /// The `Location` header value exactly as received.
    pub location: String,
}

/// Statuses the session follows.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// The strict method rewrite rule: 307/308 preserve method and body, 303
/// always becomes a body-less GET, and 301/302 downgrade only POST.
pub(crate) fn rewrite_method(status: StatusCode, method: &Method) -> (Method, bool) {
    match status.as_u16() {
        303 => (Method::GET, false),
        301 | 302 if *method == Method::POST => (Method::GET, false),
        _ => (method.clone(), true),
    }
}

fn effective_port(uri: &Uri) -> u16 {
    uri.port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 })
}

impl RedirectMode {
    /// Whether a redirect from `base` to `target` stays inside this scope.
    pub(crate) fn allows(self, base: &Uri, target: &Uri) -> bool {
        let (Some(from), Some(to)) = (base.host(), target.host()) else {
            return false;
        };
        match self {
            RedirectMode::None => false,
            RedirectMode::Any => true,
            RedirectMode::SameEndpoint => {
                from.eq_ignore_ascii_case(to)
                    && effective_port(base) == effective_port(target)
                    && base.scheme_str() == target.scheme_str()
            }
            RedirectMode::SameHost => from.eq_ignore_ascii_case(to),
            RedirectMode::SamePort => {
                from.eq_ignore_ascii_case(to) && effective_port(base) == effective_port(target)
            }
            RedirectMode::PrivateDomain => {
                registrable_domain(from).eq_ignore_ascii_case(registrable_domain(to))
            }
            RedirectMode::PublicSuffix => {
                public_suffix(from).eq_ignore_ascii_case(public_suffix(to))
            }
        }
    }
}

/// Multi-label public suffixes recognized in addition to plain TLDs. The
/// table is intentionally compact; hosts under suffixes not listed here
/// fall back to a last-two-labels registrable domain.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "net.uk", "co.jp", "ne.jp", "or.jp", "ac.jp",
    "com.au", "net.au", "org.au", "edu.au", "gov.au", "co.nz", "net.nz", "org.nz", "com.br",
    "net.br", "org.br", "com.cn", "net.cn", "org.cn", "com.mx", "co.in", "net.in", "org.in",
    "co.kr", "or.kr", "com.tw", "com.sg", "com.hk", "co.za", "org.za", "com.ar", "com.tr",
];

fn public_suffix(host: &str) -> &str {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    for suffix in MULTI_LABEL_SUFFIXES {
        if let Some(prefix) = host.strip_suffix(suffix) {
            if prefix.is_empty() || prefix.ends_with('.') {
                return &host[host.len() - suffix.len()..];
            }
        }
    }
    match host.rfind('.') {
        Some(idx) => &host[idx + 1..],
        None => host,
    }
}

/// The registrable domain: one label more than the public suffix.
fn registrable_domain(host: &str) -> &str {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let suffix = public_suffix(host);
    if suffix.len() == host.len() {
        return host;
    }
    let prefix = &host[..host.len() - suffix.len() - 1];
    match prefix.rfind('.') {
        Some(idx) => &host[idx + 1..],
        None => host,
    }
}

/// Resolves a `Location` header against the URL that produced it.
///
/// Handles absolute URLs, scheme-relative (`//host/..`), absolute-path and
/// relative-path forms; relative paths are joined against the base path's
/// directory and dot segments are normalized.
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let invalid = || Error::with_context(ErrorKind::InvalidUrl, format!("location {location:?}"));

    if location.starts_with("http://") || location.starts_with("https://") {
        return location.parse::<Uri>().map_err(|_| invalid());
    }
    if let Some(rest) = location.strip_prefix("//") {
        let scheme = base.scheme_str().ok_or_else(invalid)?;
        return format!("{scheme}://{rest}").parse::<Uri>().map_err(|_| invalid());
    }

    let scheme = base.scheme_str().ok_or_else(invalid)?;
    let authority = base.authority().ok_or_else(invalid)?;

    let path_and_query = if location.starts_with('/') {
        location.to_owned()
    } else {
        let base_path = base.path();
        let dir = match base_path.rfind('/') {
            Some(idx) => &base_path[..=idx],
            None => "/",
        };
        normalize_dot_segments(&format!("{dir}{location}"))
    };

    format!("{scheme}://{authority}{path_and_query}")
        .parse::<Uri>()
        .map_err(|_| invalid())
}

fn normalize_dot_segments(path: &str) -> String {
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    if path.ends_with('/') && out.len() > 1 {
        out.push('/');
    }
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}
