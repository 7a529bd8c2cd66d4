//! Multi-host session: policy and pool management.
//!
//! A [`Session`] maps every request URL onto a per-host pool and applies the
//! cross-request policy around each exchange: default headers, cookie-jar
//! lookups and updates, TLS enforcement and redirect following. Sessions
//! are cheap handles; clones share the same pools.

use std::sync::Arc;

use dashmap::DashMap;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};

use crate::body::Body;
use crate::cookies::CookieJar;
use crate::error::{Error, ErrorKind, Result};
use crate::options::{RedirectMode, RequestOptions};
use crate::pool::{HostKey, Pool};
use crate::redirect::{self, Hop};
use crate::request::RequestBuilder;
use crate::stream::ResponseStream;
use crate::transport::{Endpoint, Transport};

/// A pooling HTTP client with shared policy.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    pools: DashMap<HostKey, Arc<Pool>>,
    options: RequestOptions,
    default_headers: HeaderMap,
    jar: Option<Arc<CookieJar>>,
    transport: Arc<Transport>,
}

/// Configures and builds a [`Session`].
pub struct SessionBuilder {
    options: RequestOptions,
    default_headers: HeaderMap,
    jar: Option<Arc<CookieJar>>,
    extra_root_cert: Option<Vec<u8>>,
}

impl SessionBuilder {
    fn new() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static(concat!("harbor/", env!("CARGO_PKG_VERSION"))),
        );
        Self {
            options: RequestOptions::default(),
            default_headers,
            jar: Some(Arc::new(CookieJar::new())),
            extra_root_cert: None,
        }
    }

    /// Replaces the session-wide request options.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Rejects plain `http://` URLs.
    pub fn enforce_tls(mut self, enforce: bool) -> Self {
        self.options.enforce_tls = enforce;
        self
    }

    /// Redirect hop cap; 0 disables following.
    pub fn max_redirects(mut self, max: u16) -> Self {
        self.options.max_redirects = max;
        self
    }

    /// Scope filter for followed redirects.
    pub fn redirect_mode(mut self, mode: RedirectMode) -> Self {
        self.options.redirect_mode = mode;
        self
    }

    /// Per-connect deadline.
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Per-exchange deadline.
    pub fn exchange_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.exchange_timeout = timeout;
        self
    }

    /// Byte cap for buffered bodies.
    pub fn max_response_size(mut self, max: u64) -> Self {
        self.options.max_response_size = max;
        self
    }

    /// Whether to keep idle connections for reuse.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.options.keep_alive = keep_alive;
        self
    }

    /// Cap on concurrent connections per host.
    pub fn pool_limit_per_host(mut self, limit: usize) -> Self {
        self.options.pool_limit_per_host = limit;
        self
    }

    /// Idle connections older than this are evicted.
    pub fn idle_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    /// Adds a header sent with every request, at lower precedence than
    /// caller-supplied headers.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Disables or re-enables the cookie jar.
    pub fn cookie_store(mut self, enabled: bool) -> Self {
        self.jar = enabled.then(|| Arc::new(CookieJar::new()));
        self
    }

    /// Uses `jar` instead of a fresh jar, e.g. one restored from a
    /// snapshot or shared between sessions.
    pub fn cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.jar = Some(jar);
        self
    }

    /// Trusts an additional CA certificate (DER) beyond the webpki roots.
    pub fn add_root_certificate(mut self, der: Vec<u8>) -> Self {
        self.extra_root_cert = Some(der);
        self
    }

    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                pools: DashMap::new(),
                options: self.options,
                default_headers: self.default_headers,
                jar: self.jar,
                transport: Arc::new(Transport::new(self.extra_root_cert)),
            }),
        }
    }
}

macro_rules! http_method {
    ($name:ident, $variant:expr) => {
        #[doc = concat!("Initiates a `", stringify!($variant), "` request to the given URL.")]
        #[inline]
        pub fn $name<U>(&self, url: U) -> RequestBuilder
        where
            U: TryInto<Uri>,
            http::Error: From<<U as TryInto<Uri>>::Error>,
        {
            self.request($variant, url)
        }
    };
}

impl Session {
    /// A session with default options.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The session-wide option defaults.
    pub fn options(&self) -> &RequestOptions {
        &self.inner.options
    }

    /// The session's cookie jar, unless cookies are disabled.
    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        self.inner.jar.as_deref()
    }

    /// Creates a request builder with the specified HTTP method and URL.
    pub fn request<U>(&self, method: Method, url: U) -> RequestBuilder
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        RequestBuilder::new(self.clone(), method, url)
    }

    http_method!(get, Method::GET);
    http_method!(head, Method::HEAD);
    http_method!(post, Method::POST);
    http_method!(put, Method::PUT);
    http_method!(patch, Method::PATCH);
    http_method!(delete, Method::DELETE);

    /// Number of live connections currently pooled for `url`'s host.
    /// Mostly useful in tests.
    pub fn pooled_connections<U>(&self, url: U) -> usize
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        let Ok(url) = url.try_into() else { return 0 };
        let Ok(endpoint) = endpoint_of(&url, &self.inner.options) else {
            return 0;
        };
        let key = host_key(&endpoint);
        self.inner
            .pools
            .get(&key)
            .map(|pool| pool.connection_count())
            .unwrap_or(0)
    }

    /// The redirect-following request loop behind every builder.
    pub(crate) async fn do_ropen(
        &self,
        method: Method,
        url: Uri,
        headers: HeaderMap,
        body: Body,
        opts: RequestOptions,
    ) -> Result<ResponseStream> {
        let mut method = method;
        let mut url = url;
        let mut body = body;
        let mut history: Vec<Hop> = Vec::new();
        let mut hops: u16 = 0;

        loop {
            let endpoint = endpoint_of(&url, &opts)?;
            let key = host_key(&endpoint);
            let pool = self
                .inner
                .pools
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Pool::new(
                        endpoint.clone(),
                        self.inner.transport.clone(),
                        &self.inner.options,
                    ))
                })
                .clone();

            let hop_headers = self.assemble_headers(&headers, &url)?;
            let target = url
                .path_and_query()
                .map(|pq| pq.as_str().to_owned())
                .unwrap_or_else(|| "/".to_owned());
            let host_header = host_header_of(&endpoint);

            let conn = pool.acquire(&opts).await?;
            tracing::debug!(%method, %url, conn = conn.id, "sending request");

            let (head, decoder) = match conn
                .ropen(&method, &target, &host_header, &hop_headers, &mut body, &opts)
                .await
            {
                Ok(parts) => parts,
                Err(err) => {
                    pool.release(conn, false);
                    return Err(err);
                }
            };

            if let Some(jar) = &self.inner.jar {
                for value in head.headers.get_all(http::header::SET_COOKIE) {
                    if let Ok(value) = value.to_str() {
                        jar.store(&url, value);
                    }
                }
            }

            let location = head
                .headers
                .get(http::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);

            let follow = redirect::is_redirect(head.status) && location.is_some();
            if !follow {
                return Ok(ResponseStream::new(
                    head.status,
                    head.headers,
                    history,
                    decoder,
                    conn,
                    Arc::downgrade(&pool),
                    opts,
                ));
            }

            let location = location.unwrap_or_default();
            let status = head.status;
            let response_headers = head.headers;

            // Drain the redirect body so the connection can go back idle
            // (or be retired if the peer asked to close).
            let mut drained = ResponseStream::new(
                status,
                HeaderMap::new(),
                Vec::new(),
                decoder,
                conn,
                Arc::downgrade(&pool),
                opts.clone(),
            );
            let _ = drained.dump().await;
            drop(drained);

            if hops >= opts.max_redirects {
                tracing::debug!(%url, hops, "redirect cap exhausted");
                return Err(Error::new(ErrorKind::TooManyRedirects).with_history(history));
            }

            let next = match redirect::resolve_location(&url, &location) {
                Ok(next) => next,
                Err(err) => return Err(err.with_history(history)),
            };
            if !opts.redirect_mode.allows(&url, &next) {
                tracing::debug!(from = %url, to = %next, mode = ?opts.redirect_mode, "redirect out of scope");
                return Err(Error::new(ErrorKind::ForbiddenRedirect).with_history(history));
            }

            let (next_method, keep_body) = redirect::rewrite_method(status, &method);
            if keep_body {
                body.rewind();
            } else {
                body = Body::empty();
            }
            method = next_method;

            history.push(Hop {
                status,
                headers: response_headers,
                location,
            });
            hops += 1;
            url = next;
        }
    }

    /// Caller headers, then session defaults, then cookies.
    fn assemble_headers(&self, caller: &HeaderMap, url: &Uri) -> Result<HeaderMap> {
        let mut headers = caller.clone();
        for (name, value) in &self.inner.default_headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        if let Some(jar) = &self.inner.jar {
            if !headers.contains_key(http::header::COOKIE) {
                if let Some(cookie) = jar.collect(url) {
                    let value = HeaderValue::from_str(&cookie)
                        .map_err(|e| Error::with_source(ErrorKind::InvalidUrl, e))?;
                    headers.insert(http::header::COOKIE, value);
                }
            }
        }
        Ok(headers)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn host_key(endpoint: &Endpoint) -> HostKey {
    HostKey {
        host: endpoint.host.clone(),
        port: endpoint.port,
        tls: endpoint.tls,
    }
}

fn endpoint_of(url: &Uri, opts: &RequestOptions) -> Result<Endpoint> {
    let tls = match url.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        _ => {
            return Err(Error::with_context(
                ErrorKind::InvalidUrl,
                format!("unsupported scheme in {url}"),
            ))
        }
    };
    if opts.enforce_tls && !tls {
        return Err(Error::with_context(
            ErrorKind::InsecureTransport,
            url.to_string(),
        ));
    }
    let host = url
        .host()
        .ok_or_else(|| Error::with_context(ErrorKind::InvalidUrl, "url missing host"))?;
    let port = url.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok(Endpoint {
        host: host.to_owned(),
        port,
        tls,
    })
}

fn host_header_of(endpoint: &Endpoint) -> String {
    let default_port = if endpoint.tls { 443 } else { 80 };
    if endpoint.port == default_port {
        endpoint.host.clone()
    } else {
        format!("{}:{}", endpoint.host, endpoint.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation() {
        let opts = RequestOptions::default();
        let ep = endpoint_of(&"http://example.com/x".parse().unwrap(), &opts).unwrap();
        assert_eq!((ep.host.as_str(), ep.port, ep.tls), ("example.com", 80, false));

        let ep = endpoint_of(&"https://example.com:8443/".parse().unwrap(), &opts).unwrap();
        assert_eq!((ep.port, ep.tls), (8443, true));

        let err = endpoint_of(&"ftp://example.com/".parse().unwrap(), &opts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);

        let strict = RequestOptions {
            enforce_tls: true,
            ..RequestOptions::default()
        };
        let err = endpoint_of(&"http://example.com/".parse().unwrap(), &strict).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsecureTransport);
    }

    #[test]
    fn host_header_omits_default_port() {
        let ep = Endpoint {
            host: "example.com".into(),
            port: 443,
            tls: true,
        };
        assert_eq!(host_header_of(&ep), "example.com");
        let ep = Endpoint {
            host: "example.com".into(),
            port: 8080,
            tls: false,
        };
        assert_eq!(host_header_of(&ep), "example.com:8080");
    }

    #[test]
    fn default_headers_yield_to_caller() {
        let session = Session::builder()
            .default_header(
                http::header::USER_AGENT,
                HeaderValue::from_static("custom/1"),
            )
            .build();
        let mut caller = HeaderMap::new();
        caller.insert(http::header::USER_AGENT, HeaderValue::from_static("mine/2"));
        let url: Uri = "http://example.com/".parse().unwrap();

        let merged = session.assemble_headers(&caller, &url).unwrap();
        assert_eq!(merged.get(http::header::USER_AGENT).unwrap(), "mine/2");

        let merged = session.assemble_headers(&HeaderMap::new(), &url).unwrap();
        assert_eq!(merged.get(http::header::USER_AGENT).unwrap(), "custom/1");
    }
}
