//! Request builder bound to a session.

use std::path::Path;

use http::header::{HeaderName, HeaderValue};
use http::{Method, Uri};
use tokio::io::AsyncWriteExt;

use crate::body::Body;
use crate::error::{Error, ErrorKind, Result};
use crate::options::{RedirectMode, RequestOptions};
use crate::response::Response;
use crate::session::Session;
use crate::stream::ResponseStream;

/// A request under construction.
///
/// Options start from the session defaults and can be overridden per
/// request. Construction errors (bad URL, bad header) are deferred and
/// surface when the request is sent.
pub struct RequestBuilder {
    session: Session,
    method: Method,
    url: Option<Uri>,
    headers: http::HeaderMap,
    body: Body,
    opts: RequestOptions,
    err: Option<Error>,
}

impl RequestBuilder {
    pub(crate) fn new<U>(session: Session, method: Method, url: U) -> Self
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        let opts = session.options().clone();
        let (url, err) = match url.try_into() {
            Ok(url) => (Some(url), None),
            Err(e) => (None, Some(Error::from(http::Error::from(e)))),
        };
        Self {
            session,
            method,
            url,
            headers: http::HeaderMap::new(),
            body: Body::empty(),
            opts,
            err,
        }
    }

    /// Appends a header to the request.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match (HeaderName::try_from(key), HeaderValue::try_from(value)) {
            (Ok(key), Ok(value)) => {
                self.headers.append(key, value);
            }
            (Err(e), _) => self.record(Error::from(e.into())),
            (_, Err(e)) => self.record(Error::from(e.into())),
        }
        self
    }

    /// Attaches a body to the request.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Attaches a JSON body, setting `Content-Type: application/json`.
    #[cfg(feature = "json")]
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Body::json(value) {
            Ok(body) => self.body = body,
            Err(e) => self.record(e),
        }
        self
    }

    /// Attaches a URL-encoded form body.
    pub fn form<K, V>(mut self, pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.body = Body::form(pairs);
        self
    }

    /// Overrides the exchange timeout for this request.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.opts.exchange_timeout = timeout;
        self
    }

    /// Overrides the connect timeout for this request.
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    /// Overrides the redirect hop cap for this request.
    pub fn max_redirects(mut self, max: u16) -> Self {
        self.opts.max_redirects = max;
        self
    }

    /// Overrides the redirect scope for this request.
    pub fn redirect_mode(mut self, mode: RedirectMode) -> Self {
        self.opts.redirect_mode = mode;
        self
    }

    /// Overrides TLS enforcement for this request.
    pub fn enforce_tls(mut self, enforce: bool) -> Self {
        self.opts.enforce_tls = enforce;
        self
    }

    /// Overrides the buffered-body size cap for this request.
    pub fn max_response_size(mut self, max: u64) -> Self {
        self.opts.max_response_size = max;
        self
    }

    /// Overrides keep-alive for this request.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.opts.keep_alive = keep_alive;
        self
    }

    fn record(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    fn into_parts(self) -> Result<(Session, Method, Uri, http::HeaderMap, Body, RequestOptions)> {
        if let Some(err) = self.err {
            return Err(err);
        }
        let url = self
            .url
            .ok_or_else(|| Error::with_context(ErrorKind::InvalidUrl, "missing url"))?;
        Ok((
            self.session,
            self.method,
            url,
            self.headers,
            self.body,
            self.opts,
        ))
    }

    /// Sends the request, returning a streaming handle onto the body.
    pub async fn ropen(self) -> Result<ResponseStream> {
        let (session, method, url, headers, body, opts) = self.into_parts()?;
        session.do_ropen(method, url, headers, body, opts).await
    }

    /// Sends the request and buffers the complete response.
    pub async fn send(self) -> Result<Response> {
        self.ropen().await?.into_response().await
    }

    /// Sends the request and streams the body into the file at `path`,
    /// truncating any existing content. A partially written file is removed
    /// on error. The returned [`Response`] carries the head only.
    pub async fn download(self, path: impl AsRef<Path>) -> Result<Response> {
        let path = path.as_ref();
        let mut stream = self.ropen().await?;

        let mut file = tokio::fs::File::create(path).await.map_err(Error::io)?;
        let result = write_body(&mut stream, &mut file).await;
        match result {
            Ok(()) => {
                file.flush().await.map_err(Error::io)?;
                Ok(Response::new(
                    stream.status(),
                    stream.headers().clone(),
                    bytes::Bytes::new(),
                    stream.history().to_vec(),
                ))
            }
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                Err(err)
            }
        }
    }
}

async fn write_body(stream: &mut ResponseStream, file: &mut tokio::fs::File) -> Result<()> {
    while let Some(chunk) = stream.next_chunk().await? {
        file.write_all(&chunk).await.map_err(Error::io)?;
    }
    Ok(())
}
