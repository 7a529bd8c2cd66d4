//! Error taxonomy for the client.
//!
//! Every fallible operation in this crate reports an [`Error`] carrying one
//! of the flat [`ErrorKind`] variants, an optional underlying cause, and —
//! for redirect failures — the redirect hops accumulated before the failure.

use std::fmt;

use crate::redirect::Hop;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The class of failure an operation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An `http://` URL was rejected because the session enforces TLS.
    #[error("insecure transport")]
    InsecureTransport,
    /// The request URL could not be parsed or has an unsupported scheme.
    #[error("invalid url")]
    InvalidUrl,
    /// Name resolution produced no usable address.
    #[error("dns failure")]
    DnsFailure,
    /// Every resolved endpoint refused the TCP connection.
    #[error("connect failed")]
    ConnectFailed,
    /// The TLS handshake or certificate verification failed.
    #[error("tls handshake failed")]
    TlsHandshakeFailed,
    /// A connect, exchange or read deadline expired.
    #[error("timeout")]
    Timeout,
    /// The operation was cancelled, e.g. the connection was closed while a
    /// read was in flight.
    #[error("cancelled")]
    Cancelled,
    /// The peer violated HTTP/1.1 framing rules.
    #[error("protocol error")]
    ProtocolError,
    /// The body exceeded `max_response_size`.
    #[error("body too large")]
    BodyTooLarge,
    /// The connection closed before the framed body was complete.
    #[error("unexpected eof")]
    UnexpectedEof,
    /// The redirect chain exceeded `max_redirects`.
    #[error("too many redirects")]
    TooManyRedirects,
    /// A redirect target fell outside the scope allowed by the redirect mode.
    #[error("forbidden redirect")]
    ForbiddenRedirect,
    /// An I/O error on the underlying transport.
    #[error("io error")]
    Io,
    /// A typed helper failed to decode the body (JSON, UTF-8, form).
    #[error("decode error")]
    Decode,
}

/// Error type returned by all client operations.
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    history: Vec<Hop>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
            history: Vec::new(),
        }
    }

    pub(crate) fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: Some(context.into()),
            source: None,
            history: Vec::new(),
        }
    }

    pub(crate) fn with_source(
        kind: ErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            context: None,
            source: Some(source.into()),
            history: Vec::new(),
        }
    }

    pub(crate) fn with_history(mut self, history: Vec<Hop>) -> Self {
        self.history = history;
        self
    }

    pub(crate) fn io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::with_source(ErrorKind::Timeout, err),
            std::io::ErrorKind::UnexpectedEof => Self::with_source(ErrorKind::UnexpectedEof, err),
            _ => Self::with_source(ErrorKind::Io, err),
        }
    }

    /// The failure class.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Redirect hops completed before the failure.
    ///
    /// Non-empty only for [`ErrorKind::TooManyRedirects`] and
    /// [`ErrorKind::ForbiddenRedirect`].
    pub fn history(&self) -> &[Hop] {
        &self.history
    }

    /// True if the failure was a timeout at any layer.
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Error");
        dbg.field("kind", &self.kind);
        if let Some(context) = &self.context {
            dbg.field("context", context);
        }
        if let Some(source) = &self.source {
            dbg.field("source", source);
        }
        if !self.history.is_empty() {
            dbg.field("history", &self.history.len());
        }
        dbg.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Self::with_source(ErrorKind::InvalidUrl, err)
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(ErrorKind::Decode, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_source() {
        let err = Error::with_context(ErrorKind::ConnectFailed, "10.0.0.1:80");
        assert_eq!(err.to_string(), "connect failed: 10.0.0.1:80");

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::with_source(ErrorKind::ConnectFailed, io);
        assert_eq!(err.to_string(), "connect failed: refused");
    }

    #[test]
    fn io_timeouts_map_to_timeout_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        assert_eq!(Error::io(io).kind(), ErrorKind::Timeout);
    }
}
