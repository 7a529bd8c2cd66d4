//! Byte transports: plain TCP and TLS-over-TCP.
//!
//! An [`Endpoint`] names a transport destination; [`resolve`] turns its host
//! into candidate socket addresses; [`Transport::connect`] establishes the
//! socket (and, for TLS endpoints, runs the handshake with hostname
//! verification against the configured trust store).

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{Error, ErrorKind, Result};

#[cfg(feature = "tls")]
use {
    rustls::pki_types::{CertificateDer, ServerName},
    std::sync::Arc,
    tokio_rustls::{client::TlsStream, TlsConnector},
};

/// A transport destination: host, port and whether TLS is layered on top.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Resolves `host:port` to an ordered candidate list.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::with_source(ErrorKind::DnsFailure, e))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::with_context(ErrorKind::DnsFailure, host.to_owned()));
    }
    Ok(addrs)
}

/// Connection factory shared by every pool of a session.
///
/// Holds the rustls client configuration: webpki roots plus an optional
/// extra CA certificate in DER form.
pub(crate) struct Transport {
    #[cfg(feature = "tls")]
    tls: TlsConnector,
}

impl Transport {
    pub(crate) fn new(extra_root_cert: Option<Vec<u8>>) -> Self {
        #[cfg(feature = "tls")]
        {
            use rustls::{ClientConfig, RootCertStore};

            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(cert_bytes) = extra_root_cert {
                let cert = CertificateDer::from(cert_bytes);
                let _ = roots.add(cert);
            }

            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();

            Self {
                tls: TlsConnector::from(Arc::new(config)),
            }
        }

        #[cfg(not(feature = "tls"))]
        {
            let _ = extra_root_cert;
            Self {}
        }
    }

    /// Connects to one resolved address of `endpoint`, bounded by `timeout`.
    pub(crate) async fn connect(
        &self,
        endpoint: &Endpoint,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Io> {
        tokio::time::timeout(timeout, self.connect_inner(endpoint, addr))
            .await
            .map_err(|_| Error::with_context(ErrorKind::Timeout, format!("connect to {addr}")))?
    }

    async fn connect_inner(&self, endpoint: &Endpoint, addr: SocketAddr) -> Result<Io> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::with_source(ErrorKind::ConnectFailed, e))?;
        let _ = tcp.set_nodelay(true);

        if !endpoint.tls {
            return Ok(Io::Plain(tcp));
        }

        #[cfg(feature = "tls")]
        {
            let domain = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| Error::with_source(ErrorKind::TlsHandshakeFailed, e))?;
            let stream = self
                .tls
                .connect(domain, tcp)
                .await
                .map_err(|e| Error::with_source(ErrorKind::TlsHandshakeFailed, e))?;
            Ok(Io::Tls(Box::new(stream)))
        }

        #[cfg(not(feature = "tls"))]
        Err(Error::with_context(
            ErrorKind::TlsHandshakeFailed,
            "tls support disabled at compile time",
        ))
    }
}

/// A single established byte stream.
#[derive(Debug)]
pub(crate) enum Io {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Io::Plain(io) => Pin::new(io).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Io::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Io::Plain(io) => Pin::new(io).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Io::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Io::Plain(io) => Pin::new(io).poll_flush(cx),
            #[cfg(feature = "tls")]
            Io::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Io::Plain(io) => Pin::new(io).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Io::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}
