//! Per-request and per-session configuration.

use std::time::Duration;

/// Scope filter applied to redirect targets.
///
/// A redirect whose target falls outside the selected scope fails the
/// request with `ErrorKind::ForbiddenRedirect` instead of being followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Never follow redirects.
    None,
    /// Follow only when host, port and scheme all match the current URL.
    SameEndpoint,
    /// Follow only when the host matches (port and scheme may change).
    SameHost,
    /// Follow only when host and port match.
    SamePort,
    /// Follow within the same registrable domain
    /// (`api.example.co.uk` -> `cdn.example.co.uk`).
    #[default]
    PrivateDomain,
    /// Follow within the same public suffix (`a.co.uk` -> `b.co.uk`).
    PublicSuffix,
    /// Follow anywhere.
    Any,
}

/// Options governing a single request (and, as session defaults, every
/// request issued through that session).
///
/// Method rewriting on redirects follows the strict rule: 307 and 308
/// preserve the method and body, 303 always downgrades to a body-less GET,
/// and 301/302 downgrade only when the original method was POST.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Reject plain `http://` URLs with `ErrorKind::InsecureTransport`.
    pub enforce_tls: bool,
    /// Maximum number of redirect hops to follow; 0 disables following.
    pub max_redirects: u16,
    /// Scope filter for followed redirects.
    pub redirect_mode: RedirectMode,
    /// Deadline for establishing one connection (DNS + TCP + TLS).
    pub connect_timeout: Duration,
    /// Deadline covering request write and response-head read, and applied
    /// independently to each body read.
    pub exchange_timeout: Duration,
    /// Byte cap for buffered reads (`read_all`, `send`, `download`).
    pub max_response_size: u64,
    /// Byte cap for a response head; exceeding it is a protocol error.
    pub max_header_size: usize,
    /// Cap on bytes silently discarded when an unconsumed body is dumped;
    /// larger remainders close the connection instead.
    pub dump_limit: u64,
    /// Offer `Connection: keep-alive` and return idle sockets to the pool.
    pub keep_alive: bool,
    /// Maximum concurrent connections per host key.
    pub pool_limit_per_host: usize,
    /// Idle connections older than this are closed on pool access.
    pub idle_timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            enforce_tls: false,
            max_redirects: 10,
            redirect_mode: RedirectMode::default(),
            connect_timeout: Duration::from_secs(30),
            exchange_timeout: Duration::from_secs(60),
            max_response_size: 1024 * 1024 * 1024,
            max_header_size: 64 * 1024,
            dump_limit: 1024 * 1024,
            keep_alive: true,
            pool_limit_per_host: 6,
            idle_timeout: Duration::from_secs(60),
        }
    }
}
