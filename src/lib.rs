#![doc = include_str!("../README.md")]

pub use bytes;
pub use http;

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use http::{Method, Uri};

pub mod blocking;
mod body;
mod codec;
mod connection;
mod cookies;
mod error;
mod options;
mod pool;
mod redirect;
mod request;
mod response;
mod session;
mod stream;
mod transport;

pub use body::Body;
pub use cookies::{Cookie, CookieJar};
pub use error::{Error, ErrorKind, Result};
pub use options::{RedirectMode, RequestOptions};
pub use redirect::Hop;
pub use request::RequestBuilder;
pub use response::Response;
pub use session::{Session, SessionBuilder};
pub use stream::ResponseStream;

static DEFAULT_SESSION: OnceLock<Mutex<Option<Session>>> = OnceLock::new();

fn default_slot() -> &'static Mutex<Option<Session>> {
    DEFAULT_SESSION.get_or_init(|| Mutex::new(None))
}

/// The process-wide session used by the free functions, created on first
/// use.
///
/// Prefer passing an explicit [`Session`] through application code; the
/// default exists as a convenience for one-off calls.
pub fn default_session() -> Session {
    let mut slot = default_slot().lock().expect("default session poisoned");
    slot.get_or_insert_with(Session::new).clone()
}

/// Replaces the process-wide session.
pub fn set_default_session(session: Session) {
    *default_slot().lock().expect("default session poisoned") = Some(session);
}

/// Drops the process-wide session (and its pools). The next free-function
/// call creates a fresh one. Intended for tests and orderly shutdown.
pub fn reset_default_session() {
    if let Some(slot) = DEFAULT_SESSION.get() {
        *slot.lock().expect("default session poisoned") = None;
    }
}

/// Performs a request with an explicit method and body on the default
/// session.
pub async fn request<U>(method: Method, url: U, body: Body) -> Result<Response>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    default_session().request(method, url).body(body).send().await
}

/// Performs a request on the default session, returning a streaming handle.
pub async fn ropen<U>(method: Method, url: U, body: Body) -> Result<ResponseStream>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    default_session().request(method, url).body(body).ropen().await
}

/// Streams `url` into the file at `path` via the default session.
pub async fn download<U>(url: U, path: impl AsRef<Path>) -> Result<Response>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    default_session().get(url).download(path).await
}

macro_rules! free_method {
    ($name:ident, $variant:expr) => {
        #[doc = concat!("Performs a `", stringify!($variant), "` request on the default session.")]
        pub async fn $name<U>(url: U) -> Result<Response>
        where
            U: TryInto<Uri>,
            http::Error: From<<U as TryInto<Uri>>::Error>,
        {
            default_session().request($variant, url).send().await
        }
    };
    ($name:ident, $variant:expr, with_body) => {
        #[doc = concat!("Performs a `", stringify!($variant), "` request on the default session.")]
        pub async fn $name<U>(url: U, body: Body) -> Result<Response>
        where
            U: TryInto<Uri>,
            http::Error: From<<U as TryInto<Uri>>::Error>,
        {
            default_session()
                .request($variant, url)
                .body(body)
                .send()
                .await
        }
    };
}

free_method!(get, Method::GET);
free_method!(head, Method::HEAD);
free_method!(delete, Method::DELETE);
free_method!(post, Method::POST, with_body);
free_method!(put, Method::PUT, with_body);
free_method!(patch, Method::PATCH, with_body);
