//! Synchronous facade.
//!
//! Drives the async engine to completion on a runtime owned by a dedicated
//! background thread, so blocking calls work from any non-async thread.
//! Calling into this module from inside an async context deadlocks the
//! caller's task and is not supported.

use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;

use http::{Method, Uri};

use crate::body::Body;
use crate::error::Result;
use crate::response::Response;
use crate::session::Session;

fn runtime_handle() -> &'static tokio::runtime::Handle {
    static HANDLE: OnceLock<tokio::runtime::Handle> = OnceLock::new();
    HANDLE.get_or_init(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build blocking runtime");
        let handle = runtime.handle().clone();
        std::thread::Builder::new()
            .name("harbor-blocking".to_owned())
            .spawn(move || {
                // Park forever; the runtime drives timers and I/O from
                // here while callers block on their own threads.
                runtime.block_on(std::future::pending::<()>());
            })
            .expect("failed to spawn blocking runtime thread");
        handle
    })
}

fn block_on<T>(fut: impl Future<Output = T>) -> T {
    runtime_handle().block_on(fut)
}

/// Synchronous wrapper around a [`Session`].
#[derive(Clone, Default)]
pub struct Client {
    session: Session,
}

impl Client {
    pub fn new() -> Self {
        Self {
            session: Session::new(),
        }
    }

    /// Wraps an existing session.
    pub fn with_session(session: Session) -> Self {
        Self { session }
    }

    /// The underlying asynchronous session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn request<U>(&self, method: Method, url: U, body: Body) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.request(method, url).body(body).send())
    }

    pub fn get<U>(&self, url: U) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.get(url).send())
    }

    pub fn post<U>(&self, url: U, body: Body) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.post(url).body(body).send())
    }

    pub fn put<U>(&self, url: U, body: Body) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.put(url).body(body).send())
    }

    pub fn patch<U>(&self, url: U, body: Body) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.patch(url).body(body).send())
    }

    pub fn delete<U>(&self, url: U) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.delete(url).send())
    }

    pub fn download<U>(&self, url: U, path: impl AsRef<Path>) -> Result<Response>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        block_on(self.session.get(url).download(path))
    }
}

/// Performs a `GET` request on the process-wide default session.
pub fn get<U>(url: U) -> Result<Response>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    block_on(crate::get(url))
}

/// Performs a `POST` request on the process-wide default session.
pub fn post<U>(url: U, body: Body) -> Result<Response>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    block_on(crate::post(url, body))
}

/// Performs a request with an explicit method on the process-wide default
/// session.
pub fn request<U>(method: Method, url: U, body: Body) -> Result<Response>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    block_on(crate::request(method, url, body))
}

/// Streams `url` into the file at `path` via the default session.
pub fn download<U>(url: U, path: impl AsRef<Path>) -> Result<Response>
where
    U: TryInto<Uri>,
    http::Error: From<<U as TryInto<Uri>>::Error>,
{
    block_on(crate::download(url, path))
}
