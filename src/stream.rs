//! Streaming response handle.
//!
//! A [`ResponseStream`] is the live half of an exchange: the head has been
//! read, the body has not. Reading it to the end returns the connection to
//! its pool; dropping it early closes the connection instead, so a stalled
//! peer can never poison the idle set.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::codec::BodyDecoder;
use crate::connection::Conn;
use crate::error::{Error, ErrorKind, Result};
use crate::options::RequestOptions;
use crate::pool::PoolRef;
use crate::redirect::Hop;
use crate::response::Response;

pub struct ResponseStream {
    status: StatusCode,
    headers: HeaderMap,
    history: Vec<Hop>,
    conn: Option<Arc<Conn>>,
    pool: PoolRef,
    decoder: BodyDecoder,
    /// Decoded bytes not yet handed to the caller.
    pending: Bytes,
    opts: RequestOptions,
}

impl ResponseStream {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        history: Vec<Hop>,
        decoder: BodyDecoder,
        conn: Arc<Conn>,
        pool: PoolRef,
        opts: RequestOptions,
    ) -> Self {
        let mut stream = Self {
            status,
            headers,
            history,
            conn: Some(conn),
            pool,
            decoder,
            pending: Bytes::new(),
            opts,
        };
        // Bodiless responses finish the exchange immediately.
        if stream.decoder.is_done() {
            stream.release(true);
        }
        stream
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Redirect hops followed before this response.
    pub fn history(&self) -> &[Hop] {
        &self.history
    }

    /// True once the whole body has been received from the connection.
    pub fn done(&self) -> bool {
        self.decoder.is_done()
    }

    /// Reads up to `buf.len()` body bytes; `Ok(0)` signals the end of the
    /// body.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.next_chunk().await? {
                Some(data) => self.pending = data,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    /// Pulls the next decoded chunk off the connection, releasing it when
    /// the body completes.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        if self.decoder.is_done() {
            self.release(true);
            return Ok(None);
        }
        let Some(conn) = self.conn.clone() else {
            return Err(Error::new(ErrorKind::Cancelled));
        };
        match conn.read_body(&mut self.decoder, self.opts.exchange_timeout).await {
            Ok(Some(data)) => {
                if self.decoder.is_done() {
                    self.release(true);
                }
                Ok(Some(data))
            }
            Ok(None) => {
                self.release(true);
                Ok(None)
            }
            Err(err) => {
                self.release(false);
                Err(err)
            }
        }
    }

    /// Buffers the remaining body, bounded by `max_response_size`.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.pending.len().max(4 * 1024));
        while let Some(data) = self.next_chunk().await? {
            out.extend_from_slice(&data);
        }
        Ok(out.freeze())
    }

    /// Reads the remaining body and decodes it as JSON.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.read_all().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Discards the remainder of the body.
    ///
    /// Up to `dump_limit` bytes are read and thrown away so the connection
    /// can be reused; a larger remainder closes the connection instead.
    pub async fn dump(&mut self) -> Result<()> {
        self.pending = Bytes::new();
        let start = self.decoder.bytes_read();
        loop {
            if self.decoder.is_done() {
                self.release(true);
                return Ok(());
            }
            if self.decoder.bytes_read() - start > self.opts.dump_limit {
                self.close();
                return Ok(());
            }
            match self.next_chunk().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(err) => {
                    // The connection is already retired; dumping is
                    // best-effort.
                    tracing::trace!(error = %err, "dump aborted");
                    return Ok(());
                }
            }
        }
    }

    /// Cancels reading and closes the connection.
    pub fn close(&mut self) {
        if let Some(conn) = &self.conn {
            conn.close();
        }
        self.release(false);
    }

    /// Buffers the remaining body and converts into a [`Response`].
    pub async fn into_response(mut self) -> Result<Response> {
        let body = self.read_all().await?;
        Ok(Response::new(
            self.status,
            std::mem::take(&mut self.headers),
            body,
            std::mem::take(&mut self.history),
        ))
    }

    fn release(&mut self, keep: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.release(conn, keep),
            // Pool (and session) are gone; just close the socket.
            None => conn.close(),
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if self.decoder.is_done() {
            self.release(true);
        } else {
            // The body was never drained: the connection cannot be reused.
            if let Some(conn) = &self.conn {
                conn.mark_closing();
            }
            self.release(false);
        }
    }
}
