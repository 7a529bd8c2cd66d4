//! A single pooled HTTP/1.1 connection.
//!
//! A [`Conn`] owns one byte transport to one endpoint and carries out one
//! request/response exchange at a time. The pool flips its state between
//! `Idle` and `Working`; an exchange failure moves it to `Closing` so it is
//! retired instead of returned to the idle set. `close` may be called
//! concurrently with an in-flight read, which then completes as `Cancelled`.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

use crate::body::Body;
use crate::codec::{self, BodyDecoder, ResponseHead};
use crate::error::{Error, ErrorKind, Result};
use crate::options::RequestOptions;
use crate::transport::{Endpoint, Io};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Parked in the pool, ready for the next exchange.
    Idle,
    /// Lent out; at most one stream drives it.
    Working,
    /// Damaged or told to close; retired once the current stream lets go.
    Closing,
    /// Terminal.
    Closed,
}

#[derive(Debug)]
struct StateCell {
    state: ConnState,
    idle_since: Instant,
}

#[derive(Debug)]
struct IoCell {
    io: Io,
    /// Bytes read past what the decoder has consumed.
    buf: BytesMut,
}

#[derive(Debug)]
pub(crate) struct Conn {
    pub(crate) id: u64,
    pub(crate) endpoint: Endpoint,
    state: Mutex<StateCell>,
    io: tokio::sync::Mutex<IoCell>,
    close_notify: Notify,
}

impl Conn {
    /// Wraps an established transport. Connections are born `Working`:
    /// the pool creates them on behalf of a caller that immediately uses
    /// them.
    pub(crate) fn new(id: u64, endpoint: Endpoint, io: Io) -> Self {
        Self {
            id,
            endpoint,
            state: Mutex::new(StateCell {
                state: ConnState::Working,
                idle_since: Instant::now(),
            }),
            io: tokio::sync::Mutex::new(IoCell {
                io,
                buf: BytesMut::with_capacity(READ_CHUNK),
            }),
            close_notify: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state.lock().expect("conn state poisoned").state
    }

    /// Atomically claims an idle connection for an exchange.
    pub(crate) fn try_acquire_idle(&self) -> bool {
        let mut cell = self.state.lock().expect("conn state poisoned");
        if cell.state == ConnState::Idle {
            cell.state = ConnState::Working;
            true
        } else {
            false
        }
    }

    /// Returns the connection to the idle set after a fully drained
    /// exchange.
    pub(crate) fn make_idle(&self) {
        let mut cell = self.state.lock().expect("conn state poisoned");
        if cell.state == ConnState::Working {
            cell.state = ConnState::Idle;
            cell.idle_since = Instant::now();
        }
    }

    /// How long the connection has been idle, if it is.
    pub(crate) fn idle_for(&self) -> Option<Duration> {
        let cell = self.state.lock().expect("conn state poisoned");
        (cell.state == ConnState::Idle).then(|| cell.idle_since.elapsed())
    }

    /// Flags the connection as unfit for reuse. The current exchange may
    /// still finish reading.
    pub(crate) fn mark_closing(&self) {
        let mut cell = self.state.lock().expect("conn state poisoned");
        if !matches!(cell.state, ConnState::Closed) {
            cell.state = ConnState::Closing;
        }
    }

    /// Idempotent terminal close. An in-flight read observes it and
    /// completes with `Cancelled`.
    pub(crate) fn close(&self) {
        let mut cell = self.state.lock().expect("conn state poisoned");
        if cell.state != ConnState::Closed {
            tracing::debug!(conn = self.id, endpoint = %self.endpoint, "connection closed");
            cell.state = ConnState::Closed;
        }
        drop(cell);
        self.close_notify.notify_waiters();
    }

    fn is_shutdown(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Runs `fut` unless the connection is closed underneath it, bounding
    /// it by `dur`.
    async fn guarded<T>(&self, dur: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutdown() {
            return Err(Error::new(ErrorKind::Cancelled));
        }
        tokio::select! {
            _ = notified => Err(Error::new(ErrorKind::Cancelled)),
            out = tokio::time::timeout(dur, fut) => match out {
                Ok(res) => res,
                Err(_) => Err(Error::new(ErrorKind::Timeout)),
            },
        }
    }

    /// Performs the write-request/read-head half of one exchange.
    ///
    /// Requires the `Working` state. Interim 1xx responses are consumed and
    /// the head read repeats until a final status arrives. Any failure
    /// leaves the connection `Closing` (or `Closed` when cancelled).
    pub(crate) async fn ropen(
        &self,
        method: &Method,
        target: &str,
        host_header: &str,
        headers: &HeaderMap,
        body: &mut Body,
        opts: &RequestOptions,
    ) -> Result<(ResponseHead, BodyDecoder)> {
        debug_assert_eq!(self.state(), ConnState::Working);
        let mut cell = self.io.lock().await;

        let result = self
            .guarded(
                opts.exchange_timeout,
                exchange(&mut cell, method, target, host_header, headers, body, opts),
            )
            .await;

        match result {
            Ok(head) => {
                let decoder = BodyDecoder::new(head.body_kind, opts.max_response_size);
                if head.close {
                    self.mark_closing();
                }
                Ok((head, decoder))
            }
            Err(err) => {
                self.mark_closing();
                Err(err)
            }
        }
    }

    /// Reads the next decoded body fragment, or `None` at end of body.
    ///
    /// Each underlying transport read is independently bounded by `timeout`
    /// and races against a concurrent `close`.
    pub(crate) async fn read_body(
        &self,
        decoder: &mut BodyDecoder,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        let mut guard = self.io.lock().await;
        let cell = &mut *guard;
        loop {
            match decoder.decode(&mut cell.buf) {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) if decoder.is_done() => return Ok(None),
                Ok(None) => {}
                Err(err) => {
                    self.mark_closing();
                    return Err(err);
                }
            }

            cell.buf.reserve(READ_CHUNK);
            let n = self
                .guarded(timeout, async {
                    cell.io.read_buf(&mut cell.buf).await.map_err(Error::io)
                })
                .await;
            let n = match n {
                Ok(n) => n,
                Err(err) => {
                    self.mark_closing();
                    return Err(err);
                }
            };

            if n == 0 {
                self.mark_closing();
                decoder.on_eof()?;
                return Ok(None);
            }
        }
    }
}

/// Writes the request and reads response heads until a non-interim status.
async fn exchange(
    cell: &mut IoCell,
    method: &Method,
    target: &str,
    host_header: &str,
    headers: &HeaderMap,
    body: &mut Body,
    opts: &RequestOptions,
) -> Result<ResponseHead> {
    let head_request = *method == Method::HEAD;

    let mut out = BytesMut::with_capacity(512);
    codec::encode_request_head(
        &mut out,
        method,
        target,
        host_header,
        headers,
        body.content_type(),
        body.length_hint(),
        opts.keep_alive,
    );
    cell.io.write_all(&out).await.map_err(Error::io)?;

    match body.length_hint() {
        Some(0) => {}
        Some(_) => {
            while let Some(chunk) = body.next_chunk().await? {
                cell.io.write_all(&chunk).await.map_err(Error::io)?;
            }
        }
        None => {
            let mut framed = BytesMut::new();
            while let Some(chunk) = body.next_chunk().await? {
                framed.clear();
                codec::encode_chunk(&mut framed, &chunk);
                cell.io.write_all(&framed).await.map_err(Error::io)?;
            }
            framed.clear();
            codec::encode_final_chunk(&mut framed);
            cell.io.write_all(&framed).await.map_err(Error::io)?;
        }
    }
    cell.io.flush().await.map_err(Error::io)?;

    loop {
        if let Some((head, consumed)) =
            codec::decode_response_head(&cell.buf, head_request, opts.max_header_size)?
        {
            let _ = cell.buf.split_to(consumed);
            if head.status.is_informational() {
                tracing::trace!(status = %head.status, "skipping interim response");
                continue;
            }
            return Ok(head);
        }

        cell.buf.reserve(READ_CHUNK);
        let n = cell.io.read_buf(&mut cell.buf).await.map_err(Error::io)?;
        if n == 0 {
            return Err(Error::new(ErrorKind::UnexpectedEof));
        }
    }
}
