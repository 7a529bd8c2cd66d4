//! Per-host connection pool.
//!
//! Each pool lends ready connections for one host key. `acquire` prefers an
//! idle connection, creates a new one while the per-host cap allows, and
//! otherwise parks the caller in a strict-FIFO waiter queue. The pool mutex
//! guards membership and state flags only; all I/O (DNS, connect, TLS)
//! happens outside it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::connection::{Conn, ConnState};
use crate::error::{Error, ErrorKind, Result};
use crate::options::RequestOptions;
use crate::transport::{self, Endpoint, Transport};

/// Resolver results are reused for this long before a fresh lookup.
const RESOLVE_TTL: Duration = Duration::from_secs(60);
/// Idle sweeps run at most this often, piggybacked on pool access.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Index key for pools: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HostKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Arc<Conn>>>,
}

struct CachedAddrs {
    addrs: Arc<Vec<SocketAddr>>,
    resolved_at: Instant,
}

struct PoolState {
    addrs: Option<CachedAddrs>,
    conns: Vec<Arc<Conn>>,
    /// Connections being established; they count toward the cap.
    connecting: usize,
    waiters: VecDeque<Waiter>,
    next_conn_id: u64,
    next_waiter_id: u64,
    last_sweep: Instant,
}

pub(crate) struct Pool {
    pub(crate) endpoint: Endpoint,
    transport: Arc<Transport>,
    limit: usize,
    idle_timeout: Duration,
    /// Options used when the pool replenishes on its own behalf.
    default_options: RequestOptions,
    state: Mutex<PoolState>,
}

impl Pool {
    pub(crate) fn new(
        endpoint: Endpoint,
        transport: Arc<Transport>,
        options: &RequestOptions,
    ) -> Self {
        Self {
            endpoint,
            transport,
            limit: options.pool_limit_per_host.max(1),
            idle_timeout: options.idle_timeout,
            default_options: options.clone(),
            state: Mutex::new(PoolState {
                addrs: None,
                conns: Vec::new(),
                connecting: 0,
                waiters: VecDeque::new(),
                next_conn_id: 0,
                next_waiter_id: 0,
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Number of live (idle, working or connecting) connections.
    pub(crate) fn connection_count(&self) -> usize {
        let st = self.state.lock().expect("pool state poisoned");
        st.conns.len() + st.connecting
    }

    /// Lends a `Working` connection to the caller.
    pub(crate) async fn acquire(self: &Arc<Self>, opts: &RequestOptions) -> Result<Arc<Conn>> {
        let swept;
        let (conn_id, waiter) = {
            let mut st = self.state.lock().expect("pool state poisoned");
            swept = self.sweep_idle(&mut st);

            if let Some(conn) = st.conns.iter().find(|c| c.try_acquire_idle()) {
                tracing::trace!(conn = conn.id, endpoint = %self.endpoint, "reusing idle connection");
                return Ok(conn.clone());
            }

            if st.conns.len() + st.connecting < self.limit {
                st.connecting += 1;
                let id = st.next_conn_id;
                st.next_conn_id += 1;
                (Some(id), None)
            } else {
                let id = st.next_waiter_id;
                st.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(Waiter { id, tx });
                (None, Some((id, rx)))
            }
        };

        drop(swept);

        if let Some(id) = conn_id {
            return self.connect_new(id, opts).await;
        }

        let (waiter_id, rx) = waiter.expect("either a slot or a waiter");
        let mut guard = WaitGuard {
            pool: self.clone(),
            id: waiter_id,
            rx: Some(rx),
        };
        let rx = guard.rx.as_mut().expect("receiver taken");
        let outcome = match rx.await {
            Ok(res) => res,
            // The pool (and its sender) went away while we waited.
            Err(_) => Err(Error::new(ErrorKind::Cancelled)),
        };
        guard.rx = None;
        outcome
    }

    /// Establishes a connection for a reserved slot. On failure every
    /// resolved address has been tried.
    async fn connect_new(self: &Arc<Self>, conn_id: u64, opts: &RequestOptions) -> Result<Arc<Conn>> {
        let result = self.dial(conn_id, opts).await;
        let mut st = self.state.lock().expect("pool state poisoned");
        st.connecting -= 1;
        match result {
            Ok(conn) => {
                let conn = Arc::new(conn);
                st.conns.push(conn.clone());
                tracing::debug!(conn = conn.id, endpoint = %self.endpoint, "connection established");
                Ok(conn)
            }
            Err(err) => {
                // The failed reservation may have been what parked a
                // waiter; give the queue another dial.
                if !st.waiters.is_empty() && st.conns.len() + st.connecting < self.limit {
                    st.connecting += 1;
                    let id = st.next_conn_id;
                    st.next_conn_id += 1;
                    self.spawn_replenish(&mut st, id);
                }
                Err(err)
            }
        }
    }

    async fn dial(&self, conn_id: u64, opts: &RequestOptions) -> Result<Conn> {
        let addrs = self.resolve_cached().await?;
        let mut last_err = None;
        for addr in addrs.iter() {
            match self
                .transport
                .connect(&self.endpoint, *addr, opts.connect_timeout)
                .await
            {
                Ok(io) => return Ok(Conn::new(conn_id, self.endpoint.clone(), io)),
                Err(err) => {
                    tracing::debug!(endpoint = %self.endpoint, %addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::with_context(ErrorKind::ConnectFailed, self.endpoint.to_string())))
    }

    async fn resolve_cached(&self) -> Result<Arc<Vec<SocketAddr>>> {
        {
            let st = self.state.lock().expect("pool state poisoned");
            if let Some(cached) = &st.addrs {
                if cached.resolved_at.elapsed() < RESOLVE_TTL {
                    return Ok(cached.addrs.clone());
                }
            }
        }

        let addrs = Arc::new(transport::resolve(&self.endpoint.host, self.endpoint.port).await?);
        let mut st = self.state.lock().expect("pool state poisoned");
        st.addrs = Some(CachedAddrs {
            addrs: addrs.clone(),
            resolved_at: Instant::now(),
        });
        Ok(addrs)
    }

    /// Returns a lent connection.
    ///
    /// A healthy keep-alive connection is handed to the oldest waiter or
    /// parked idle; anything else is closed and removed, and a replacement
    /// is dialed when callers are still waiting.
    pub(crate) fn release(self: &Arc<Self>, conn: Arc<Conn>, keep: bool) {
        let keep = keep && conn.state() == ConnState::Working;
        let mut retired = Vec::new();
        {
            let mut st = self.state.lock().expect("pool state poisoned");

            if keep {
                let mut conn = conn;
                loop {
                    match st.waiters.pop_front() {
                        Some(waiter) => match waiter.tx.send(Ok(conn)) {
                            Ok(()) => return,
                            // Waiter cancelled between dequeue and send:
                            // recover the connection and try the next one.
                            Err(Ok(recovered)) => conn = recovered,
                            Err(Err(_)) => unreachable!("grant payload is always Ok"),
                        },
                        None => {
                            conn.make_idle();
                            return;
                        }
                    }
                }
            }

            conn.close();
            if let Some(pos) = st.conns.iter().position(|c| Arc::ptr_eq(c, &conn)) {
                retired.push(st.conns.swap_remove(pos));
            }
            retired.push(conn);

            if !st.waiters.is_empty() && st.conns.len() + st.connecting < self.limit {
                st.connecting += 1;
                let id = st.next_conn_id;
                st.next_conn_id += 1;
                self.spawn_replenish(&mut st, id);
            }
        }
        drop(retired);
    }

    /// Dials a replacement connection for the head waiter, off-lock. The
    /// caller holds the pool lock and has already reserved the slot.
    fn spawn_replenish(self: &Arc<Self>, st: &mut PoolState, conn_id: u64) {
        let pool = self.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime (e.g. teardown): undo the reservation.
            st.connecting -= 1;
            return;
        };
        handle.spawn(async move {
            let opts = pool.default_options.clone();
            let result = pool.connect_new(conn_id, &opts).await;
            let mut st = pool.state.lock().expect("pool state poisoned");
            match result {
                Ok(conn) => {
                    let mut conn = conn;
                    loop {
                        match st.waiters.pop_front() {
                            Some(waiter) => match waiter.tx.send(Ok(conn)) {
                                Ok(()) => return,
                                Err(Ok(recovered)) => conn = recovered,
                                Err(Err(_)) => unreachable!("grant payload is always Ok"),
                            },
                            None => {
                                conn.make_idle();
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    // Connect failed: fail the head waiter rather than
                    // leaving it parked forever, skipping any that were
                    // cancelled in the meantime.
                    let mut err = Some(err);
                    while let Some(waiter) = st.waiters.pop_front() {
                        match waiter.tx.send(Err(err.take().expect("error consumed once"))) {
                            Ok(()) => break,
                            Err(Err(recovered)) => err = Some(recovered),
                            Err(Ok(_)) => unreachable!("failure payload is always Err"),
                        }
                    }
                }
            }
        });
    }

    /// Closes connections idle longer than the idle timeout. Runs under the
    /// pool lock; the returned handles are dropped (closing the sockets)
    /// after the caller releases it.
    fn sweep_idle(&self, st: &mut PoolState) -> Vec<Arc<Conn>> {
        if st.last_sweep.elapsed() < SWEEP_INTERVAL {
            return Vec::new();
        }
        st.last_sweep = Instant::now();
        let idle_timeout = self.idle_timeout;
        let mut evicted = Vec::new();
        st.conns.retain(|conn| {
            let evict = conn.idle_for().is_some_and(|idle| idle > idle_timeout)
                || matches!(conn.state(), ConnState::Closed);
            if evict {
                tracing::debug!(conn = conn.id, endpoint = %self.endpoint, "evicting connection");
                conn.close();
                evicted.push(conn.clone());
            }
            !evict
        });
        evicted
    }
}

/// Removes a cancelled waiter from the queue; if a grant raced the
/// cancellation, the granted connection is put back into circulation.
struct WaitGuard {
    pool: Arc<Pool>,
    id: u64,
    rx: Option<oneshot::Receiver<Result<Arc<Conn>>>>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        {
            let mut st = self.pool.state.lock().expect("pool state poisoned");
            if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
                st.waiters.remove(pos);
                return;
            }
        }
        // Already dequeued: a grant may be sitting in the channel.
        if let Ok(Ok(conn)) = rx.try_recv() {
            self.pool.release(conn, true);
        }
    }
}

/// Weak handle stored by streams so a released connection finds its way
/// home even while the stream outlives the session.
pub(crate) type PoolRef = Weak<Pool>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options() -> RequestOptions {
        RequestOptions {
            pool_limit_per_host: 2,
            ..RequestOptions::default()
        }
    }

    fn test_pool(port: u16) -> Arc<Pool> {
        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port,
            tls: false,
        };
        Arc::new(Pool::new(
            endpoint,
            Arc::new(Transport::new(None)),
            &test_options(),
        ))
    }

    async fn local_listener() -> (tokio::net::TcpListener, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn acquire_reuses_released_connection() {
        let (listener, port) = local_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                // Hold sockets open so the pool can reuse them.
                std::mem::forget(sock);
            }
        });

        let pool = test_pool(port);
        let opts = test_options();

        let conn = pool.acquire(&opts).await.unwrap();
        let id = conn.id;
        assert_eq!(pool.connection_count(), 1);

        pool.release(conn, true);
        let conn = pool.acquire(&opts).await.unwrap();
        assert_eq!(conn.id, id);
        assert_eq!(pool.connection_count(), 1);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn cap_parks_waiters_fifo() {
        let (listener, port) = local_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                std::mem::forget(sock);
            }
        });

        let pool = test_pool(port);
        let opts = test_options();

        let first = pool.acquire(&opts).await.unwrap();
        let second = pool.acquire(&opts).await.unwrap();
        assert_eq!(pool.connection_count(), 2);

        let p1 = pool.clone();
        let o1 = opts.clone();
        let waiter_a = tokio::spawn(async move { p1.acquire(&o1).await.unwrap().id });
        let p2 = pool.clone();
        let o2 = opts.clone();
        let waiter_b = tokio::spawn(async move { p2.acquire(&o2).await.unwrap().id });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Cap respected while both waiters are parked.
        assert_eq!(pool.connection_count(), 2);

        pool.release(first, true);
        pool.release(second, true);
        let _ = waiter_a.await.unwrap();
        let _ = waiter_b.await.unwrap();
        assert_eq!(pool.connection_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_counts_unchanged() {
        let (listener, port) = local_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                std::mem::forget(sock);
            }
        });

        let pool = test_pool(port);
        let opts = test_options();

        let a = pool.acquire(&opts).await.unwrap();
        let b = pool.acquire(&opts).await.unwrap();

        let p = pool.clone();
        let o = opts.clone();
        let parked = tokio::spawn(async move {
            let _ = p.acquire(&o).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        parked.abort();
        let _ = parked.await;

        {
            let st = pool.state.lock().unwrap();
            assert!(st.waiters.is_empty());
        }
        assert_eq!(pool.connection_count(), 2);

        pool.release(a, true);
        pool.release(b, false);
    }

    #[tokio::test]
    async fn connect_failure_reports_connect_failed() {
        // Nothing listens on the target port.
        let (listener, port) = local_listener().await;
        drop(listener);

        let pool = test_pool(port);
        let err = pool.acquire(&test_options()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
        assert_eq!(pool.connection_count(), 0);
    }
}
