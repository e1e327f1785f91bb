//! Work connection pool
//!
//! When a public connection arrives the session asks the client for a work
//! connection and parks a pending request here, keyed by the token's
//! sequence number. The client opens a fresh connection whose first frame is
//! `NewWorkConnection(token)`; the manager delivers it to this pool, which
//! hands it to the waiting public connection exactly once.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tcpfrp_proto::{SessionToken, WorkToken};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Byte stream a work connection runs over (plain TCP, TLS, ...)
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No work connection for {token} within {after:?}")]
    Timeout { token: WorkToken, after: Duration },

    #[error("Work request {0} was cancelled")]
    Cancelled(WorkToken),

    #[error("Unknown or already satisfied work token {0}")]
    UnknownToken(WorkToken),

    #[error("Work request {0} is no longer waiting")]
    Expired(WorkToken),

    #[error("Work connection pool is closed")]
    Closed,
}

/// A client-opened data connection, past its `NewWorkConnection` frame
pub struct WorkConnection {
    pub token: WorkToken,
    pub io: Box<dyn TunnelIo>,
    /// Bytes the client sent right after the handshake frame
    pub prelude: Bytes,
    pub peer: Option<SocketAddr>,
}

impl std::fmt::Debug for WorkConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkConnection")
            .field("token", &self.token)
            .field("prelude_len", &self.prelude.len())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

struct PendingWorkRequest {
    proxy_name: String,
    created_at: Instant,
    tx: oneshot::Sender<WorkConnection>,
}

/// Handle to a registered request; resolve it with [`WorkConnectionPool::wait`]
#[derive(Debug)]
pub struct PendingWork {
    token: WorkToken,
    rx: oneshot::Receiver<WorkConnection>,
}

impl PendingWork {
    pub fn token(&self) -> &WorkToken {
        &self.token
    }
}

pub struct WorkConnectionPool {
    session: SessionToken,
    timeout: Duration,
    next_seq: AtomicU64,
    pending: DashMap<u64, PendingWorkRequest>,
    closed: AtomicBool,
}

impl WorkConnectionPool {
    pub fn new(session: SessionToken, timeout: Duration) -> Self {
        Self {
            session,
            timeout,
            next_seq: AtomicU64::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a pending request for `proxy_name` under a fresh token
    pub fn request(&self, proxy_name: &str) -> Result<PendingWork, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = WorkToken::new(self.session.clone(), seq);
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            seq,
            PendingWorkRequest {
                proxy_name: proxy_name.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );

        // close() may have drained the map between the check and the insert
        if self.closed.load(Ordering::Acquire) {
            self.pending.remove(&seq);
            return Err(PoolError::Closed);
        }

        debug!(proxy = %proxy_name, "Registered work request {}", token);
        Ok(PendingWork { token, rx })
    }

    /// Wait for the work connection, up to the pool timeout
    ///
    /// On timeout the request is removed, so a late delivery is rejected.
    pub async fn wait(&self, pending: PendingWork) -> Result<WorkConnection, PoolError> {
        let PendingWork { token, mut rx } = pending;

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(PoolError::Cancelled(token)),
            Err(_) => {
                self.pending.remove(&token.seq);
                // A delivery may have won the race against the timer
                match rx.try_recv() {
                    Ok(conn) => Ok(conn),
                    Err(_) => {
                        warn!("Work request {} timed out after {:?}", token, self.timeout);
                        Err(PoolError::Timeout {
                            token,
                            after: self.timeout,
                        })
                    }
                }
            }
        }
    }

    /// Hand a work connection to the request waiting for its token
    ///
    /// A connection nobody is waiting for is dropped, which closes it.
    pub fn deliver(&self, conn: WorkConnection) -> Result<(), PoolError> {
        let token = conn.token.clone();
        if token.session != self.session {
            return Err(PoolError::UnknownToken(token));
        }

        let Some((_, request)) = self.pending.remove(&token.seq) else {
            return Err(PoolError::UnknownToken(token));
        };

        debug!(
            proxy = %request.proxy_name,
            "Work connection {} arrived after {:?}",
            token,
            request.created_at.elapsed()
        );

        request
            .tx
            .send(conn)
            .map_err(|_conn| PoolError::Expired(token))
    }

    /// Whether a request with this token is still waiting
    pub fn announce(&self, token: &WorkToken) -> bool {
        token.session == self.session && self.pending.contains_key(&token.seq)
    }

    pub fn cancel(&self, token: &WorkToken) -> bool {
        self.pending.remove(&token.seq).is_some()
    }

    /// Cancel every request made for `proxy_name`. Returns how many were cancelled.
    pub fn cancel_proxy(&self, proxy_name: &str) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, request| request.proxy_name != proxy_name);
        before.saturating_sub(self.pending.len())
    }

    /// Refuse new requests and cancel the outstanding ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let cancelled = self.pending.len();
        self.pending.clear();
        if cancelled > 0 {
            debug!(session = %self.session, "Cancelled {} pending work requests", cancelled);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
