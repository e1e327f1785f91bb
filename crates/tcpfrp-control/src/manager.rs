//! Session manager: the server's entry point for inbound connections
//!
//! Every inbound connection is framed and its first frame decides what it is.
//! `NewWorkConnection` marks a work connection, which is routed to the pool of
//! the session named in its token. Anything else starts a control session.

use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcpfrp_proto::{ErrorCode, FrameCodec, Message, NewWorkConnection, SessionToken, WorkToken};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::error::TunnelError;
use crate::events::LifecycleEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::pool::WorkConnection;
use crate::registry::ProxyRegistry;
use crate::relay_tracker::RelayTracker;
use crate::session::{self, CloseReason, ControlSession, SessionState};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the manager and every session it spawns
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) registry: ProxyRegistry,
    pub(crate) monitor: Arc<HeartbeatMonitor>,
    pub(crate) sessions: DashMap<SessionToken, Arc<ControlSession>>,
    pub(crate) relays: Arc<RelayTracker>,
    pub(crate) shutdown: CancellationToken,
    /// Stops the heartbeat sweep; outlives `shutdown` until sessions are closed
    sweeper_stop: CancellationToken,
}

impl ServerContext {
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.config.event_sink.emit(event);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Owns the live sessions, the proxy registry and the heartbeat sweep
///
/// Cheap to clone; clones share the same server.
#[derive(Clone)]
pub struct SessionManager {
    ctx: Arc<ServerContext>,
    sweeper_started: Arc<AtomicBool>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let ctx = Arc::new(ServerContext {
            registry: ProxyRegistry::new(config.bind_address, config.allowed_ports.clone()),
            monitor: Arc::new(HeartbeatMonitor::new(config.heartbeat_timeout)),
            sessions: DashMap::new(),
            relays: Arc::new(RelayTracker::new()),
            shutdown: CancellationToken::new(),
            sweeper_stop: CancellationToken::new(),
            config,
        });

        Ok(Self {
            ctx,
            sweeper_started: Arc::new(AtomicBool::new(false)),
            background: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Bind the control listener and accept connections in the background
    ///
    /// Returns the bound address, which matters when `listen` uses port 0.
    pub async fn start(&self, listen: SocketAddr) -> Result<SocketAddr, TunnelError> {
        if self.ctx.is_shutting_down() {
            return Err(TunnelError::ShuttingDown);
        }

        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        info!("Control listener bound on {}", local_addr);

        self.ensure_sweeper();
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.accept_loop(listener).await });
        self.track_task(handle);

        Ok(local_addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
                    }
                    let manager = self.clone();
                    tokio::spawn(async move {
                        manager.handle_connection(stream, Some(peer)).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        info!("Control listener stopped");
    }

    /// Serve one inbound connection until it is closed or handed off
    ///
    /// Usable directly by embedders that terminate TLS or another transport
    /// themselves.
    pub async fn handle_connection<S>(&self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.ensure_sweeper();

        let mut framed = Framed::new(stream, FrameCodec::new(self.ctx.config.max_frame_size));
        let first = match tokio::time::timeout(self.ctx.config.handshake_timeout, framed.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                session::reject(&mut framed, &TunnelError::from(e), peer).await;
                return;
            }
            Ok(None) => {
                debug!(peer = ?peer, "Connection closed before its first frame");
                return;
            }
            Err(_) => {
                debug!(peer = ?peer, "No frame within {:?}", self.ctx.config.handshake_timeout);
                return;
            }
        };

        match first {
            Message::NewWorkConnection(NewWorkConnection { token }) => {
                self.accept_work_connection(framed, token, peer);
            }
            other => session::run(self.ctx.clone(), framed, other, peer).await,
        }
    }

    fn accept_work_connection<S>(&self, framed: Framed<S, FrameCodec>, token: WorkToken, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Anything already buffered past the handshake frame belongs to the relay
        let parts = framed.into_parts();
        let conn = WorkConnection {
            token: token.clone(),
            io: Box::new(parts.io),
            prelude: parts.read_buf.freeze(),
            peer,
        };

        let session = self
            .ctx
            .sessions
            .get(&token.session)
            .map(|entry| entry.value().clone());
        let Some(session) = session else {
            warn!(peer = ?peer, "Work connection {} for unknown session, closing", token);
            return;
        };

        match session.pool().deliver(conn) {
            Ok(()) => debug!(peer = ?peer, "Work connection {} delivered", token),
            Err(e) => warn!(peer = ?peer, "Rejected work connection: {}", e),
        }
    }

    fn ensure_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let ctx = Arc::downgrade(&self.ctx);
        let handle = self
            .ctx
            .monitor
            .clone()
            .spawn_sweeper(self.ctx.sweeper_stop.clone(), move |token| {
                let Some(ctx) = ctx.upgrade() else {
                    return;
                };
                let session = ctx.sessions.get(&token).map(|entry| entry.value().clone());
                if let Some(session) = session {
                    tokio::spawn(async move {
                        session
                            .close_with_error(
                                ErrorCode::Timeout,
                                "No heartbeat received in time",
                                CloseReason::HeartbeatTimeout,
                            )
                            .await;
                    });
                }
            });
        self.track_task(handle);
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.background.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    /// Stop the server
    ///
    /// Stops accepting, closes every proxy listener, then closes all sessions
    /// with `ServerShutdown`. A graceful shutdown first waits, up to the drain
    /// timeout, for running relays to finish; heartbeat expiry still applies
    /// while it waits.
    pub async fn shutdown(&self, graceful: bool) {
        info!(graceful, "Shutting down tunnel server");
        self.ctx.shutdown.cancel();

        let closed = self.ctx.registry.close_all().await;
        debug!("Closed {} proxy listeners", closed);

        if graceful {
            let active = self.ctx.relays.active_count();
            if active > 0 {
                let drain = self.ctx.config.shutdown_drain_timeout;
                info!("Waiting up to {:?} for {} active relays", drain, active);
                if tokio::time::timeout(drain, self.ctx.relays.wait_idle())
                    .await
                    .is_err()
                {
                    warn!(
                        "{} relays still active after {:?}, closing them",
                        self.ctx.relays.active_count(),
                        drain
                    );
                }
            }
        }

        let sessions: Vec<Arc<ControlSession>> = self
            .ctx
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        join_all(sessions.iter().map(|session| {
            session.close_with_error(
                ErrorCode::ServerShutdown,
                "Server is shutting down",
                CloseReason::ServerShutdown,
            )
        }))
        .await;
        self.ctx.sweeper_stop.cancel();

        let tasks = match self.background.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }

        info!("Tunnel server stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionToken> {
        self.ctx
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn session(&self, token: &SessionToken) -> Option<Arc<ControlSession>> {
        self.ctx.sessions.get(token).map(|entry| entry.value().clone())
    }

    pub fn session_state(&self, token: &SessionToken) -> Option<SessionState> {
        self.ctx.sessions.get(token).map(|entry| entry.value().state())
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.ctx.registry
    }

    pub fn relays(&self) -> &RelayTracker {
        &self.ctx.relays
    }

    pub fn heartbeat_monitor(&self) -> &HeartbeatMonitor {
        &self.ctx.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcpfrp_auth::AllowAll;
    use tokio::net::TcpStream;

    fn config() -> ServerConfig {
        ServerConfig::new(Arc::new(AllowAll))
            .with_bind_address("127.0.0.1".parse().unwrap())
            .with_handshake_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = config().with_heartbeat_timeout(Duration::ZERO);
        assert!(SessionManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let manager = SessionManager::new(config()).unwrap();
        let addr = manager.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(manager.session_count(), 0);

        TcpStream::connect(addr).await.unwrap();

        manager.shutdown(true).await;
        assert!(manager.is_shutting_down());
        assert!(manager.registry().is_closed());
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(matches!(
            manager.start("127.0.0.1:0".parse().unwrap()).await,
            Err(TunnelError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_work_connection_for_unknown_session_is_closed() {
        use futures::SinkExt;
        use tokio::io::{duplex, AsyncReadExt};

        let manager = SessionManager::new(config()).unwrap();
        let (server_side, client_side) = duplex(1024);
        let served = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.handle_connection(server_side, None).await })
        };

        let mut client = Framed::new(client_side, FrameCodec::default());
        client
            .send(Message::NewWorkConnection(NewWorkConnection {
                token: WorkToken::new(SessionToken::from("ghost"), 1),
            }))
            .await
            .unwrap();

        served.await.unwrap();
        let mut io = client.into_inner();
        let mut buf = [0u8; 1];
        assert_eq!(io.read(&mut buf).await.unwrap(), 0);
        manager.shutdown(false).await;
    }

    #[tokio::test]
    async fn test_silent_connection_dropped_after_handshake_timeout() {
        use tokio::io::{duplex, AsyncReadExt};

        let manager = SessionManager::new(config()).unwrap();
        let (server_side, mut client_side) = duplex(1024);
        tokio::time::timeout(
            Duration::from_secs(2),
            manager.handle_connection(server_side, None),
        )
        .await
        .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client_side.read(&mut buf).await.unwrap(), 0);
        assert_eq!(manager.session_count(), 0);
        manager.shutdown(false).await;
    }
}
