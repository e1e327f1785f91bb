//! Control session state machine
//!
//! `AwaitingLogin -> Active -> Closing -> Closed`
//!
//! A control connection starts in `AwaitingLogin`, where only a `Login` frame
//! is valid. A successful login creates the [`ControlSession`], registers it
//! with the manager and moves it to `Active`. Frames are processed strictly in
//! arrival order by one reader; all outbound frames go through a bounded queue
//! drained by a dedicated writer task.
//!
//! Teardown is single-winner: whichever of the reader, the writer, the
//! heartbeat sweeper or server shutdown calls [`ControlSession::close`] first
//! performs it, every later call returns immediately.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tcpfrp_proto::{
    CodecError, ErrorCode, FrameCodec, Heartbeat, Login, LoginResponse, Message, ProxyDeregister,
    ProxyProtocol, ProxyRegister, ProxyRegisterResponse, SessionToken, WorkConnectionRequest,
    PROTOCOL_VERSION,
};
use tcpfrp_proxy::{PublicConnectionHandler, Relay, RelayCounters};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HeartbeatMode;
use crate::error::TunnelError;
use crate::events::LifecycleEvent;
use crate::manager::ServerContext;
use crate::pool::{WorkConnection, WorkConnectionPool};
use crate::registry::ProxyBinding;

/// Consecutive rejected frames after which the session is closed
pub const MAX_CONSECUTIVE_VIOLATIONS: u32 = 3;

/// Longest accepted proxy name
pub const MAX_PROXY_NAME_LEN: usize = 128;

const OUTBOUND_QUEUE: usize = 64;

/// Upper bound for flushing the last frames of a closing connection
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type ControlSink<S> = SplitSink<Framed<S, FrameCodec>, Message>;
type ControlStream<S> = SplitStream<Framed<S, FrameCodec>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    AwaitingLogin = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::AwaitingLogin,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Whether a client frame is valid in this state
    pub fn accepts(self, msg: &Message) -> bool {
        match self {
            SessionState::AwaitingLogin => matches!(msg, Message::Login(_)),
            SessionState::Active => matches!(
                msg,
                Message::ProxyRegister(_)
                    | Message::ProxyDeregister(_)
                    | Message::Heartbeat(_)
                    | Message::NewWorkConnection(_)
            ),
            SessionState::Closing | SessionState::Closed => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    ProtocolViolation,
    MalformedFrame,
    HeartbeatTimeout,
    Transport(String),
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnected => write!(f, "client disconnected"),
            CloseReason::ProtocolViolation => write!(f, "protocol violation"),
            CloseReason::MalformedFrame => write!(f, "malformed frame"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

pub struct ControlSession {
    token: SessionToken,
    peer: Option<SocketAddr>,
    ctx: Arc<ServerContext>,
    state: AtomicU8,
    closing: AtomicBool,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    /// Bindings owned by this session; also serializes register against close
    proxies: Mutex<HashMap<String, Arc<ProxyBinding>>>,
    pool: WorkConnectionPool,
    self_ref: Weak<ControlSession>,
    created_at: DateTime<Utc>,
}

impl ControlSession {
    fn new(
        token: SessionToken,
        peer: Option<SocketAddr>,
        ctx: Arc<ServerContext>,
        outbound: mpsc::Sender<Message>,
    ) -> Arc<Self> {
        let pool = WorkConnectionPool::new(token.clone(), ctx.config.work_connection_timeout);
        Arc::new_cyclic(|self_ref| Self {
            token,
            peer,
            ctx,
            state: AtomicU8::new(SessionState::AwaitingLogin as u8),
            closing: AtomicBool::new(false),
            outbound,
            cancel: CancellationToken::new(),
            proxies: Mutex::new(HashMap::new()),
            pool,
            self_ref: self_ref.clone(),
            created_at: Utc::now(),
        })
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn pool(&self) -> &WorkConnectionPool {
        &self.pool
    }

    /// Snapshot of the proxies this session currently owns
    pub async fn proxies(&self) -> Vec<Arc<ProxyBinding>> {
        self.proxies.lock().await.values().cloned().collect()
    }

    fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::AwaitingLogin as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue a frame for the client
    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        self.outbound.send(msg).await.map_err(|_| {
            TunnelError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "control connection writer has stopped",
            ))
        })
    }

    /// Tear the session down. Only the first call has any effect.
    pub async fn close(&self, reason: CloseReason) {
        self.shutdown(None, reason).await;
    }

    /// Like [`close`](Self::close), telling the client why first
    pub async fn close_with_error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        reason: CloseReason,
    ) {
        self.shutdown(Some(Message::error(code, message)), reason)
            .await;
    }

    async fn shutdown(&self, notice: Option<Message>, reason: CloseReason) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(SessionState::Closing as u8, Ordering::Release);
        debug!(session = %self.token, "Closing control session: {}", reason);

        if let Some(notice) = notice {
            // Best effort; a full queue means the client is not reading anyway
            let _ = self.outbound.try_send(notice);
        }
        self.cancel.cancel();

        let bindings: Vec<Arc<ProxyBinding>> = self
            .proxies
            .lock()
            .await
            .drain()
            .map(|(_, binding)| binding)
            .collect();
        for binding in bindings {
            self.release_binding(&binding).await;
        }

        self.pool.close();
        self.ctx.monitor.remove(&self.token);
        self.ctx
            .sessions
            .remove_if(&self.token, |_, session| std::ptr::eq(Arc::as_ptr(session), self));

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.ctx.emit(LifecycleEvent::SessionClosed {
            session: self.token.clone(),
            reason,
        });
    }

    async fn release_binding(&self, binding: &ProxyBinding) {
        if let Err(e) = self
            .ctx
            .registry
            .unbind_owned(&binding.name, &self.token)
            .await
        {
            // Already closed by a server-wide shutdown
            debug!(session = %self.token, proxy = %binding.name, "{}", e);
        }

        let cancelled = self.pool.cancel_proxy(&binding.name);
        if cancelled > 0 {
            debug!(
                session = %self.token,
                proxy = %binding.name,
                "Cancelled {} pending work requests",
                cancelled
            );
        }

        self.ctx.emit(LifecycleEvent::ProxyUnbound {
            session: self.token.clone(),
            name: binding.name.clone(),
            port: binding.port(),
        });
    }

    async fn read_loop<S>(&self, mut stream: ControlStream<S>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut violations = 0u32;

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                frame = stream.next() => frame,
            };

            let msg = match frame {
                None => {
                    self.close(CloseReason::ClientDisconnected).await;
                    return;
                }
                Some(Err(e)) => {
                    self.fail(e.into()).await;
                    return;
                }
                Some(Ok(msg)) => msg,
            };

            match self.handle_frame(msg).await {
                Ok(()) => violations = 0,
                Err(err) if err.is_session_fatal() => {
                    self.fail(err).await;
                    return;
                }
                Err(err) => {
                    violations += 1;
                    warn!(
                        session = %self.token,
                        "Rejected frame ({}/{}): {}",
                        violations,
                        MAX_CONSECUTIVE_VIOLATIONS,
                        err
                    );

                    if violations >= MAX_CONSECUTIVE_VIOLATIONS {
                        self.close_with_error(
                            err.code(),
                            format!("Too many protocol violations, last: {}", err),
                            CloseReason::ProtocolViolation,
                        )
                        .await;
                        return;
                    }

                    if let Err(e) = self.send(Message::error(err.code(), err.to_string())).await {
                        self.fail(e).await;
                        return;
                    }
                }
            }
        }
    }

    /// Close the session because of a session-fatal error
    async fn fail(&self, err: TunnelError) {
        match err {
            TunnelError::Transport(e) => self.close(CloseReason::Transport(e.to_string())).await,
            TunnelError::MalformedFrame(e) => {
                self.close_with_error(
                    ErrorCode::MalformedFrame,
                    e.to_string(),
                    CloseReason::MalformedFrame,
                )
                .await
            }
            TunnelError::ShuttingDown => {
                self.close_with_error(
                    ErrorCode::ServerShutdown,
                    err.to_string(),
                    CloseReason::ServerShutdown,
                )
                .await
            }
            other => {
                self.close_with_error(
                    other.code(),
                    other.to_string(),
                    CloseReason::ProtocolViolation,
                )
                .await
            }
        }
    }

    async fn handle_frame(&self, msg: Message) -> Result<(), TunnelError> {
        let state = self.state();
        if !state.accepts(&msg) {
            return Err(TunnelError::Protocol(format!(
                "{:?} frame is not valid in state {:?}",
                msg.frame_type(),
                state
            )));
        }

        match msg {
            Message::ProxyRegister(request) => self.handle_register(request).await,
            Message::ProxyDeregister(request) => self.handle_deregister(request).await,
            Message::Heartbeat(Heartbeat::Ping { timestamp }) => {
                self.ctx.monitor.touch(&self.token);
                self.send(Message::Heartbeat(Heartbeat::Pong {
                    timestamp,
                    server_name: self.ctx.config.server_name.clone(),
                }))
                .await
            }
            Message::Heartbeat(Heartbeat::Pong { .. }) => {
                self.ctx.monitor.touch(&self.token);
                Ok(())
            }
            Message::NewWorkConnection(announcement) => {
                if self.pool.announce(&announcement.token) {
                    debug!(session = %self.token, "Work connection {} announced", announcement.token);
                    Ok(())
                } else {
                    let err = TunnelError::UnknownWorkToken(announcement.token);
                    self.send(Message::error(err.code(), err.to_string())).await
                }
            }
            other => Err(TunnelError::Protocol(format!(
                "Unexpected {:?} frame",
                other.frame_type()
            ))),
        }
    }

    async fn handle_register(&self, request: ProxyRegister) -> Result<(), TunnelError> {
        let ProxyRegister {
            name,
            remote_port,
            protocol,
        } = request;

        let response = match self.bind_proxy(&name, remote_port, protocol).await {
            Ok(binding) => ProxyRegisterResponse {
                name,
                ok: true,
                remote_port: binding.port(),
                code: None,
                reason: None,
            },
            Err(TunnelError::ShuttingDown) if self.is_closing() => return Ok(()),
            Err(err) => {
                self.ctx.emit(LifecycleEvent::ProxyRejected {
                    session: self.token.clone(),
                    name: name.clone(),
                    requested_port: remote_port,
                    code: err.code(),
                    reason: err.to_string(),
                });
                ProxyRegisterResponse {
                    name,
                    ok: false,
                    remote_port: 0,
                    code: Some(err.code()),
                    reason: Some(err.to_string()),
                }
            }
        };

        self.send(Message::ProxyRegisterResponse(response)).await
    }

    async fn bind_proxy(
        &self,
        name: &str,
        port: u16,
        protocol: ProxyProtocol,
    ) -> Result<Arc<ProxyBinding>, TunnelError> {
        if name.is_empty() || name.len() > MAX_PROXY_NAME_LEN {
            return Err(TunnelError::Protocol(format!(
                "Proxy name must be 1 to {} bytes long",
                MAX_PROXY_NAME_LEN
            )));
        }

        let mut proxies = self.proxies.lock().await;
        if self.is_closing() {
            return Err(TunnelError::ShuttingDown);
        }

        let handler = Arc::new(ProxyEntry {
            session: self.self_ref.clone(),
            proxy: name.to_string(),
        });
        let bound = self
            .ctx
            .registry
            .bind(name, port, protocol, &self.token, handler)
            .await?;

        let binding = bound.binding().clone();
        if bound.is_new() {
            proxies.insert(name.to_string(), binding.clone());
            self.ctx.emit(LifecycleEvent::ProxyBound {
                session: self.token.clone(),
                name: name.to_string(),
                port: binding.port(),
            });
        }

        Ok(binding)
    }

    async fn handle_deregister(&self, request: ProxyDeregister) -> Result<(), TunnelError> {
        let mut proxies = self.proxies.lock().await;
        match proxies.remove(&request.name) {
            Some(binding) => {
                self.release_binding(&binding).await;
                Ok(())
            }
            None => {
                drop(proxies);
                let err = TunnelError::NotFound(request.name);
                self.send(Message::error(err.code(), err.to_string())).await
            }
        }
    }

    /// Pair a public connection with a work connection and relay it
    async fn serve_public(&self, public: TcpStream, peer: SocketAddr, proxy: &str) {
        if !self.is_active() {
            debug!(session = %self.token, proxy = %proxy, "Session not active, dropping {}", peer);
            return;
        }

        let pending = match self.pool.request(proxy) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(session = %self.token, proxy = %proxy, "Dropping {}: {}", peer, e);
                return;
            }
        };
        let token = pending.token().clone();

        // Deregistration removes the name before cancelling pending requests
        if !self.proxies.lock().await.contains_key(proxy) {
            self.pool.cancel(&token);
            debug!(
                session = %self.token,
                proxy = %proxy,
                "Proxy deregistered, dropping {}",
                peer
            );
            return;
        }

        let request = Message::WorkConnectionRequest(WorkConnectionRequest {
            token: token.clone(),
            proxy_name: proxy.to_string(),
        });
        if let Err(e) = self.send(request).await {
            self.pool.cancel(&token);
            debug!(session = %self.token, proxy = %proxy, "Dropping {}: {}", peer, e);
            return;
        }

        let work = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pool.cancel(&token);
                return;
            }
            work = self.pool.wait(pending) => work,
        };

        let WorkConnection { io, prelude, .. } = match work {
            Ok(work) => work,
            Err(e) => {
                let err = TunnelError::from(e);
                warn!(session = %self.token, proxy = %proxy, peer = %peer, "{}", err);
                return;
            }
        };

        let _guard = self.ctx.relays.track(self.token.clone(), proxy, peer);
        self.ctx.emit(LifecycleEvent::RelayEstablished {
            session: self.token.clone(),
            proxy: proxy.to_string(),
            peer,
            token,
        });

        let relay = Relay::new(self.ctx.config.relay_buffer_size);
        let counters = RelayCounters::new();
        let (stats, error) = tokio::select! {
            result = relay.run_counted(public, io, prelude, &counters) => match result {
                Ok(stats) => (stats, None),
                Err(e) => (e.stats, Some(e.to_string())),
            },
            _ = self.cancel.cancelled() => {
                (counters.snapshot(), Some("control session closed".to_string()))
            }
        };

        self.ctx.emit(LifecycleEvent::RelayClosed {
            session: self.token.clone(),
            proxy: proxy.to_string(),
            peer,
            stats,
            error,
        });
    }

    fn spawn_pinger(&self, interval: Duration) {
        let session = self.self_ref.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(session) = session.upgrade() else { break };
                        let ping = Message::Heartbeat(Heartbeat::Ping { timestamp: unix_millis() });
                        if session.send(ping).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn write_loop<S>(
        session: Weak<ControlSession>,
        mut sink: ControlSink<S>,
        mut outbound: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let failure = loop {
            let msg = tokio::select! {
                biased;
                msg = outbound.recv() => msg,
                _ = cancel.cancelled() => break None,
            };
            let Some(msg) = msg else { break None };

            let sent = tokio::select! {
                biased;
                result = sink.send(msg) => result,
                _ = cancel.cancelled() => break None,
            };
            if let Err(e) = sent {
                break Some(e);
            }
        };

        match failure {
            Some(e) => {
                debug!("Control connection write failed: {}", e);
                if let Some(session) = session.upgrade() {
                    session.close(CloseReason::Transport(e.to_string())).await;
                }
            }
            None => {
                let flushed =
                    tokio::time::timeout(FINAL_FLUSH_TIMEOUT, flush_queued(&mut sink, &mut outbound))
                        .await;
                if !matches!(flushed, Ok(Ok(()))) {
                    debug!("Control connection closed without flushing queued frames");
                }
            }
        }
    }
}

impl fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlSession")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Accept-loop callback for one proxy; only a weak link to its session
struct ProxyEntry {
    session: Weak<ControlSession>,
    proxy: String,
}

#[async_trait]
impl PublicConnectionHandler for ProxyEntry {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        match self.session.upgrade() {
            Some(session) => session.serve_public(stream, peer_addr, &self.proxy).await,
            None => debug!(proxy = %self.proxy, "Session gone, dropping {}", peer_addr),
        }
    }
}

async fn flush_queued<S>(
    sink: &mut ControlSink<S>,
    outbound: &mut mpsc::Receiver<Message>,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Ok(msg) = outbound.try_recv() {
        sink.feed(msg).await?;
    }
    sink.close().await
}

fn unix_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Drive one control connection from its first frame until it closes
pub(crate) async fn run<S>(
    ctx: Arc<ServerContext>,
    mut framed: Framed<S, FrameCodec>,
    first: Message,
    peer: Option<SocketAddr>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let login = match await_login(&ctx, &mut framed, first).await {
        Ok(login) => login,
        Err(err) => {
            reject(&mut framed, &err, peer).await;
            return;
        }
    };

    let Established {
        session,
        outbound,
        resumed,
    } = match establish(&ctx, login, peer).await {
        Ok(established) => established,
        Err(err) => {
            reject(&mut framed, &err, peer).await;
            return;
        }
    };

    let (sink, stream) = framed.split();
    let writer = tokio::spawn(ControlSession::write_loop(
        session.self_ref.clone(),
        sink,
        outbound,
        session.cancel.clone(),
    ));

    ctx.emit(LifecycleEvent::SessionCreated {
        session: session.token.clone(),
        peer,
        resumed,
    });

    let response = Message::LoginResponse(LoginResponse {
        session_token: session.token.clone(),
        ok: true,
        reason: None,
    });
    if session.send(response).await.is_ok() && session.activate() {
        if ctx.is_shutting_down() {
            session
                .close_with_error(
                    ErrorCode::ServerShutdown,
                    "Server is shutting down",
                    CloseReason::ServerShutdown,
                )
                .await;
        } else if let HeartbeatMode::ServerPings { interval } = ctx.config.heartbeat_mode {
            session.spawn_pinger(interval);
        }

        session.read_loop(stream).await;
    }

    session.close(CloseReason::ClientDisconnected).await;
    let _ = writer.await;
}

/// AwaitingLogin: read frames until a Login arrives, rejecting anything else
async fn await_login<S>(
    ctx: &ServerContext,
    framed: &mut Framed<S, FrameCodec>,
    first: Message,
) -> Result<Login, TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let deadline = Instant::now() + ctx.config.handshake_timeout;
    let mut next = Some(first);
    let mut violations = 0u32;

    loop {
        let msg = match next.take() {
            Some(msg) => msg,
            None => match tokio::time::timeout_at(deadline, framed.next()).await {
                Err(_) => return Err(TunnelError::Timeout("no login received".to_string())),
                Ok(None) => {
                    return Err(TunnelError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed before login",
                    )))
                }
                Ok(Some(frame)) => frame?,
            },
        };

        if let Message::Login(login) = msg {
            return Ok(login);
        }

        violations += 1;
        let err = TunnelError::Protocol(format!(
            "Expected Login, got {:?} before authentication",
            msg.frame_type()
        ));
        if violations >= MAX_CONSECUTIVE_VIOLATIONS {
            return Err(err);
        }
        framed
            .send(Message::error(err.code(), err.to_string()))
            .await?;
    }
}

struct Established {
    session: Arc<ControlSession>,
    outbound: mpsc::Receiver<Message>,
    resumed: bool,
}

/// Validate a login and register the new session
async fn establish(
    ctx: &Arc<ServerContext>,
    login: Login,
    peer: Option<SocketAddr>,
) -> Result<Established, TunnelError> {
    if login.version != PROTOCOL_VERSION {
        return Err(TunnelError::UnsupportedVersion {
            got: login.version,
            expected: PROTOCOL_VERSION,
        });
    }
    if ctx.is_shutting_down() {
        return Err(TunnelError::ShuttingDown);
    }

    let accepted = tokio::time::timeout(
        ctx.config.handshake_timeout,
        ctx.config.authenticator.validate(&login.credentials),
    )
    .await
    .map_err(|_| TunnelError::Timeout("authentication did not complete".to_string()))?;
    if !accepted {
        return Err(TunnelError::AuthenticationFailure);
    }

    let requested = login
        .session_token
        .filter(|token| !token.as_str().is_empty());
    let mut token = match &requested {
        Some(token) if !ctx.sessions.contains_key(token) => token.clone(),
        _ => SessionToken::generate(),
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let session = loop {
        let candidate = ControlSession::new(token.clone(), peer, ctx.clone(), outbound_tx.clone());
        match ctx.sessions.entry(token.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(candidate.clone());
                break candidate;
            }
            // Another login claimed the same token in the meantime
            Entry::Occupied(_) => token = SessionToken::generate(),
        }
    };

    ctx.monitor.register(&session.token);
    info!(session = %session.token, peer = ?peer, "Client logged in");

    let resumed = requested.as_ref() == Some(&session.token);
    Ok(Established {
        session,
        outbound: outbound_rx,
        resumed,
    })
}

pub(crate) async fn reject<S>(framed: &mut Framed<S, FrameCodec>, err: &TunnelError, peer: Option<SocketAddr>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    warn!(peer = ?peer, "Rejecting control connection: {}", err);
    if matches!(err, TunnelError::Transport(_)) {
        return;
    }

    let notice = Message::error(err.code(), err.to_string());
    let _ = tokio::time::timeout(FINAL_FLUSH_TIMEOUT, send_final(framed, notice)).await;
}

async fn send_final<S>(framed: &mut Framed<S, FrameCodec>, msg: Message) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    framed.send(msg).await?;
    framed.close().await
}
