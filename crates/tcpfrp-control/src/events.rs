//! Lifecycle events emitted by the control plane
//!
//! Embedders observe sessions, proxies and relays through an [`EventSink`].
//! The default sink writes each event as a structured `tracing` record.

use std::net::SocketAddr;
use tcpfrp_proto::{ErrorCode, SessionToken, WorkToken};
use tcpfrp_proxy::RelayStats;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::session::CloseReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    SessionCreated {
        session: SessionToken,
        peer: Option<SocketAddr>,
        resumed: bool,
    },
    SessionClosed {
        session: SessionToken,
        reason: CloseReason,
    },
    ProxyBound {
        session: SessionToken,
        name: String,
        port: u16,
    },
    ProxyUnbound {
        session: SessionToken,
        name: String,
        port: u16,
    },
    ProxyRejected {
        session: SessionToken,
        name: String,
        requested_port: u16,
        code: ErrorCode,
        reason: String,
    },
    RelayEstablished {
        session: SessionToken,
        proxy: String,
        peer: SocketAddr,
        token: WorkToken,
    },
    RelayClosed {
        session: SessionToken,
        proxy: String,
        peer: SocketAddr,
        stats: RelayStats,
        error: Option<String>,
    },
}

/// Consumer of lifecycle events
///
/// `emit` is called inline on connection tasks and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::SessionCreated {
                session,
                peer,
                resumed,
            } => {
                info!(session = %session, peer = ?peer, resumed, "Control session created");
            }
            LifecycleEvent::SessionClosed { session, reason } => {
                info!(session = %session, reason = %reason, "Control session closed");
            }
            LifecycleEvent::ProxyBound {
                session,
                name,
                port,
            } => {
                info!(session = %session, proxy = %name, port, "Proxy bound");
            }
            LifecycleEvent::ProxyUnbound {
                session,
                name,
                port,
            } => {
                info!(session = %session, proxy = %name, port, "Proxy unbound");
            }
            LifecycleEvent::ProxyRejected {
                session,
                name,
                requested_port,
                code,
                reason,
            } => {
                warn!(
                    session = %session,
                    proxy = %name,
                    port = requested_port,
                    code = %code,
                    "Proxy registration rejected: {}",
                    reason
                );
            }
            LifecycleEvent::RelayEstablished {
                session,
                proxy,
                peer,
                token,
            } => {
                info!(session = %session, proxy = %proxy, peer = %peer, token = %token, "Relay established");
            }
            LifecycleEvent::RelayClosed {
                session,
                proxy,
                peer,
                stats,
                error,
            } => match error {
                None => info!(
                    session = %session,
                    proxy = %proxy,
                    peer = %peer,
                    bytes_in = stats.public_to_work,
                    bytes_out = stats.work_to_public,
                    "Relay closed"
                ),
                Some(error) => warn!(
                    session = %session,
                    proxy = %proxy,
                    peer = %peer,
                    bytes_in = stats.public_to_work,
                    bytes_out = stats.work_to_public,
                    "Relay closed with error: {}",
                    error
                ),
            },
        }
    }
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: LifecycleEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        let sink: std::sync::Arc<dyn EventSink> = std::sync::Arc::new(sink);

        sink.emit(LifecycleEvent::ProxyBound {
            session: SessionToken::from("s1"),
            name: "web".to_string(),
            port: 8080,
        });

        assert_eq!(
            rx.recv().await,
            Some(LifecycleEvent::ProxyBound {
                session: SessionToken::from("s1"),
                name: "web".to_string(),
                port: 8080,
            })
        );
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        sink.emit(LifecycleEvent::SessionClosed {
            session: SessionToken::from("s1"),
            reason: CloseReason::ClientDisconnected,
        });
    }

    #[test]
    fn test_tracing_sink_handles_every_event() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let session = SessionToken::from("s1");
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let events = vec![
            LifecycleEvent::SessionCreated {
                session: session.clone(),
                peer: Some(peer),
                resumed: false,
            },
            LifecycleEvent::ProxyRejected {
                session: session.clone(),
                name: "db".to_string(),
                requested_port: 5432,
                code: ErrorCode::PortInUse,
                reason: "Port 5432 is already in use".to_string(),
            },
            LifecycleEvent::RelayClosed {
                session: session.clone(),
                proxy: "db".to_string(),
                peer,
                stats: RelayStats::default(),
                error: Some("connection reset".to_string()),
            },
            LifecycleEvent::SessionClosed {
                session,
                reason: CloseReason::HeartbeatTimeout,
            },
        ];

        for event in events {
            TracingEventSink.emit(event);
        }
    }
}
