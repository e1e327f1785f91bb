//! Server configuration

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tcpfrp_auth::Authenticator;
use tcpfrp_proto::DEFAULT_MAX_FRAME_SIZE;
use thiserror::Error;

use crate::events::{EventSink, TracingEventSink};

/// Smallest frame size limit that still fits every control message
pub const MIN_FRAME_SIZE: usize = 256;

/// Which side sends heartbeat pings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    /// The client pings; the server answers with a pong
    #[default]
    ClientPings,
    /// The server pings every `interval`; the client answers with a pong
    ServerPings { interval: Duration },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("Server ping interval {interval:?} must be shorter than the heartbeat timeout {timeout:?}")]
    PingIntervalTooLong { interval: Duration, timeout: Duration },

    #[error("Max frame size {0} is below the minimum of {min} bytes", min = MIN_FRAME_SIZE)]
    FrameSizeTooSmall(usize),

    #[error("Relay buffer size must be greater than zero")]
    ZeroRelayBuffer,

    #[error("Invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },
}

/// Everything the control plane needs from its embedder
#[derive(Clone)]
pub struct ServerConfig {
    pub authenticator: Arc<dyn Authenticator>,
    /// A session that has not been heard from for this long is torn down
    pub heartbeat_timeout: Duration,
    pub heartbeat_mode: HeartbeatMode,
    /// How long a public connection waits for its work connection
    pub work_connection_timeout: Duration,
    pub max_frame_size: usize,
    /// Address public proxy listeners bind to
    pub bind_address: IpAddr,
    /// Ports clients may request; `None` allows any port
    pub allowed_ports: Option<RangeInclusive<u16>>,
    /// Bounds the wait for the first frame and for a completed login
    pub handshake_timeout: Duration,
    pub relay_buffer_size: usize,
    /// How long a graceful shutdown waits for active relays
    pub shutdown_drain_timeout: Duration,
    /// Reported to clients in pong frames
    pub server_name: String,
    pub event_sink: Arc<dyn EventSink>,
}

impl ServerConfig {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            heartbeat_timeout: Duration::from_secs(90),
            heartbeat_mode: HeartbeatMode::ClientPings,
            work_connection_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            allowed_ports: None,
            handshake_timeout: Duration::from_secs(10),
            relay_buffer_size: tcpfrp_proxy::DEFAULT_BUFFER_SIZE,
            shutdown_drain_timeout: Duration::from_secs(30),
            server_name: "tcpfrp".to_string(),
            event_sink: Arc::new(TracingEventSink),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_heartbeat_mode(mut self, mode: HeartbeatMode) -> Self {
        self.heartbeat_mode = mode;
        self
    }

    pub fn with_work_connection_timeout(mut self, timeout: Duration) -> Self {
        self.work_connection_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_allowed_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.allowed_ports = Some(ports);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_relay_buffer_size(mut self, size: usize) -> Self {
        self.relay_buffer_size = size;
        self
    }

    pub fn with_shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_drain_timeout = timeout;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("work_connection_timeout", self.work_connection_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }

        if let HeartbeatMode::ServerPings { interval } = self.heartbeat_mode {
            if interval.is_zero() {
                return Err(ConfigError::ZeroDuration("server ping interval"));
            }
            if interval >= self.heartbeat_timeout {
                return Err(ConfigError::PingIntervalTooLong {
                    interval,
                    timeout: self.heartbeat_timeout,
                });
            }
        }

        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::FrameSizeTooSmall(self.max_frame_size));
        }

        if self.relay_buffer_size == 0 {
            return Err(ConfigError::ZeroRelayBuffer);
        }

        if let Some(range) = &self.allowed_ports {
            let (start, end) = (*range.start(), *range.end());
            if start == 0 || start > end {
                return Err(ConfigError::InvalidPortRange { start, end });
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("heartbeat_mode", &self.heartbeat_mode)
            .field("work_connection_timeout", &self.work_connection_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("bind_address", &self.bind_address)
            .field("allowed_ports", &self.allowed_ports)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("relay_buffer_size", &self.relay_buffer_size)
            .field("shutdown_drain_timeout", &self.shutdown_drain_timeout)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
