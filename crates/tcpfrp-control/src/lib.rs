//! Control plane for the tunnel server
//!
//! The [`SessionManager`] accepts inbound connections and tells control
//! connections apart from work connections by their first frame. Each logged-in
//! client is driven by a [`ControlSession`], which registers proxies in the
//! shared [`ProxyRegistry`], answers heartbeats tracked by the
//! [`HeartbeatMonitor`] and solicits work connections through its
//! [`WorkConnectionPool`].

pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod relay_tracker;
pub mod session;

pub use config::{ConfigError, HeartbeatMode, ServerConfig};
pub use error::TunnelError;
pub use events::{ChannelEventSink, EventSink, LifecycleEvent, TracingEventSink};
pub use heartbeat::HeartbeatMonitor;
pub use manager::SessionManager;
pub use pool::{PendingWork, PoolError, TunnelIo, WorkConnection, WorkConnectionPool};
pub use registry::{Bound, ProxyBinding, ProxyRegistry, RegistryError};
pub use relay_tracker::{RelayGuard, RelayInfo, RelayTracker};
pub use session::{CloseReason, ControlSession, SessionState};
