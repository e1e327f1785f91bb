//! Public TCP proxy listeners and the byte relay
//!
//! Every registered proxy gets its own [`ProxyListener`] bound on the server.
//! Accepted public connections are handed to a [`PublicConnectionHandler`];
//! once paired with a work connection the bytes are pumped by [`Relay`].

mod listener;
mod relay;

pub use listener::{ListenerHandle, ProxyListener, ProxyListenerError, PublicConnectionHandler};
pub use relay::{
    Direction, Relay, RelayCounters, RelayError, RelayStats, DEFAULT_BUFFER_SIZE,
};
