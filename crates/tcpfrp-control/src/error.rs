//! Control plane error taxonomy
//!
//! Every error is contained to the connection or session it happened on.
//! Errors the client should hear about map onto a wire [`ErrorCode`].

use tcpfrp_proto::{CodecError, ErrorCode, WorkToken};
use thiserror::Error;

use crate::pool::PoolError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    MalformedFrame(CodecError),

    #[error("Unsupported protocol version {got} (server speaks {expected})")]
    UnsupportedVersion { got: u32, expected: u32 },

    #[error("Authentication failed")]
    AuthenticationFailure,

    #[error("Proxy name '{0}' is already in use")]
    NameInUse(String),

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Port {0} is not allowed on this server")]
    PortNotAllowed(u16),

    #[error("Failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Proxy '{0}' not found")]
    NotFound(String),

    #[error("Unknown work token {0}")]
    UnknownWorkToken(WorkToken),

    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl TunnelError {
    /// Reason code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Protocol(_) => ErrorCode::ProtocolViolation,
            TunnelError::MalformedFrame(_) => ErrorCode::MalformedFrame,
            TunnelError::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            TunnelError::AuthenticationFailure => ErrorCode::AuthenticationFailed,
            TunnelError::NameInUse(_) => ErrorCode::NameInUse,
            TunnelError::PortInUse(_) => ErrorCode::PortInUse,
            TunnelError::PortNotAllowed(_) => ErrorCode::PortNotAllowed,
            TunnelError::BindFailed { .. } => ErrorCode::BindFailed,
            TunnelError::NotFound(_) => ErrorCode::NotFound,
            TunnelError::UnknownWorkToken(_) => ErrorCode::UnknownWorkToken,
            TunnelError::TunnelUnavailable(_) | TunnelError::Timeout(_) => ErrorCode::Timeout,
            TunnelError::Transport(_) => ErrorCode::Internal,
            TunnelError::ShuttingDown => ErrorCode::ServerShutdown,
        }
    }

    /// Errors that end the whole control session
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedFrame(_)
                | TunnelError::UnsupportedVersion { .. }
                | TunnelError::AuthenticationFailure
                | TunnelError::Transport(_)
                | TunnelError::Timeout(_)
                | TunnelError::ShuttingDown
        )
    }
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => TunnelError::Transport(e),
            other => TunnelError::MalformedFrame(other),
        }
    }
}

impl From<RegistryError> for TunnelError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NameInUse { name } => TunnelError::NameInUse(name),
            RegistryError::PortInUse { port, .. } => TunnelError::PortInUse(port),
            RegistryError::PortNotAllowed { port, .. } => TunnelError::PortNotAllowed(port),
            e @ RegistryError::NoFreePort { .. } => TunnelError::BindFailed {
                port: 0,
                reason: e.to_string(),
            },
            RegistryError::BindFailed { port, source } => TunnelError::BindFailed {
                port,
                reason: source.to_string(),
            },
            RegistryError::NotFound(name) => TunnelError::NotFound(name),
            RegistryError::ShuttingDown => TunnelError::ShuttingDown,
        }
    }
}

impl From<PoolError> for TunnelError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::UnknownToken(token) => TunnelError::UnknownWorkToken(token),
            other => TunnelError::TunnelUnavailable(other.to_string()),
        }
    }
}
