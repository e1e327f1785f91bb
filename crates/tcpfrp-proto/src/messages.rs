//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session token assigned to a control session at login
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// Mint a fresh random token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token pairing a public connection with a work connection
///
/// `seq` is allocated from a per-session counter and never reissued, so a token
/// cannot be confused with a request that has already been retired.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkToken {
    pub session: SessionToken,
    pub seq: u64,
}

impl WorkToken {
    pub fn new(session: SessionToken, seq: u64) -> Self {
        Self { session, seq }
    }
}

impl fmt::Display for WorkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.seq)
    }
}

/// One-byte frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Login = 0x01,
    LoginResponse = 0x02,
    ProxyRegister = 0x03,
    ProxyRegisterResponse = 0x04,
    ProxyDeregister = 0x05,
    Heartbeat = 0x06,
    WorkConnectionRequest = 0x07,
    NewWorkConnection = 0x08,
    Error = 0x09,
}

impl FrameType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameType::Login),
            0x02 => Some(FrameType::LoginResponse),
            0x03 => Some(FrameType::ProxyRegister),
            0x04 => Some(FrameType::ProxyRegisterResponse),
            0x05 => Some(FrameType::ProxyDeregister),
            0x06 => Some(FrameType::Heartbeat),
            0x07 => Some(FrameType::WorkConnectionRequest),
            0x08 => Some(FrameType::NewWorkConnection),
            0x09 => Some(FrameType::Error),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Control channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(Login),
    LoginResponse(LoginResponse),
    ProxyRegister(ProxyRegister),
    ProxyRegisterResponse(ProxyRegisterResponse),
    ProxyDeregister(ProxyDeregister),
    Heartbeat(Heartbeat),
    /// Server asks the client to open a new work connection (server -> client)
    WorkConnectionRequest(WorkConnectionRequest),
    /// First frame on a freshly opened work connection (client -> server)
    NewWorkConnection(NewWorkConnection),
    Error(ErrorFrame),
}

impl Message {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Message::Login(_) => FrameType::Login,
            Message::LoginResponse(_) => FrameType::LoginResponse,
            Message::ProxyRegister(_) => FrameType::ProxyRegister,
            Message::ProxyRegisterResponse(_) => FrameType::ProxyRegisterResponse,
            Message::ProxyDeregister(_) => FrameType::ProxyDeregister,
            Message::Heartbeat(_) => FrameType::Heartbeat,
            Message::WorkConnectionRequest(_) => FrameType::WorkConnectionRequest,
            Message::NewWorkConnection(_) => FrameType::NewWorkConnection,
            Message::Error(_) => FrameType::Error,
        }
    }

    /// Shorthand for an `Error` frame
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorFrame {
            code,
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub version: u32,
    pub credentials: String,
    /// Token of a previous session the client would like to resume
    pub session_token: Option<SessionToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session_token: SessionToken,
    pub ok: bool,
    pub reason: Option<String>,
}

/// Proxy protocol kind. Only raw TCP is tunnelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProxyProtocol {
    #[default]
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRegister {
    pub name: String,
    /// Public port to expose; 0 lets the server choose
    pub remote_port: u16,
    pub protocol: ProxyProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRegisterResponse {
    pub name: String,
    pub ok: bool,
    /// Port actually bound (0 on failure)
    pub remote_port: u16,
    pub code: Option<ErrorCode>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDeregister {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heartbeat {
    Ping { timestamp: u64 },
    Pong { timestamp: u64, server_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkConnectionRequest {
    pub token: WorkToken,
    pub proxy_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkConnection {
    pub token: WorkToken,
}

/// Reason codes carried by `Error` and `ProxyRegisterResponse` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolViolation,
    MalformedFrame,
    UnsupportedVersion,
    AuthenticationFailed,
    NameInUse,
    PortInUse,
    PortNotAllowed,
    BindFailed,
    NotFound,
    UnknownWorkToken,
    Timeout,
    ServerShutdown,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::MalformedFrame => "malformed_frame",
            ErrorCode::UnsupportedVersion => "unsupported_version",
            ErrorCode::AuthenticationFailed => "authentication_failed",
            ErrorCode::NameInUse => "name_in_use",
            ErrorCode::PortInUse => "port_in_use",
            ErrorCode::PortNotAllowed => "port_not_allowed",
            ErrorCode::BindFailed => "bind_failed",
            ErrorCode::NotFound => "not_found",
            ErrorCode::UnknownWorkToken => "unknown_work_token",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ServerShutdown => "server_shutdown",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}
