//! Tunnel Protocol Definitions
//!
//! This crate defines the control-channel messages exchanged between a tunnel
//! client and the server, and the length-prefixed frame codec that carries them.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum frame size (64KB)
///
/// Control frames are small; anything larger is treated as hostile.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame header: 4-byte big-endian length followed by a 1-byte type tag
pub const LENGTH_PREFIX_LEN: usize = 4;
