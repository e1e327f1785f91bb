//! Codec for encoding/decoding control frames
//!
//! Format: `[length: u32 BE][type: u8][payload: bincode serialized body]`
//!
//! `length` counts the type byte plus the payload. The codec plugs into
//! `tokio_util::codec::{FramedRead, FramedWrite, Framed}`, which turns a byte
//! stream into a stream of [`Message`]s consuming exactly one frame at a time.

use crate::messages::{FrameType, Message};
use crate::{DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_LEN};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: declared length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Malformed frame: zero-length frame")]
    EmptyFrame,

    #[error("Malformed frame: unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Malformed frame: invalid payload: {0}")]
    InvalidPayload(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// True when the peer sent bytes that cannot be a valid frame
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}

/// Length-prefixed control frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_body(frame_type: FrameType, payload: &[u8]) -> Result<Message, CodecError> {
        fn body<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
            Ok(bincode::deserialize(payload)?)
        }

        let msg = match frame_type {
            FrameType::Login => Message::Login(body(payload)?),
            FrameType::LoginResponse => Message::LoginResponse(body(payload)?),
            FrameType::ProxyRegister => Message::ProxyRegister(body(payload)?),
            FrameType::ProxyRegisterResponse => Message::ProxyRegisterResponse(body(payload)?),
            FrameType::ProxyDeregister => Message::ProxyDeregister(body(payload)?),
            FrameType::Heartbeat => Message::Heartbeat(body(payload)?),
            FrameType::WorkConnectionRequest => Message::WorkConnectionRequest(body(payload)?),
            FrameType::NewWorkConnection => Message::NewWorkConnection(body(payload)?),
            FrameType::Error => Message::Error(body(payload)?),
        };
        Ok(msg)
    }

    fn encode_body(msg: &Message) -> Result<Vec<u8>, CodecError> {
        let payload = match msg {
            Message::Login(body) => bincode::serialize(body)?,
            Message::LoginResponse(body) => bincode::serialize(body)?,
            Message::ProxyRegister(body) => bincode::serialize(body)?,
            Message::ProxyRegisterResponse(body) => bincode::serialize(body)?,
            Message::ProxyDeregister(body) => bincode::serialize(body)?,
            Message::Heartbeat(body) => bincode::serialize(body)?,
            Message::WorkConnectionRequest(body) => bincode::serialize(body)?,
            Message::NewWorkConnection(body) => bincode::serialize(body)?,
            Message::Error(body) => bincode::serialize(body)?,
        };
        Ok(payload)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_LEN];
        length_bytes.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            return Err(CodecError::EmptyFrame);
        }
        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_LEN + length;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_LEN);
        let frame = buf.split_to(length);

        let tag = frame[0];
        let frame_type = FrameType::from_tag(tag).ok_or(CodecError::UnknownFrameType(tag))?;
        trace!("Decoded {:?} frame ({} bytes)", frame_type, length);

        Self::decode_body(frame_type, &frame[1..]).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = Self::encode_body(&msg)?;
        let length = 1 + payload.len();

        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_LEN + length);
        dst.put_u32(length as u32);
        dst.put_u8(msg.frame_type().tag());
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
