//! WebSocket frame codec, server role (RFC 6455 Section 5).
//!
//! The decoder accepts masked client frames and produces [`Frame`]s with the
//! payload already unmasked; the encoder writes server frames and applies a
//! mask only when the frame carries a key. Oversized payloads, fragmented
//! control frames, and reserved-bit abuse are rejected during decode so the
//! pipeline's error handler can answer with a close frame.

use crate::codec::{ByteToMessageHandler, Decoder, Encoder};
use crate::pipeline::ChannelHandler;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use core::fmt;
use std::io;

/// Maximum payload length of a control frame (RFC 6455 Section 5.5).
const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame of a fragmented message.
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Parses an opcode from its 4-bit wire value.
    pub const fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }
}

/// A single WebSocket frame.
///
/// `payload` always holds the application data in the clear; `mask_key`
/// records the key a decoded client frame arrived under, and asks the
/// encoder to mask when set on an outgoing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Masking key, if the frame is (to be) masked.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload data.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Creates a final binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Creates a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Creates a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Creates a close frame carrying a status code and reason.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self {
            fin: true,
            opcode: Opcode::Close,
            mask_key: None,
            payload: payload.freeze(),
        }
    }

    /// Returns the close status code, if this is a close frame with one.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// WebSocket codec errors.
#[derive(Debug)]
pub enum FrameError {
    /// I/O error surfaced by the transport.
    Io(io::Error),
    /// Invalid opcode value on the wire.
    InvalidOpcode(u8),
    /// Reserved bits set without a negotiated extension.
    ReservedBitsSet,
    /// Payload exceeds the configured maximum frame size.
    PayloadTooLarge {
        /// Advertised payload size in bytes.
        size: u64,
        /// Configured maximum in bytes.
        max: usize,
    },
    /// Control frame payload exceeds 125 bytes.
    ControlFrameTooLarge(usize),
    /// Control frame without the FIN bit set.
    FragmentedControlFrame,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidOpcode(op) => write!(f, "invalid opcode: 0x{op:X}"),
            Self::ReservedBitsSet => write!(f, "reserved bits set without extension"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload too large: {size} bytes (max: {max})")
            }
            Self::ControlFrameTooLarge(size) => {
                write!(f, "control frame payload too large: {size} bytes (max: 125)")
            }
            Self::FragmentedControlFrame => write!(f, "control frame cannot be fragmented"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Maps a codec error to the close frame the peer must be answered with.
///
/// Oversized payloads get `1009 Message Too Big`; every other protocol
/// violation gets `1002 Protocol Error`.
#[must_use]
pub fn close_frame_for(error: &FrameError) -> Frame {
    match error {
        FrameError::PayloadTooLarge { .. } => Frame::close(1009, "frame too large"),
        _ => Frame::close(1002, "protocol error"),
    }
}

/// Outbound frame encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Creates a frame encoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLarge(frame.payload.len()));
            }
        }

        let mut first = frame.opcode as u8;
        if frame.fin {
            first |= 0x80;
        }
        dst.put_u8(first);

        let mask_bit = if frame.mask_key.is_some() { 0x80 } else { 0x00 };
        let len = frame.payload.len();
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match frame.mask_key {
            Some(key) => {
                dst.put_slice(&key);
                for (i, byte) in frame.payload.iter().enumerate() {
                    dst.put_u8(byte ^ key[i % 4]);
                }
            }
            None => dst.put_slice(&frame.payload),
        }
        Ok(())
    }
}

impl ChannelHandler for FrameEncoder {
    fn name(&self) -> &'static str {
        "ws-frame-encoder"
    }
}

/// Inbound frame decoder, bounded by a maximum frame size.
///
/// With `automatic_error_handling` enabled the decoder converts its own
/// protocol errors into the matching close frame and goes quiet; disabled
/// (how the upgrader installs it), errors propagate to the pipeline for the
/// dedicated error handler.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    automatic_error_handling: bool,
    failed: bool,
}

impl FrameDecoder {
    /// Creates a decoder enforcing `max_frame_size` on payload lengths.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            automatic_error_handling: false,
            failed: false,
        }
    }

    /// Enables or disables the decoder's own error hook.
    #[must_use]
    pub const fn automatic_error_handling(mut self, enabled: bool) -> Self {
        self.automatic_error_handling = enabled;
        self
    }

    /// Returns the configured maximum frame size.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(FrameError::ReservedBitsSet);
        }
        let opcode = Opcode::from_u8(first & 0x0F)?;

        let masked = second & 0x80 != 0;
        let (header_len, payload_len) = match u64::from(second & 0x7F) {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (4, u64::from(u16::from_be_bytes([src[2], src[3]])))
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (10, u64::from_be_bytes(raw))
            }
            short => (2, short),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlFrameTooLarge(payload_len as usize));
            }
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let payload_len = payload_len as usize;
        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mask_key = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[..4]);
            src.advance(4);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask_key,
            payload: payload.freeze(),
        }))
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if self.failed {
            return Ok(None);
        }
        match self.decode_frame(src) {
            Err(error) if self.automatic_error_handling => {
                tracing::debug!(%error, "frame decode failed, answering with close frame");
                self.failed = true;
                src.clear();
                Ok(Some(close_frame_for(&error)))
            }
            other => other,
        }
    }
}

impl ChannelHandler for ByteToMessageHandler<FrameDecoder> {
    fn name(&self) -> &'static str {
        "ws-frame-decoder"
    }
}

/// Pipeline handler that answers frame codec errors with a close frame.
///
/// Installed by the upgrader right after the decoder when automatic error
/// handling is requested, so malformed frames close the connection without
/// user involvement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolErrorHandler;

impl ProtocolErrorHandler {
    /// Creates a protocol error handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns the close frame answering `error`.
    #[must_use]
    pub fn close_frame_for(&self, error: &FrameError) -> Frame {
        close_frame_for(error)
    }
}

impl ChannelHandler for ProtocolErrorHandler {
    fn name(&self) -> &'static str {
        "ws-protocol-error-handler"
    }
}
