//! WebSocket protocol support (RFC 6455).
//!
//! Two layers live here:
//!
//! - [`frame`]: the server-role wire codec, frame encoder/decoder plus the
//!   protocol-error handler that answers malformed input with the right
//!   close frame.
//! - [`upgrade`]: the server-side upgrade engine that validates the HTTP/1.1
//!   handshake, derives the accept token, and installs the frame codecs on
//!   the channel pipeline.

mod frame;
mod upgrade;

pub use frame::{
    close_frame_for, Frame, FrameDecoder, FrameEncoder, FrameError, Opcode, ProtocolErrorHandler,
};
pub use upgrade::{accept_key, ServerUpgrader, UpgradeError, DEFAULT_MAX_FRAME_SIZE};
