//! Codec traits and the byte-to-message pipeline adapter.
//!
//! `Decoder` and `Encoder` form the sans-io seam between wire bytes and
//! protocol messages. [`ByteToMessageHandler`] wraps a decoder in a read
//! buffer so a pipeline can feed it raw byte chunks and drain complete
//! messages.

use bytes::BytesMut;
use std::io;

/// Decodes frames out of an accumulating byte buffer.
///
/// `decode` consumes as much of `src` as one item needs. Returning
/// `Ok(None)` signals that more bytes are required; the caller keeps the
/// remaining buffer and retries after the next read.
pub trait Decoder {
    /// The message type produced.
    type Item;
    /// The decode error type.
    type Error: From<io::Error>;

    /// Attempts to decode a single item from `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error>;
}

/// Encodes messages into an output byte buffer.
pub trait Encoder<Item> {
    /// The encode error type.
    type Error: From<io::Error>;

    /// Appends the wire representation of `item` to `dst`.
    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}

/// Buffering adapter that turns byte chunks into decoded messages.
///
/// This is the pipeline-facing wrapper for inbound codecs: bytes go in via
/// [`feed`](Self::feed), every message that became complete comes out.
#[derive(Debug)]
pub struct ByteToMessageHandler<D> {
    decoder: D,
    buffer: BytesMut,
}

impl<D: Decoder> ByteToMessageHandler<D> {
    /// Wraps a decoder with an empty read buffer.
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            buffer: BytesMut::new(),
        }
    }

    /// Appends `bytes` to the read buffer and drains every decodable
    /// message.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<D::Item>, D::Error> {
        self.buffer.extend_from_slice(bytes);
        let mut items = Vec::new();
        while let Some(item) = self.decoder.decode(&mut self.buffer)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Returns the wrapped decoder.
    pub const fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Returns the number of buffered, not-yet-decodable bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy codec: one item per 4-byte big-endian u32.
    struct U32Codec;

    impl Decoder for U32Codec {
        type Item = u32;
        type Error = io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<u32>, io::Error> {
            if src.len() < 4 {
                return Ok(None);
            }
            let raw = src.split_to(4);
            Ok(Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])))
        }
    }

    #[test]
    fn feed_drains_complete_items() {
        let mut handler = ByteToMessageHandler::new(U32Codec);
        let items = handler.feed(&[0, 0, 0, 1, 0, 0, 0, 2]).unwrap();
        assert_eq!(items, [1, 2]);
        assert_eq!(handler.buffered(), 0);
    }

    #[test]
    fn partial_input_is_buffered() {
        let mut handler = ByteToMessageHandler::new(U32Codec);
        assert!(handler.feed(&[0, 0]).unwrap().is_empty());
        assert_eq!(handler.buffered(), 2);
        let items = handler.feed(&[0, 7]).unwrap();
        assert_eq!(items, [7]);
    }
}
