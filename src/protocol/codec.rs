//! Codec for encoding/decoding messages to/from frames
//!
//! This module provides the bridge between `Message` values and binary
//! frames. Payloads are JSON.

use bytes::Bytes;
use tracing::warn;

use super::frame::{Frame, FrameDecoder};
use super::message::Message;
use crate::error::{ChatError, Result};
use crate::transport::buffer::ReadBuffer;

/// Encode a message payload
pub fn encode_payload(message: &Message) -> Result<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ChatError::serialization(format!("Failed to encode message: {}", e)))
}

/// Decode a message payload
pub fn decode_payload(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload)
        .map_err(|e| ChatError::serialization(format!("Malformed message payload: {}", e)))
}

/// Encode a message directly to frame bytes (convenience function)
pub fn encode(message: &Message) -> Result<Bytes> {
    Frame::new(encode_payload(message)?).encode_to_bytes()
}

/// Streaming message decoder for one connection
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    decoder: FrameDecoder,
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_frame_size),
        }
    }

    /// Try to decode the next message from `buf`.
    ///
    /// Consumed bytes are dropped from `buf`. A `Serialization` error means
    /// one malformed frame was discarded and decoding can continue; any other
    /// error is fatal for the stream.
    pub fn decode_next(&mut self, buf: &mut ReadBuffer) -> Result<Option<Message>> {
        let (consumed, payload) = self.decoder.next_frame(buf.unread())?;
        let decoded = payload.map(decode_payload);
        buf.consume(consumed);
        decoded.transpose()
    }

    /// Decode every complete message currently in `buf` into `out`.
    ///
    /// Malformed frames are logged and skipped. Returns the number of
    /// messages appended, or the first fatal error.
    pub fn decode_all(&mut self, buf: &mut ReadBuffer, out: &mut Vec<Message>) -> Result<usize> {
        let before = out.len();
        loop {
            match self.decode_next(buf) {
                Ok(Some(message)) => out.push(message),
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!("Discarding frame: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out.len() - before)
    }
}
