//! Binary frame protocol with length-prefixed payloads
//!
//! Frame format:
//! ```text
//! +---------------+------------------+
//! | length        | payload          |
//! | (4 bytes, BE) | (length bytes)   |
//! +---------------+------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ChatError, Result};

/// Frame header size: 4 byte big-endian length
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum frame payload size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame around the given payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame into a buffer
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            ChatError::protocol(format!(
                "Frame payload too large: {} bytes",
                self.payload.len()
            ))
        })?;
        buf.reserve(self.encoded_size());
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode this frame into a new Bytes
    pub fn encode_to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Where the decoder is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the 4 byte length prefix
    AwaitingLength,
    /// Length known, waiting for the payload
    AwaitingPayload(usize),
}

/// Streaming frame decoder.
///
/// The decoder does not own any bytes. Each call looks at the caller's unread
/// bytes and reports how many it consumed, so the caller decides when to
/// drop them. The length prefix is consumed as soon as it is complete, even if
/// the payload is still missing.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::AwaitingLength,
            max_frame_size,
        }
    }

    /// Try to decode the next frame from `src`.
    ///
    /// Returns the number of bytes consumed from the front of `src` and the
    /// payload if a whole frame was available. An oversized length prefix is
    /// an error; the stream cannot be resynchronised after it.
    pub fn next_frame<'a>(&mut self, src: &'a [u8]) -> Result<(usize, Option<&'a [u8]>)> {
        let mut consumed = 0;

        let expected = match self.state {
            DecodeState::AwaitingPayload(len) => len,
            DecodeState::AwaitingLength => {
                if src.len() < FRAME_HEADER_SIZE {
                    return Ok((0, None));
                }
                let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                if len > self.max_frame_size {
                    return Err(ChatError::protocol(format!(
                        "Frame payload too large: {} bytes (max: {})",
                        len, self.max_frame_size
                    )));
                }
                consumed = FRAME_HEADER_SIZE;
                self.state = DecodeState::AwaitingPayload(len);
                len
            }
        };

        let rest = &src[consumed..];
        if rest.len() < expected {
            return Ok((consumed, None));
        }

        self.state = DecodeState::AwaitingLength;
        Ok((consumed + expected, Some(&rest[..expected])))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}
