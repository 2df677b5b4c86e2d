//! Protocol layer for the chat server
//!
//! This module provides:
//! - Length-prefixed frame encoding/decoding
//! - The `Message` record and its kinds
//! - The JSON codec between the two

pub mod codec;
pub mod frame;
pub mod message;

// Re-export commonly used types
pub use codec::{decode_payload, encode, MessageCodec};
pub use frame::{Frame, FrameDecoder, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{Destination, Message, MessageKind, SERVER_SENDER};
