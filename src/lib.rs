//! Length-prefixed TCP chat server
//!
//! This library provides a chat server driven by a single-threaded readiness
//! reactor. Clients log in under a unique display name, exchange direct and
//! group messages, create and join groups, and transfer files that the server
//! stores before forwarding. Every message is a JSON record framed by a
//! 4-byte big-endian length.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transport;

pub use client::{ChatClient, ClientConfig, ClientEvent};
pub use error::{ChatError, Result};
pub use protocol::{Message, MessageKind};
pub use server::{ChatServer, ServerConfig, ShutdownHandle};
pub use store::{DiskFileStore, FileStore, MemoryFileStore};

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique message ID
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
