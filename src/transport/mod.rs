//! Transport layer for non-blocking TCP connections
//!
//! This module provides:
//! - Inbound byte accumulation and outbound frame queues
//! - Per-socket connection state driven by the reactor

pub mod buffer;
pub mod connection;

// Re-export commonly used types
pub use buffer::{FlushStatus, ReadBuffer, WriteQueue};
pub use connection::{Connection, ConnectionId, ConnectionLimits, ConnectionState};
