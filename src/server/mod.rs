//! Chat server built on a single-threaded readiness reactor
//!
//! ## Layout
//!
//! - **Reactor**: owns the listener, every client socket and the poller
//! - **Router**: applies one decoded message to the registries and queues replies
//! - **Client registry**: display name to connection bindings
//! - **Group registry**: named groups and their members

pub mod groups;
pub mod reactor;
pub mod registry;
pub mod router;

pub use groups::{Group, GroupRegistry};
pub use reactor::{ChatServer, ServerConfig, ShutdownHandle};
pub use registry::ClientRegistry;
pub use router::{Disposition, Outbox, Router};
