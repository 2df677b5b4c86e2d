//! Registry of logged-in clients
//!
//! Maps display names to the connection serving them. This is the only place
//! that answers "is this name online".

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::transport::connection::ConnectionId;

/// Whether `name` can be bound at all
pub fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty()
}

/// Concurrent display name -> connection map
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ConnectionId>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `connection`.
    ///
    /// Fails on a blank name or one that is already bound. The check and the
    /// insert happen under one write lock, so of two racing binds for the
    /// same name exactly one wins.
    pub fn bind(&self, name: &str, connection: ConnectionId) -> bool {
        if !is_valid_name(name) {
            return false;
        }
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.contains_key(name) {
            return false;
        }
        clients.insert(name.to_string(), connection);
        true
    }

    /// Remove `name`; returns the connection it was bound to, if any
    pub fn unbind(&self, name: &str) -> Option<ConnectionId> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Connection currently bound to `name`
    pub fn lookup(&self, name: &str) -> Option<ConnectionId> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Number of bound names
    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = ClientRegistry::new();
        assert!(registry.bind("alice", ConnectionId(7)));
        assert_eq!(registry.lookup("alice"), Some(ConnectionId(7)));
        assert!(registry.is_online("alice"));

        assert_eq!(registry.unbind("alice"), Some(ConnectionId(7)));
        assert!(registry.lookup("alice").is_none());

        // Idempotent
        assert_eq!(registry.unbind("alice"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = ClientRegistry::new();
        assert!(registry.bind("alice", ConnectionId(1)));
        assert!(!registry.bind("alice", ConnectionId(2)));
        assert_eq!(registry.lookup("alice"), Some(ConnectionId(1)));
    }

    #[test]
    fn test_empty_name_never_mutates() {
        let registry = ClientRegistry::new();
        assert!(!registry.bind("", ConnectionId(1)));
        assert!(!registry.bind("   ", ConnectionId(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rebind_after_unbind() {
        let registry = ClientRegistry::new();
        assert!(registry.bind("alice", ConnectionId(1)));
        registry.unbind("alice");
        assert!(registry.bind("alice", ConnectionId(2)));
        assert_eq!(registry.lookup("alice"), Some(ConnectionId(2)));
    }

    #[test]
    fn test_concurrent_bind_is_exclusive() {
        for _ in 0..20 {
            let registry = Arc::new(ClientRegistry::new());
            let barrier = Arc::new(Barrier::new(8));

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        registry.bind("alice", ConnectionId(i))
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert_eq!(registry.len(), 1);
        }
    }
}
