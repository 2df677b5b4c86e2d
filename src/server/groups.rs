//! Group management for the chat server
//!
//! This module handles server-side group state and member tracking. Groups
//! are created on request and live for the lifetime of the server; members
//! are display names and are dropped when their connection goes away.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// A chat group
#[derive(Debug)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Member display names
    members: RwLock<HashSet<String>>,
}

impl Group {
    /// Create a new, empty group
    pub fn new(name: String) -> Self {
        Self {
            name,
            members: RwLock::new(HashSet::new()),
        }
    }

    /// Add a member; false if already present
    pub fn add_member(&self, member: &str) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        members.insert(member.to_string())
    }

    /// Remove a member; false if absent
    pub fn remove_member(&self, member: &str) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        members.remove(member)
    }

    /// Check if a user is a member
    pub fn is_member(&self, member: &str) -> bool {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        members.contains(member)
    }

    /// Copy of the member set
    pub fn members(&self) -> HashSet<String> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        members.clone()
    }
}

/// Registry of all groups
#[derive(Debug, Default)]
pub struct GroupRegistry {
    /// All groups indexed by name
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    /// Create a new group registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group; false if the name is blank or taken
    pub fn create_group(&self, name: &str) -> bool {
        if name.trim().is_empty() {
            return false;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.contains_key(name) {
            return false;
        }
        groups.insert(name.to_string(), Arc::new(Group::new(name.to_string())));
        true
    }

    /// Get a group by name
    pub fn get_group(&self, name: &str) -> Option<Arc<Group>> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get_group(name).is_some()
    }

    /// Add `member` to `group_name`.
    ///
    /// False when the group does not exist or `member` already belongs to it.
    pub fn join_group(&self, group_name: &str, member: &str) -> bool {
        match self.get_group(group_name) {
            Some(group) => group.add_member(member),
            None => false,
        }
    }

    /// Check if `member` belongs to `group_name`
    pub fn is_member(&self, group_name: &str, member: &str) -> bool {
        self.get_group(group_name)
            .map(|group| group.is_member(member))
            .unwrap_or(false)
    }

    /// Snapshot of the members of `group_name`; empty if it does not exist
    pub fn members_of(&self, group_name: &str) -> HashSet<String> {
        self.get_group(group_name)
            .map(|group| group.members())
            .unwrap_or_default()
    }

    /// Remove `member` from every group (e.g., on disconnect).
    ///
    /// Returns the names of the groups it was removed from.
    pub fn remove_member_everywhere(&self, member: &str) -> Vec<String> {
        let groups: Vec<Arc<Group>> = {
            let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
            groups.values().cloned().collect()
        };

        groups
            .into_iter()
            .filter(|group| group.remove_member(member))
            .map(|group| group.name.clone())
            .collect()
    }

    /// Get group count
    pub fn group_count(&self) -> usize {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_group_creation() {
        let registry = GroupRegistry::new();
        assert!(registry.create_group("g1"));
        assert!(registry.exists("g1"));
        assert!(registry.get_group("g1").unwrap().members().is_empty());

        // Duplicate and blank names
        assert!(!registry.create_group("g1"));
        assert!(!registry.create_group(""));
        assert!(!registry.create_group("  "));
        assert_eq!(registry.group_count(), 1);
    }

    #[test]
    fn test_join_group() {
        let registry = GroupRegistry::new();
        registry.create_group("g1");

        assert!(registry.join_group("g1", "alice"));
        assert!(registry.is_member("g1", "alice"));

        // Already a member and unknown group both fail
        assert!(!registry.join_group("g1", "alice"));
        assert!(!registry.join_group("nope", "alice"));
        assert!(!registry.is_member("nope", "alice"));
    }

    #[test]
    fn test_members_snapshot_is_detached() {
        let registry = GroupRegistry::new();
        registry.create_group("g1");
        registry.join_group("g1", "alice");
        registry.join_group("g1", "bob");

        let snapshot = registry.members_of("g1");
        registry.join_group("g1", "carol");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.members_of("g1").len(), 3);
        assert!(registry.members_of("missing").is_empty());
    }

    #[test]
    fn test_remove_member_everywhere() {
        let registry = GroupRegistry::new();
        registry.create_group("g1");
        registry.create_group("g2");
        registry.create_group("g3");
        registry.join_group("g1", "bob");
        registry.join_group("g2", "bob");
        registry.join_group("g2", "alice");

        let mut removed_from = registry.remove_member_everywhere("bob");
        removed_from.sort();
        assert_eq!(removed_from, vec!["g1", "g2"]);

        assert!(!registry.is_member("g1", "bob"));
        assert!(!registry.is_member("g2", "bob"));
        assert!(registry.is_member("g2", "alice"));

        // Groups themselves survive
        assert_eq!(registry.group_count(), 3);
        assert!(registry.exists("g1") && registry.exists("g3"));
    }

    #[test]
    fn test_concurrent_create_is_exclusive() {
        let registry = Arc::new(GroupRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.create_group("race"))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
