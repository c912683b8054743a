//! Name-based addressing for direct one-to-one calls.
//!
//! A connection may register a display name; others can then call it by that
//! name instead of meeting in a room. Calls still travel over the relay.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signaling::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: ConnectionId,
    pub name: String,
}

#[derive(Default)]
pub struct Directory {
    // Registration order, so listings are stable.
    entries: RwLock<Vec<DirectoryEntry>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `name` to `id`, replacing any name `id` held before.
    pub fn register(&self, id: &ConnectionId, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Signaling("name must not be empty".to_string()));
        }

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == name && &e.id != id) {
            return Err(Error::NameTaken(name.to_string()));
        }
        match entries.iter_mut().find(|e| &e.id == id) {
            Some(entry) => entry.name = name.to_string(),
            None => entries.push(DirectoryEntry {
                id: id.clone(),
                name: name.to_string(),
            }),
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<ConnectionId> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name.trim())
            .map(|e| e.id.clone())
            .ok_or_else(|| Error::UnknownName(name.to_string()))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().iter().any(|e| &e.id == id)
    }

    pub fn remove(&self, id: &ConnectionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| &e.id != id);
        entries.len() != before
    }

    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_among_live_connections() {
        let directory = Directory::new();
        let alice = ConnectionId::generate();
        let bob = ConnectionId::generate();

        directory.register(&alice, "alice").unwrap();
        assert!(matches!(
            directory.register(&bob, "alice"),
            Err(Error::NameTaken(_))
        ));

        directory.remove(&alice);
        directory.register(&bob, "alice").unwrap();
        assert_eq!(directory.resolve("alice").unwrap(), bob);
    }

    #[test]
    fn reregistering_renames() {
        let directory = Directory::new();
        let alice = ConnectionId::generate();
        directory.register(&alice, "alice").unwrap();
        directory.register(&alice, "ally").unwrap();

        assert_eq!(directory.entries().len(), 1);
        assert!(matches!(directory.resolve("alice"), Err(Error::UnknownName(_))));
        assert_eq!(directory.resolve("ally").unwrap(), alice);
    }
}
