//! In-memory registries the relay consults while dispatching.
//!
//! `NodeRegistry` is what the `Servers` gossip snapshots; `UsernameRegistry`
//! enforces one live connection per username.

use std::collections::HashMap;

use super::packet::ServerEntry;

/// Known relay nodes: origin id → reachable address. Last writer wins, so a
/// node that reconnects from a new address simply overwrites itself.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, id: impl Into<String>, location: impl Into<String>) {
        self.nodes.insert(id.into(), location.into());
    }

    pub fn location_of(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).map(String::as_str)
    }

    /// Full snapshot for gossip, sorted by id so repeated snapshots of the
    /// same state compare equal.
    pub fn snapshot(&self) -> Vec<ServerEntry> {
        let mut entries: Vec<ServerEntry> = self
            .nodes
            .iter()
            .map(|(id, location)| ServerEntry {
                id: id.clone(),
                location: location.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Live username claims: username → claiming origin. A name stays taken
/// until the claimant leaves.
#[derive(Debug, Default)]
pub struct UsernameRegistry {
    bindings: HashMap<String, String>,
}

impl UsernameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a username for `origin`. Returns false if the name is already
    /// bound (even to the same origin — a reconnect must release first).
    pub fn claim(&mut self, username: &str, origin: &str) -> bool {
        if self.bindings.contains_key(username) {
            return false;
        }
        self.bindings.insert(username.to_owned(), origin.to_owned());
        true
    }

    /// Releases a username, returning the origin that held it.
    pub fn release(&mut self, username: &str) -> Option<String> {
        self.bindings.remove(username)
    }

    pub fn origin_of(&self, username: &str) -> Option<&str> {
        self.bindings.get(username).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
