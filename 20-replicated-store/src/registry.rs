use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transport::PeerConnection;

/// What a node advertises about itself when joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub is_leader: bool,
}

impl PeerInfo {
    pub fn new(address: impl Into<String>, is_leader: bool) -> Self {
        Self {
            address: address.into(),
            is_leader,
        }
    }
}

struct PeerEntry {
    info: PeerInfo,
    connection: Arc<PeerConnection>,
}

/// Known peers keyed by address, excluding this node.
///
/// Each entry owns a lazily-dialed connection that callers lease by cloning the
/// `Arc`; nothing in the registry points back at this node. Iteration order is
/// address order, which the consistent read tally relies on.
#[derive(Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    /// Inserts or refreshes a peer. Returns `true` when the address was new.
    pub fn insert(&mut self, info: PeerInfo) -> bool {
        if let Some(entry) = self.peers.get_mut(&info.address) {
            entry.info.is_leader = info.is_leader;
            return false;
        }
        let connection = Arc::new(PeerConnection::new(info.address.clone()));
        self.peers
            .insert(info.address.clone(), PeerEntry { info, connection });
        true
    }

    /// Evicts a peer, handing back its connection so the caller can close it.
    pub fn remove(&mut self, address: &str) -> Option<(PeerInfo, Arc<PeerConnection>)> {
        self.peers
            .remove(address)
            .map(|entry| (entry.info, entry.connection))
    }

    pub fn connection(&self, address: &str) -> Option<Arc<PeerConnection>> {
        self.peers
            .get(address)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Connection leases for every peer, in address order.
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Moves the leader flag to `leader`, clearing it everywhere else.
    pub fn set_leader(&mut self, leader: Option<&str>) {
        for (address, entry) in self.peers.iter_mut() {
            entry.info.is_leader = Some(address.as_str()) == leader;
        }
    }

    pub fn leader(&self) -> Option<&str> {
        self.peers
            .values()
            .find(|entry| entry.info.is_leader)
            .map(|entry| entry.info.address.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_new_addresses_only() {
        let mut registry = PeerRegistry::new();
        assert!(registry.insert(PeerInfo::new("b:1", false)));
        assert!(!registry.insert(PeerInfo::new("b:1", true)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.leader(), Some("b:1"));
    }

    #[test]
    fn leader_flag_moves_between_peers() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerInfo::new("a:1", true));
        registry.insert(PeerInfo::new("c:1", false));

        registry.set_leader(Some("c:1"));
        assert_eq!(registry.leader(), Some("c:1"));

        registry.set_leader(None);
        assert_eq!(registry.leader(), None);
    }

    #[test]
    fn removal_returns_the_leased_connection() {
        let mut registry = PeerRegistry::new();
        registry.insert(PeerInfo::new("z:9", false));
        registry.insert(PeerInfo::new("a:9", false));
        assert_eq!(registry.addresses(), vec!["a:9".to_string(), "z:9".to_string()]);

        let (info, connection) = registry.remove("z:9").expect("present");
        assert_eq!(info.address, "z:9");
        assert_eq!(connection.address(), "z:9");
        assert!(!registry.contains("z:9"));
        assert!(registry.remove("z:9").is_none());
    }
}
