//! Shared table of currently known peers.
//!
//! Written by the discovery client, read by the session layer and the UI.
//! All accessors take snapshots; the lock is never held across await
//! points.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::network::discovery::protocol::PeerInfo;

/// Thread-safe nickname -> [`PeerInfo`] map. Cloning shares the table.
#[derive(Clone, Default)]
pub struct PeerTable {
    inner: Arc<RwLock<HashMap<String, PeerInfo>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `info.nickname`.
    pub fn insert(&self, info: PeerInfo) {
        let mut map = self.inner.write().expect("peer table lock poisoned");
        map.insert(info.nickname.clone(), info);
    }

    /// Remove and return the entry for `nickname`.
    pub fn remove(&self, nickname: &str) -> Option<PeerInfo> {
        let mut map = self.inner.write().expect("peer table lock poisoned");
        map.remove(nickname)
    }

    /// Snapshot of one entry.
    pub fn get(&self, nickname: &str) -> Option<PeerInfo> {
        let map = self.inner.read().expect("peer table lock poisoned");
        map.get(nickname).cloned()
    }

    /// Snapshot of all entries.
    pub fn all(&self) -> Vec<PeerInfo> {
        let map = self.inner.read().expect("peer table lock poisoned");
        map.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().expect("peer table lock poisoned");
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::KeyId;

    fn peer(nickname: &str, seed: u8) -> PeerInfo {
        PeerInfo {
            nickname: nickname.to_string(),
            node_id: iroh::SecretKey::from_bytes(&[seed; 32]).public(),
            addresses: vec![],
            kem_public: [seed; 32],
            key_id: KeyId::from_bytes([seed; 8]),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let table = PeerTable::new();
        assert!(table.is_empty());

        table.insert(peer("alice", 1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("alice").unwrap().nickname, "alice");
        assert!(table.get("bob").is_none());

        let removed = table.remove("alice").unwrap();
        assert_eq!(removed.nickname, "alice");
        assert!(table.is_empty());
        assert!(table.remove("alice").is_none());
    }

    #[test]
    fn test_insert_replaces() {
        let table = PeerTable::new();
        table.insert(peer("alice", 1));

        let mut updated = peer("alice", 1);
        updated.addresses = vec!["127.0.0.1:1234".to_string()];
        table.insert(updated);

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get("alice").unwrap().addresses,
            vec!["127.0.0.1:1234".to_string()]
        );
    }

    #[test]
    fn test_clones_share_state() {
        let table = PeerTable::new();
        let other = table.clone();

        table.insert(peer("alice", 1));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_all_snapshots() {
        let table = PeerTable::new();
        table.insert(peer("alice", 1));
        table.insert(peer("bob", 2));

        let mut nicknames: Vec<String> =
            table.all().into_iter().map(|p| p.nickname).collect();
        nicknames.sort();
        assert_eq!(nicknames, vec!["alice", "bob"]);
    }
}
