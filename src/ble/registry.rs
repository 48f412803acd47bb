use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::radio::ConnectionHandle;

pub const UNKNOWN_PEER_NAME: &str = "Unknown device";

/// Locally assigned identity of a discovered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(Uuid);

impl PeerKey {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub key: PeerKey,
    pub name: String,
    pub address: Option<String>,
    pub rssi: Option<i16>,
    pub handle: ConnectionHandle,
}

/// Arena of discovered peers, the only owner of peer records
///
/// Everything else refers to a peer by [`PeerKey`]. Keys stay stable across
/// repeated advertisements of the same handle until the registry is cleared.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerKey, DiscoveredPeer>,
    by_handle: HashMap<ConnectionHandle, PeerKey>,
}

impl PeerRegistry {
    /// Records an advertisement, returning the updated entry
    pub fn upsert(
        &mut self,
        handle: ConnectionHandle,
        name: Option<String>,
        address: Option<String>,
        rssi: Option<i16>,
    ) -> DiscoveredPeer {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_PEER_NAME.to_string());

        let key = *self
            .by_handle
            .entry(handle.clone())
            .or_insert_with(PeerKey::generate);

        let peer = DiscoveredPeer {
            key,
            name,
            address,
            rssi,
            handle,
        };
        self.peers.insert(key, peer.clone());
        peer
    }

    pub fn get(&self, key: PeerKey) -> Option<&DiscoveredPeer> {
        self.peers.get(&key)
    }

    pub fn key_for(&self, handle: &ConnectionHandle) -> Option<PeerKey> {
        self.by_handle.get(handle).copied()
    }

    pub fn find_by_address(&self, address: &str) -> Option<&DiscoveredPeer> {
        self.peers.values().find(|peer| {
            peer.address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(address))
        })
    }

    /// Snapshot sorted by signal strength, strongest first
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.by_handle.clear();
    }
}
