//! Peer registry for tracking soft-state liveness.
//!
//! Provides `PeerRegistry` for tracking when each peer was first and last heard
//! from, and `PeerRecord` for the per-peer metadata. Each node role owns its
//! own registry instance; nothing here is process-global.
//!
//! Timestamps are passed in by the caller (ms since epoch) so tests can drive
//! expiry without sleeping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

/// Identity of a peer within one registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PeerKey {
    /// Keyed by host alone (the master's view of relays).
    Address { address: IpAddr },
    /// Keyed by host and port (a relay's view of local service nodes).
    Endpoint { address: SocketAddr },
}

impl PeerKey {
    pub fn host(ip: IpAddr) -> Self {
        PeerKey::Address { address: ip }
    }

    pub fn endpoint(addr: SocketAddr) -> Self {
        PeerKey::Endpoint { address: addr }
    }

    /// Address datagrams to this peer should go to, when the key pins a port.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerKey::Address { .. } => None,
            PeerKey::Endpoint { address } => Some(*address),
        }
    }
}

/// Tracked state for a peer in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub key: PeerKey,
    /// When first heard from (ms since epoch)
    pub connected_at_ms: u64,
    /// When last heard from (ms since epoch)
    pub last_heartbeat_ms: u64,
}

/// Outcome of [`PeerRegistry::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted(PeerRecord),
    Refreshed(PeerRecord),
}

impl Upsert {
    pub fn is_new(&self) -> bool {
        matches!(self, Upsert::Inserted(_))
    }

    pub fn record(&self) -> &PeerRecord {
        match self {
            Upsert::Inserted(record) | Upsert::Refreshed(record) => record,
        }
    }
}

/// Registry of peers heard from recently.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` for shared ownership.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerKey, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record inbound traffic from `key`.
    ///
    /// Unknown peers are inserted with both timestamps set to `now_ms`. Known
    /// peers only get `last_heartbeat_ms` advanced.
    pub fn upsert(&self, key: PeerKey, now_ms: u64) -> Upsert {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(record) = peers.get_mut(&key) {
            record.last_heartbeat_ms = record.last_heartbeat_ms.max(now_ms);
            return Upsert::Refreshed(record.clone());
        }

        let record = PeerRecord {
            key: key.clone(),
            connected_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
        };
        peers.insert(key, record.clone());
        Upsert::Inserted(record)
    }

    /// Remove a peer. Unknown keys are a no-op.
    pub fn remove(&self, key: &PeerKey) -> Option<PeerRecord> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    /// Remove and return every peer silent for longer than `max_silence`.
    pub fn expire_older_than(&self, max_silence: Duration, now_ms: u64) -> Vec<PeerRecord> {
        let max_silence_ms = max_silence.as_millis() as u64;
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());

        let stale: Vec<PeerKey> = peers
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_heartbeat_ms) > max_silence_ms)
            .map(|p| p.key.clone())
            .collect();

        let mut expired: Vec<PeerRecord> =
            stale.iter().filter_map(|key| peers.remove(key)).collect();
        expired.sort_by(|a, b| a.key.cmp(&b.key));
        expired
    }

    /// Snapshot of all peers, oldest connection first.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| {
            a.connected_at_ms
                .cmp(&b.connected_at_ms)
                .then_with(|| a.key.cmp(&b.key))
        });
        peers
    }

    pub fn get(&self, key: &PeerKey) -> Option<PeerRecord> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed the registry from persisted records. Existing entries win.
    pub fn restore(&self, records: impl IntoIterator<Item = PeerRecord>) -> usize {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut restored = 0;
        for record in records {
            if !peers.contains_key(&record.key) {
                peers.insert(record.key.clone(), record);
                restored += 1;
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(last_octet: u8) -> PeerKey {
        PeerKey::host(IpAddr::from([10, 0, 0, last_octet]))
    }

    fn service(port: u16) -> PeerKey {
        PeerKey::endpoint(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    // ==================== Upsert ====================

    #[test]
    fn test_upsert_inserts_new_peer() {
        let registry = PeerRegistry::new();

        let outcome = registry.upsert(relay(1), 1000);

        assert!(outcome.is_new());
        assert_eq!(outcome.record().connected_at_ms, 1000);
        assert_eq!(outcome.record().last_heartbeat_ms, 1000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_is_idempotent_on_identity() {
        let registry = PeerRegistry::new();

        registry.upsert(relay(1), 1000);
        let outcome = registry.upsert(relay(1), 5000);

        assert!(!outcome.is_new());
        assert_eq!(outcome.record().connected_at_ms, 1000);
        assert_eq!(outcome.record().last_heartbeat_ms, 5000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_never_moves_heartbeat_backwards() {
        let registry = PeerRegistry::new();

        registry.upsert(relay(1), 5000);
        registry.upsert(relay(1), 3000);

        assert_eq!(registry.get(&relay(1)).unwrap().last_heartbeat_ms, 5000);
    }

    #[test]
    fn test_endpoint_keys_distinguish_ports() {
        let registry = PeerRegistry::new();

        registry.upsert(service(4000), 1);
        registry.upsert(service(4001), 1);

        assert_eq!(registry.len(), 2);
    }

    // ==================== Remove ====================

    #[test]
    fn test_remove_known_and_unknown() {
        let registry = PeerRegistry::new();
        registry.upsert(relay(1), 1000);

        assert!(registry.remove(&relay(1)).is_some());
        assert!(registry.remove(&relay(1)).is_none());
        assert!(registry.remove(&relay(2)).is_none());
        assert!(registry.is_empty());
    }

    // ==================== Expiry ====================

    #[test]
    fn test_expire_removes_only_stale_peers() {
        let registry = PeerRegistry::new();
        registry.upsert(relay(1), 0);
        registry.upsert(relay(2), 0);
        registry.upsert(relay(2), 9_000);

        let expired = registry.expire_older_than(Duration::from_secs(5), 10_000);

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, relay(1));
        assert!(registry.contains(&relay(2)));
        assert!(!registry.contains(&relay(1)));
    }

    #[test]
    fn test_expire_threshold_is_strict() {
        let registry = PeerRegistry::new();
        registry.upsert(relay(1), 0);

        assert!(registry.expire_older_than(Duration::from_secs(5), 5_000).is_empty());
        assert_eq!(registry.expire_older_than(Duration::from_secs(5), 5_001).len(), 1);
    }

    // ==================== Listing & restore ====================

    #[test]
    fn test_list_ordered_by_connection_time() {
        let registry = PeerRegistry::new();
        registry.upsert(relay(3), 300);
        registry.upsert(relay(1), 100);
        registry.upsert(relay(2), 200);

        let keys: Vec<PeerKey> = registry.list().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![relay(1), relay(2), relay(3)]);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = PeerRegistry::new();
        registry.upsert(relay(1), 100);

        let snapshot = registry.list();
        registry.remove(&relay(1));

        assert_eq!(snapshot.len(), 1);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_restore_keeps_live_entries() {
        let registry = PeerRegistry::new();
        registry.upsert(relay(1), 900);

        let restored = registry.restore(vec![
            PeerRecord {
                key: relay(1),
                connected_at_ms: 1,
                last_heartbeat_ms: 1,
            },
            PeerRecord {
                key: relay(2),
                connected_at_ms: 2,
                last_heartbeat_ms: 2,
            },
        ]);

        assert_eq!(restored, 1);
        assert_eq!(registry.get(&relay(1)).unwrap().connected_at_ms, 900);
        assert_eq!(registry.get(&relay(2)).unwrap().connected_at_ms, 2);
    }

    #[test]
    fn test_record_json_schema() {
        let record = PeerRecord {
            key: service(4000),
            connected_at_ms: 1,
            last_heartbeat_ms: 2,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "key": {"kind": "endpoint", "address": "127.0.0.1:4000"},
                "connectedAtMs": 1,
                "lastHeartbeatMs": 2
            })
        );

        let back: PeerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
