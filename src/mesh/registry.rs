//! Peer registry
//!
//! The only writer of `PeerNode` records. Entries are created and overwritten
//! solely from received state packets (last write by arrival wins) and are
//! removed destructively once they stop sending. Every read hands out a
//! point-in-time copy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::models::{emit, EventSender, MeshEvent, NodeId, PeerNode};
use super::status::MeshStats;
use crate::gossip::codec::StatePacket;

pub struct PeerRegistry {
    /// Keyed by node id; the map order is the peer-iteration order
    peers: RwLock<BTreeMap<NodeId, PeerNode>>,
    timeout: Duration,
    events: EventSender,
    stats: Arc<MeshStats>,
}

impl PeerRegistry {
    pub fn new(timeout: Duration, events: EventSender, stats: Arc<MeshStats>) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            timeout,
            events,
            stats,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a packet. Returns true when the sender was not known.
    pub async fn upsert(&self, packet: StatePacket) -> bool {
        let now = Instant::now();
        let mut peers = self.peers.write().await;

        if let Some(peer) = peers.get_mut(&packet.node_id) {
            peer.phase = packet.phase;
            peer.coherence = packet.coherence;
            peer.presence = packet.presence;
            peer.signature = packet.signature.clone();
            peer.device_type = packet.device_type().to_string();
            peer.purpose = packet.purpose().to_string();
            peer.position = packet.position();
            peer.sent_at = packet.timestamp;
            peer.last_heartbeat = now;
            peer.packets += 1;
            peer.active = true;

            debug!(
                node_id = %packet.node_id,
                phase = %packet.phase,
                coherence = packet.coherence,
                presence = packet.presence,
                "Peer state updated"
            );
            return false;
        }

        let peer = PeerNode {
            node_id: packet.node_id.clone(),
            device_type: packet.device_type().to_string(),
            purpose: packet.purpose().to_string(),
            phase: packet.phase,
            coherence: packet.coherence,
            presence: packet.presence,
            signature: packet.signature.clone(),
            position: packet.position(),
            sent_at: packet.timestamp,
            last_heartbeat: now,
            packets: 1,
            active: true,
        };
        peers.insert(packet.node_id.clone(), peer);
        drop(peers);

        self.stats.record_discovery();
        info!(
            node_id = %packet.node_id,
            device_type = %packet.device_type(),
            purpose = %packet.purpose(),
            "Peer discovered"
        );
        emit(&self.events, MeshEvent::PeerDiscovered { node_id: packet.node_id });
        true
    }

    /// Peers heard from within the configured timeout
    pub async fn active_peers(&self) -> Vec<PeerNode> {
        self.active_peers_within(self.timeout).await
    }

    /// Peers whose last heartbeat is younger than `timeout`
    pub async fn active_peers_within(&self, timeout: Duration) -> Vec<PeerNode> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| now.duration_since(p.last_heartbeat) < timeout)
            .cloned()
            .map(|mut p| {
                p.active = true;
                p
            })
            .collect()
    }

    /// Every known peer, active or not, with its activity flag refreshed
    pub async fn all_peers(&self) -> Vec<PeerNode> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        peers
            .values()
            .cloned()
            .map(|mut p| {
                p.active = now.duration_since(p.last_heartbeat) < self.timeout;
                p
            })
            .collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerNode> {
        self.peers.read().await.get(node_id).cloned()
    }

    /// Number of known peers, including stale ones not yet evicted
    pub async fn total_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Remove peers silent for `timeout` or longer. Returns the evicted ids.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut peers = self.peers.write().await;

        let stale: Vec<NodeId> = peers
            .values()
            .filter(|p| now.duration_since(p.last_heartbeat) >= timeout)
            .map(|p| p.node_id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        drop(peers);

        for id in &stale {
            info!(node_id = %id, timeout_secs = timeout.as_secs_f64(), "Peer evicted");
            emit(&self.events, MeshEvent::PeerLost { node_id: id.clone() });
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::models::EVENT_CHANNEL_CAPACITY;
    use crate::mesh::phase::Phase;
    use tokio::sync::broadcast;

    fn registry() -> (PeerRegistry, broadcast::Receiver<MeshEvent>, Arc<MeshStats>) {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stats = Arc::new(MeshStats::default());
        let registry = PeerRegistry::new(Duration::from_secs(30), tx, stats.clone());
        (registry, rx, stats)
    }

    fn packet(id: &str, coherence: f64) -> StatePacket {
        StatePacket::new(id, Phase::Hold, coherence, 0.5, "sig", 1.0)
    }

    fn discoveries(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<NodeId> {
        let mut found = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MeshEvent::PeerDiscovered { node_id } = event {
                found.push(node_id);
            }
        }
        found
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sight_discovers_then_overwrites() {
        let (registry, mut rx, stats) = registry();

        assert!(registry.upsert(packet("a", 0.4)).await);
        assert!(!registry.upsert(packet("a", 0.9)).await);

        let peer = registry.get("a").await.unwrap();
        assert_eq!(peer.coherence, 0.9);
        assert_eq!(peer.packets, 2);
        assert_eq!(discoveries(&mut rx), vec!["a".to_string()]);
        assert_eq!(stats.snapshot().discoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_by_arrival_wins() {
        let (registry, _rx, _) = registry();

        let mut newer = packet("a", 0.9);
        newer.timestamp = 200.0;
        let mut older = packet("a", 0.2);
        older.timestamp = 100.0;

        registry.upsert(newer).await;
        registry.upsert(older).await;

        // Arrival order, not producer timestamp
        assert_eq!(registry.get("a").await.unwrap().coherence, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_peers_respects_timeout() {
        let (registry, _rx, _) = registry();
        registry.upsert(packet("a", 0.5)).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        registry.upsert(packet("b", 0.5)).await;
        tokio::time::advance(Duration::from_secs(15)).await;

        let active: Vec<NodeId> = registry
            .active_peers()
            .await
            .into_iter()
            .map(|p| p.node_id)
            .collect();
        assert_eq!(active, vec!["b".to_string()]);

        let all = registry.all_peers().await;
        assert_eq!(all.len(), 2);
        assert!(!all.iter().find(|p| p.node_id == "a").unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_and_rediscovery() {
        let (registry, mut rx, stats) = registry();
        registry.upsert(packet("a", 0.5)).await;
        registry.upsert(packet("b", 0.5)).await;
        discoveries(&mut rx);

        tokio::time::advance(Duration::from_secs(10)).await;
        registry.upsert(packet("b", 0.5)).await;
        tokio::time::advance(Duration::from_secs(25)).await;

        let evicted = registry.evict_stale(Duration::from_secs(30)).await;
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(registry.get("a").await.is_none());
        assert!(registry.active_peers().await.iter().all(|p| p.node_id != "a"));

        // A returning peer is new again
        assert!(registry.upsert(packet("a", 0.5)).await);
        assert_eq!(discoveries(&mut rx), vec!["a".to_string()]);
        assert_eq!(stats.snapshot().discoveries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_copies() {
        let (registry, _rx, _) = registry();
        registry.upsert(packet("a", 0.5)).await;

        let mut copy = registry.get("a").await.unwrap();
        copy.coherence = 0.0;

        assert_eq!(registry.get("a").await.unwrap().coherence, 0.5);
    }
}
