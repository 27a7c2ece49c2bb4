//! Peer Directory & Gossip: the local node record plus `node_id -> PeerNode` for every
//! known peer, kept eventually consistent by a push-pull gossip protocol with TTL-based
//! pruning. A single exclusive lock guards integration and pruning; reads copy snapshots.

pub mod gossip;

use crate::model::{AggregateView, Capacity, PeerNode, PeerStatus, ResourceInfo, ResourceTags};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

pub const DEFAULT_NODE_TTL_S: i64 = 180;

#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    NodeDiscovered(PeerNode),
    NodeLost(String),
}

/// Everything the local node advertises about itself via gossip.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub node_id: String,
    pub name: String,
    pub address: String,
    pub scheduler_address: String,
    pub domain_id: String,
    pub capacity: Capacity,
    pub tags: ResourceTags,
    pub version: u64,
}

impl LocalNode {
    fn to_peer_node(&self, now: DateTime<Utc>) -> PeerNode {
        PeerNode {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            scheduler_address: self.scheduler_address.clone(),
            domain_id: self.domain_id.clone(),
            capacity: self.capacity,
            tags: self.tags,
            status: PeerStatus::Online,
            last_seen: now,
            last_updated: now,
            discovered_at: now,
            source_peer: self.node_id.clone(),
            version: self.version,
            gossip_count: 0,
        }
    }
}

pub struct PeerDirectory {
    local: RwLock<LocalNode>,
    peers: RwLock<HashMap<String, PeerNode>>,
    node_ttl: ChronoDuration,
    events: broadcast::Sender<DirectoryEvent>,
}

impl PeerDirectory {
    pub fn new(local: LocalNode, node_ttl_s: i64) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            local: RwLock::new(local),
            peers: RwLock::new(HashMap::new()),
            node_ttl: ChronoDuration::seconds(node_ttl_s),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    pub async fn local_node_id(&self) -> String {
        self.local.read().await.node_id.clone()
    }

    pub async fn local_snapshot(&self) -> PeerNode {
        let local = self.local.read().await;
        local.to_peer_node(Utc::now())
    }

    /// Advance the local node's own version and refresh its advertised capacity. Only the
    /// owning node may do this; peers never bump a version on another node's behalf.
    pub async fn update_local_capacity(&self, capacity: Capacity, tags: ResourceTags) {
        let mut local = self.local.write().await;
        local.capacity = capacity;
        local.tags = tags;
        local.version += 1;
    }

    /// A compact digest of known peers for the push side of gossip, `{node_id: version}`.
    pub async fn digest(&self) -> HashMap<String, u64> {
        let peers = self.peers.read().await;
        peers.iter().map(|(id, p)| (id.clone(), p.version)).collect()
    }

    /// Apply the integration rule for a single incoming `PeerNode` from source `S`.
    pub async fn integrate(&self, incoming: PeerNode, source_peer: &str) {
        let local_id = self.local.read().await.node_id.clone();
        if incoming.node_id == local_id {
            return;
        }

        let now = Utc::now();
        let mut peers = self.peers.write().await;
        match peers.get_mut(&incoming.node_id) {
            None => {
                let mut record = incoming.clone();
                record.discovered_at = now;
                record.source_peer = source_peer.to_string();
                record.last_seen = now;
                record.last_updated = now;
                peers.insert(incoming.node_id.clone(), record);
                drop(peers);
                debug!("directory: discovered node {}", incoming.node_id);
                let _ = self.events.send(DirectoryEvent::NodeDiscovered(incoming));
            }
            Some(existing) => {
                if incoming.version >= existing.version {
                    existing.capacity = incoming.capacity;
                    existing.tags = incoming.tags;
                    existing.status = incoming.status;
                    existing.address = incoming.address.clone();
                    existing.scheduler_address = incoming.scheduler_address.clone();
                    existing.version = incoming.version;
                    existing.last_updated = now;
                    existing.gossip_count += 1;
                }
                // Bump liveness either way: even a stale (lower-version) incoming record
                // proves the peer is still reachable.
                existing.last_seen = now;
            }
        }
    }

    /// Remove nodes whose `last_seen` exceeds `node_ttl`; fires `node_lost` for each.
    pub async fn prune_stale(&self) -> Vec<String> {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, p)| now - p.last_seen > self.node_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        drop(peers);
        for id in &stale {
            info!("directory: pruning stale node {}", id);
            let _ = self.events.send(DirectoryEvent::NodeLost(id.clone()));
        }
        stale
    }

    fn is_live(&self, peer: &PeerNode, now: DateTime<Utc>) -> bool {
        peer.status == PeerStatus::Online && now - peer.last_seen <= self.node_ttl
    }

    /// Componentwise sum of capacities and OR of tags over local + non-stale online peers.
    pub async fn aggregate_view(&self) -> AggregateView {
        let now = Utc::now();
        let local = self.local.read().await;
        let peers = self.peers.read().await;

        let mut capacity = local.capacity;
        let mut tags = local.tags;
        let mut counts: HashMap<String, u64> = HashMap::new();
        counts.insert("online".to_string(), 1);
        let mut node_count = 1u64;

        for peer in peers.values() {
            let status_key = match peer.status {
                PeerStatus::Online => "online",
                PeerStatus::Offline => "offline",
                PeerStatus::Error => "error",
            };
            *counts.entry(status_key.to_string()).or_insert(0) += 1;
            if self.is_live(peer, now) {
                capacity.total = capacity.total.saturating_add(&peer.capacity.total);
                capacity.used = capacity.used.saturating_add(&peer.capacity.used);
                capacity.available = capacity.available.saturating_add(&peer.capacity.available);
                tags = tags.or(&peer.tags);
                node_count += 1;
            }
        }

        AggregateView {
            capacity,
            tags,
            counts_by_status: counts,
            node_count,
        }
    }

    /// `available >= request` componentwise AND `tags ⊇ required_tags`, ordered by
    /// available CPU descending (ties broken by having a non-empty scheduler address).
    /// Stale or non-online nodes are excluded.
    pub async fn find_available_nodes(&self, request: ResourceInfo, required_tags: ResourceTags) -> Vec<PeerNode> {
        let now = Utc::now();
        let peers = self.peers.read().await;
        let mut candidates: Vec<PeerNode> = peers
            .values()
            .filter(|p| self.is_live(p, now))
            .filter(|p| p.capacity.available.covers(&request))
            .filter(|p| p.tags.satisfies(&required_tags))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.capacity
                .available
                .cpu_mc
                .cmp(&a.capacity.available.cpu_mc)
                .then_with(|| {
                    let a_has = !a.scheduler_address.is_empty();
                    let b_has = !b.scheduler_address.is_empty();
                    b_has.cmp(&a_has)
                })
        });
        candidates
    }

    pub async fn known_peers(&self) -> Vec<PeerNode> {
        self.peers.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalNode {
        LocalNode {
            node_id: "local".to_string(),
            name: "local".to_string(),
            address: "127.0.0.1:7000".to_string(),
            scheduler_address: "127.0.0.1:7100".to_string(),
            domain_id: "dom-a".to_string(),
            capacity: Capacity::from_total(ResourceInfo::new(4000, 4 * 1024 * 1024 * 1024, 0)),
            tags: ResourceTags {
                cpu: true,
                memory: true,
                gpu: false,
                camera: false,
            },
            version: 1,
        }
    }

    fn peer_node(id: &str, version: u64, cpu_avail: i64, last_seen: DateTime<Utc>) -> PeerNode {
        PeerNode {
            node_id: id.to_string(),
            name: id.to_string(),
            address: format!("10.0.0.1:{}", id.len()),
            scheduler_address: "10.0.0.2:7100".to_string(),
            domain_id: "dom-a".to_string(),
            capacity: Capacity {
                total: ResourceInfo::new(cpu_avail, 4 * 1024 * 1024 * 1024, 1),
                used: ResourceInfo::zero(),
                available: ResourceInfo::new(cpu_avail, 4 * 1024 * 1024 * 1024, 1),
            },
            tags: ResourceTags {
                cpu: true,
                memory: true,
                gpu: true,
                camera: false,
            },
            status: PeerStatus::Online,
            last_seen,
            last_updated: last_seen,
            discovered_at: last_seen,
            source_peer: "bootstrap".to_string(),
            version,
            gossip_count: 0,
        }
    }

    #[tokio::test]
    async fn self_records_are_discarded_on_integration() {
        let dir = PeerDirectory::new(local(), DEFAULT_NODE_TTL_S);
        let own = peer_node("local", 5, 1000, Utc::now());
        dir.integrate(own, "somewhere").await;
        assert!(dir.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_peer_is_inserted_and_fires_discovered() {
        let dir = PeerDirectory::new(local(), DEFAULT_NODE_TTL_S);
        let mut rx = dir.subscribe();
        dir.integrate(peer_node("n2", 1, 2000, Utc::now()), "bootstrap").await;
        assert_eq!(dir.known_peers().await.len(), 1);
        let event = rx.try_recv().expect("event emitted");
        assert!(matches!(event, DirectoryEvent::NodeDiscovered(p) if p.node_id == "n2"));
    }

    #[tokio::test]
    async fn lower_incoming_version_is_not_clobbered_but_last_seen_still_bumps() {
        let dir = PeerDirectory::new(local(), DEFAULT_NODE_TTL_S);
        dir.integrate(peer_node("n2", 5, 2000, Utc::now() - ChronoDuration::seconds(30)), "bootstrap").await;
        // Incoming record at a lower version than what we hold (5) must not overwrite capacity.
        dir.integrate(peer_node("n2", 2, 999, Utc::now()), "other-peer").await;
        let peers = dir.known_peers().await;
        let n2 = peers.iter().find(|p| p.node_id == "n2").unwrap();
        assert_eq!(n2.version, 5);
        assert_eq!(n2.capacity.available.cpu_mc, 2000);
    }

    #[tokio::test]
    async fn higher_incoming_version_overwrites_capacity_and_version() {
        let dir = PeerDirectory::new(local(), DEFAULT_NODE_TTL_S);
        dir.integrate(peer_node("n2", 2, 999, Utc::now() - ChronoDuration::seconds(30)), "bootstrap").await;
        // Incoming record at a higher version than what we hold (2) must overwrite capacity.
        dir.integrate(peer_node("n2", 5, 2000, Utc::now()), "other-peer").await;
        let peers = dir.known_peers().await;
        let n2 = peers.iter().find(|p| p.node_id == "n2").unwrap();
        assert_eq!(n2.version, 5);
        assert_eq!(n2.capacity.available.cpu_mc, 2000);
    }

    #[tokio::test]
    async fn stale_peer_is_excluded_from_find_available_nodes() {
        let dir = PeerDirectory::new(local(), 180);
        dir.integrate(peer_node("n_fresh", 1, 3000, Utc::now()), "bootstrap").await;
        dir.integrate(peer_node("n_stale", 1, 3000, Utc::now() - ChronoDuration::seconds(200)), "bootstrap").await;

        let request = ResourceInfo::new(1000, 1024 * 1024 * 1024, 0);
        let candidates = dir.find_available_nodes(request, ResourceTags::default()).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "n_fresh");
    }

    #[tokio::test]
    async fn prune_stale_removes_nodes_past_ttl_and_fires_lost() {
        let dir = PeerDirectory::new(local(), 180);
        dir.integrate(peer_node("n_stale", 1, 3000, Utc::now() - ChronoDuration::seconds(200)), "bootstrap").await;
        let mut rx = dir.subscribe();
        let pruned = dir.prune_stale().await;
        assert_eq!(pruned, vec!["n_stale".to_string()]);
        let event = rx.try_recv().expect("event emitted");
        assert!(matches!(event, DirectoryEvent::NodeLost(id) if id == "n_stale"));
    }

    #[tokio::test]
    async fn aggregate_view_sums_only_live_online_peers() {
        let dir = PeerDirectory::new(local(), 180);
        dir.integrate(peer_node("n_fresh", 1, 3000, Utc::now()), "bootstrap").await;
        dir.integrate(peer_node("n_stale", 1, 3000, Utc::now() - ChronoDuration::seconds(200)), "bootstrap").await;
        let view = dir.aggregate_view().await;
        // local (4000) + n_fresh (3000); n_stale excluded despite being in the map still.
        assert_eq!(view.capacity.total.cpu_mc, 7000);
    }
}
