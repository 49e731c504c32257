//! Peer store: every known peer keyed by `NodeId`.
//!
//! Lock ordering: `peer_manager → routing_table → audit`. Methods here never
//! call into other stores while holding the internal lock.

use crate::net::message::PeerEntry;
use crate::net::peer::{PeerRecord, PeerSnapshot};
use crate::rbac::Role;
use crate::types::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::debug;

pub struct PeerManager {
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
    blacklist_threshold: f64,
}

impl PeerManager {
    pub fn new(blacklist_threshold: f64) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            blacklist_threshold,
        }
    }

    /// First sighting or reconnect: mark connected, record roles.
    /// Returns true when this peer was never seen before.
    pub fn mark_connected(
        &self,
        node_id: NodeId,
        endpoint: SocketAddr,
        roles: &[Role],
        at: u64,
    ) -> bool {
        let mut peers = self.peers.write().expect("peer lock");
        let is_new = !peers.contains_key(&node_id);
        let record = peers
            .entry(node_id)
            .or_insert_with(|| PeerRecord::new(node_id, Some(endpoint), at));
        record.endpoint = Some(endpoint);
        record.connected = true;
        record.observed_roles = roles.to_vec();
        record.record_good(at);
        is_new
    }

    pub fn mark_disconnected(&self, node_id: &NodeId) {
        if let Some(record) = self.peers.write().expect("peer lock").get_mut(node_id) {
            record.connected = false;
        }
    }

    pub fn record_good(&self, node_id: &NodeId, at: u64) {
        if let Some(record) = self.peers.write().expect("peer lock").get_mut(node_id) {
            record.record_good(at);
        }
    }

    pub fn record_latency(&self, node_id: &NodeId, latency_ms: u64) {
        if let Some(record) = self.peers.write().expect("peer lock").get_mut(node_id) {
            record.latency_ms = Some(latency_ms);
        }
    }

    /// Penalize a peer; returns the blacklist deadline if this tripped it.
    pub fn record_misbehavior(&self, node_id: &NodeId, at: u64) -> Option<u64> {
        let mut peers = self.peers.write().expect("peer lock");
        let record = peers
            .entry(*node_id)
            .or_insert_with(|| PeerRecord::new(*node_id, None, at));
        record.record_misbehavior(self.blacklist_threshold, at)
    }

    pub fn record_dial_failure(&self, node_id: &NodeId) {
        if let Some(record) = self.peers.write().expect("peer lock").get_mut(node_id) {
            record.record_dial_failure();
        }
    }

    pub fn is_blacklisted(&self, node_id: &NodeId, at: u64) -> bool {
        self.peers
            .read()
            .expect("peer lock")
            .get(node_id)
            .map(|r| r.is_blacklisted(at))
            .unwrap_or(false)
    }

    pub fn reputation(&self, node_id: &NodeId) -> Option<f64> {
        self.peers
            .read()
            .expect("peer lock")
            .get(node_id)
            .map(|r| r.reputation)
    }

    pub fn endpoint(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.peers
            .read()
            .expect("peer lock")
            .get(node_id)
            .and_then(|r| r.endpoint)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .read()
            .expect("peer lock")
            .values()
            .filter(|r| r.connected)
            .count()
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .expect("peer lock")
            .values()
            .filter(|r| r.connected)
            .map(|r| r.node_id)
            .collect()
    }

    /// Merge gossiped sightings. Commutative and associative: unknown peers
    /// are inserted as observed, known ones only advance `last_heard`.
    pub fn merge_gossip(&self, entries: &[PeerEntry], at: u64) {
        let mut peers = self.peers.write().expect("peer lock");
        for entry in entries {
            match peers.get_mut(&entry.node_id) {
                // Gossip cannot claim sightings from the future.
                Some(record) => record.merge_sighting(entry.endpoint, entry.last_heard.min(at)),
                None => {
                    let mut record =
                        PeerRecord::new(entry.node_id, Some(entry.endpoint), at);
                    record.last_heard = entry.last_heard.min(at);
                    peers.insert(entry.node_id, record);
                }
            }
        }
    }

    /// Sample of active peers for a gossip response, capped.
    pub fn gossip_sample(&self, cap: usize, exclude: &NodeId) -> Vec<PeerEntry> {
        self.peers
            .read()
            .expect("peer lock")
            .values()
            .filter(|r| r.connected && r.node_id != *exclude)
            .filter_map(|r| {
                r.endpoint.map(|endpoint| PeerEntry {
                    node_id: r.node_id,
                    endpoint,
                    last_heard: r.last_heard,
                })
            })
            .take(cap)
            .collect()
    }

    /// Dial candidates: known, not connected, not blacklisted.
    pub fn dial_candidates(&self, at: u64) -> Vec<(NodeId, SocketAddr)> {
        self.peers
            .read()
            .expect("peer lock")
            .values()
            .filter(|r| !r.connected && !r.is_blacklisted(at))
            .filter_map(|r| r.endpoint.map(|e| (r.node_id, e)))
            .collect()
    }

    /// Evict peers unheard past the staleness window with no connection.
    pub fn evict_stale(&self, at: u64, stale_timeout: u64) -> Vec<NodeId> {
        let mut peers = self.peers.write().expect("peer lock");
        let stale: Vec<NodeId> = peers
            .values()
            .filter(|r| r.is_stale(at, stale_timeout))
            .map(|r| r.node_id)
            .collect();
        for id in &stale {
            peers.remove(id);
            debug!("evicted stale peer {}", id.short());
        }
        stale
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers
            .read()
            .expect("peer lock")
            .values()
            .map(PeerSnapshot::from)
            .collect()
    }

    pub fn restore(&self, snapshots: &[PeerSnapshot]) {
        let mut peers = self.peers.write().expect("peer lock");
        for snapshot in snapshots {
            peers
                .entry(snapshot.node_id)
                .or_insert_with(|| snapshot.restore());
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
