//! Per-peer record: sighting history, reputation, blacklisting.

use crate::net::types::{
    BLACKLIST_BASE_SECS, BLACKLIST_MAX_SECS, REPUTATION_PENALTY, REPUTATION_REWARD,
    REPUTATION_START,
};
use crate::rbac::Role;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Everything the node knows about one peer.
///
/// Only peers whose certificate currently validates may be `connected`; the
/// transport enforces that at handshake time and the peer manager on CRL
/// updates.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub endpoint: Option<SocketAddr>,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Last time we heard anything attributable to this peer, directly or
    /// via gossip.
    pub last_heard: u64,
    pub reputation: f64,
    pub consecutive_failures: u32,
    pub blacklisted_until: u64,
    /// Blacklist recurrences; the duration doubles with each one.
    pub blacklist_strikes: u32,
    pub observed_roles: Vec<Role>,
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

impl PeerRecord {
    pub fn new(node_id: NodeId, endpoint: Option<SocketAddr>, at: u64) -> Self {
        Self {
            node_id,
            endpoint,
            first_seen: at,
            last_seen: at,
            last_heard: at,
            reputation: REPUTATION_START,
            consecutive_failures: 0,
            blacklisted_until: 0,
            blacklist_strikes: 0,
            observed_roles: Vec::new(),
            connected: false,
            latency_ms: None,
        }
    }

    /// Successful interaction: handshake, pong, accepted announcement.
    pub fn record_good(&mut self, at: u64) {
        self.reputation = (self.reputation + REPUTATION_REWARD).min(1.0);
        self.consecutive_failures = 0;
        self.last_seen = at;
        self.last_heard = at;
    }

    /// Misbehavior. Returns the blacklist deadline when the reputation falls
    /// below the threshold.
    pub fn record_misbehavior(&mut self, threshold: f64, at: u64) -> Option<u64> {
        self.reputation = (self.reputation - REPUTATION_PENALTY).max(0.0);
        self.last_heard = at;
        if self.reputation < threshold {
            let duration = (BLACKLIST_BASE_SECS << self.blacklist_strikes.min(6))
                .min(BLACKLIST_MAX_SECS);
            self.blacklist_strikes += 1;
            self.blacklisted_until = at + duration;
            // Parole: restored to the threshold so one good interaction
            // climbs back out instead of instantly re-tripping.
            self.reputation = threshold;
            Some(self.blacklisted_until)
        } else {
            None
        }
    }

    pub fn record_dial_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn is_blacklisted(&self, at: u64) -> bool {
        at < self.blacklisted_until
    }

    /// Gossip merge: endpoints fill gaps, `last_heard` only moves forward.
    pub fn merge_sighting(&mut self, endpoint: SocketAddr, last_heard: u64) {
        if self.endpoint.is_none() {
            self.endpoint = Some(endpoint);
        }
        if last_heard > self.last_heard {
            self.last_heard = last_heard;
        }
    }

    /// Stale when unheard past the window and not actively connected.
    pub fn is_stale(&self, at: u64, stale_timeout: u64) -> bool {
        !self.connected && at.saturating_sub(self.last_heard) > stale_timeout
    }
}

/// Persisted form for `state/peers.json` warm starts. Reputation restarts
/// at the initial value; only the sighting data survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub node_id: NodeId,
    pub endpoint: Option<SocketAddr>,
    pub first_seen: u64,
    pub last_heard: u64,
}

impl From<&PeerRecord> for PeerSnapshot {
    fn from(record: &PeerRecord) -> Self {
        Self {
            node_id: record.node_id,
            endpoint: record.endpoint,
            first_seen: record.first_seen,
            last_heard: record.last_heard,
        }
    }
}

impl PeerSnapshot {
    pub fn restore(&self) -> PeerRecord {
        let mut record = PeerRecord::new(self.node_id, self.endpoint, self.first_seen);
        record.last_heard = self.last_heard;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reputation_bounded() {
        let mut peer = PeerRecord::new(NodeId([1u8; 32]), None, 100);
        for _ in 0..100 {
            peer.record_good(100);
        }
        assert!(peer.reputation <= 1.0);
    }

    #[test]
    fn blacklist_trips_below_threshold() {
        let mut peer = PeerRecord::new(NodeId([1u8; 32]), None, 100);
        // 0.5 start, -0.1 per strike; fourth strike lands below 0.2.
        assert!(peer.record_misbehavior(0.2, 100).is_none());
        assert!(peer.record_misbehavior(0.2, 100).is_none());
        assert!(peer.record_misbehavior(0.2, 100).is_none());
        let until = peer.record_misbehavior(0.2, 100);
        assert_eq!(until, Some(100 + BLACKLIST_BASE_SECS));
        assert!(peer.is_blacklisted(100 + 1));
        assert!(!peer.is_blacklisted(100 + BLACKLIST_BASE_SECS));
    }

    #[test]
    fn blacklist_duration_doubles_and_caps() {
        let mut peer = PeerRecord::new(NodeId([1u8; 32]), None, 0);
        let mut durations = Vec::new();
        for _ in 0..8 {
            peer.reputation = 0.0;
            let until = peer.record_misbehavior(0.2, 1000).unwrap();
            durations.push(until - 1000);
        }
        assert_eq!(durations[0], 60);
        assert_eq!(durations[1], 120);
        assert_eq!(durations[2], 240);
        assert_eq!(*durations.last().unwrap(), BLACKLIST_MAX_SECS);
    }

    #[test]
    fn merge_only_moves_last_heard_forward() {
        let mut peer = PeerRecord::new(NodeId([1u8; 32]), None, 500);
        let ep: SocketAddr = "10.0.0.9:7400".parse().unwrap();
        peer.merge_sighting(ep, 400);
        assert_eq!(peer.last_heard, 500);
        peer.merge_sighting(ep, 600);
        assert_eq!(peer.last_heard, 600);
        assert_eq!(peer.endpoint, Some(ep));
    }

    #[test]
    fn staleness_requires_disconnection() {
        let mut peer = PeerRecord::new(NodeId([1u8; 32]), None, 0);
        peer.connected = true;
        assert!(!peer.is_stale(10_000, 900));
        peer.connected = false;
        assert!(peer.is_stale(10_000, 900));
        assert!(!peer.is_stale(500, 900));
    }

    #[test]
    fn snapshot_resets_reputation() {
        let mut peer = PeerRecord::new(NodeId([1u8; 32]), None, 0);
        peer.reputation = 0.9;
        peer.last_heard = 777;
        let restored = PeerSnapshot::from(&peer).restore();
        assert_eq!(restored.reputation, REPUTATION_START);
        assert_eq!(restored.last_heard, 777);
    }
}
