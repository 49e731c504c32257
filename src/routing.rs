//! Distance-vector routing with destination-sequenced updates.
//!
//! Every node originates announcements for itself with metric 0 and an even,
//! monotonically increasing sequence number; odd sequence numbers are
//! withdrawals. Loop freedom rests on the per-destination sequence rule, and
//! the forwarding path carries a payload-id LRU as the duplicate guard.

use crate::net::message::{DataPacket, RouteAdvert, RouteWithdrawal};
use crate::types::{Hash, NodeId};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Duplicate-guard capacity.
pub const SEEN_CACHE_CAP: usize = 4096;

/// Duplicate-guard entry lifetime.
pub const SEEN_CACHE_TTL_SECS: u64 = 60;

/// Invalidated routes linger this long before removal, so withdrawals can
/// still be answered with the superseding announcement.
pub const ROUTE_GRACE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination: NodeId,
    pub next_hop: NodeId,
    /// Hop count from this node.
    pub metric: u32,
    pub sequence: u64,
    pub learned_from: NodeId,
    pub last_updated: u64,
    pub withdrawn: bool,
    pub invalidated_at: Option<u64>,
}

impl RouteEntry {
    pub fn is_usable(&self, at: u64, stale_timeout: u64) -> bool {
        !self.withdrawn && at.saturating_sub(self.last_updated) <= stale_timeout
    }
}

pub struct RoutingTable {
    self_id: NodeId,
    /// Our own even origination sequence; bumped by 2 per announce round.
    own_sequence: u64,
    max_hops: u32,
    routes: HashMap<NodeId, RouteEntry>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, max_hops: u32) -> Self {
        Self {
            self_id,
            own_sequence: 0,
            max_hops,
            routes: HashMap::new(),
        }
    }

    pub fn set_max_hops(&mut self, max_hops: u32) {
        self.max_hops = max_hops;
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    pub fn own_sequence(&self) -> u64 {
        self.own_sequence
    }

    pub fn route(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Usable next hop for a destination.
    pub fn next_hop(&self, destination: &NodeId, at: u64, stale_timeout: u64) -> Option<NodeId> {
        self.routes
            .get(destination)
            .filter(|r| r.is_usable(at, stale_timeout))
            .map(|r| r.next_hop)
    }

    /// Apply one advertised destination heard from `from`.
    ///
    /// Selection rule: accept iff the sequence is strictly newer, or equally
    /// new with a strictly better metric. On a full tie the existing route
    /// wins (stability), with one exception: a lexically lower next hop
    /// supersedes the held one, so every node converges on the same next hop
    /// regardless of arrival order. A re-announcement from the current next
    /// hop merely refreshes the entry.
    pub fn apply_advert(&mut self, advert: &RouteAdvert, from: NodeId, at: u64) -> bool {
        if advert.destination == self.self_id {
            return false;
        }
        // Odd sequences are withdrawals and do not install routes.
        if advert.sequence % 2 == 1 {
            return self.apply_withdrawal(
                &RouteWithdrawal {
                    destination: advert.destination,
                    sequence: advert.sequence,
                },
                at,
            );
        }

        let metric = advert.metric.saturating_add(1);
        if metric > self.max_hops {
            return false;
        }

        let install = match self.routes.get_mut(&advert.destination) {
            None => true,
            Some(current) => {
                if advert.sequence > current.sequence {
                    true
                } else if advert.sequence == current.sequence && !current.withdrawn {
                    if metric < current.metric {
                        true
                    } else if metric == current.metric {
                        if from == current.next_hop {
                            current.last_updated = at;
                            false
                        } else {
                            from < current.next_hop
                        }
                    } else {
                        false
                    }
                } else {
                    // Equal sequence against a withdrawn entry, or older news.
                    advert.sequence > current.sequence
                }
            }
        };

        if install {
            debug!(
                dest = %advert.destination.short(),
                via = %from.short(),
                metric,
                seq = advert.sequence,
                "route installed"
            );
            self.routes.insert(
                advert.destination,
                RouteEntry {
                    destination: advert.destination,
                    next_hop: from,
                    metric,
                    sequence: advert.sequence,
                    learned_from: from,
                    last_updated: at,
                    withdrawn: false,
                    invalidated_at: None,
                },
            );
        }
        install
    }

    /// Apply a flooded withdrawal. Returns true when it newly invalidates
    /// the route (and should be re-flooded).
    pub fn apply_withdrawal(&mut self, withdrawal: &RouteWithdrawal, at: u64) -> bool {
        if withdrawal.destination == self.self_id {
            return false;
        }
        match self.routes.get_mut(&withdrawal.destination) {
            Some(current) if withdrawal.sequence > current.sequence && !current.withdrawn => {
                current.withdrawn = true;
                current.sequence = withdrawal.sequence;
                current.invalidated_at = Some(at);
                true
            }
            Some(current) if withdrawal.sequence > current.sequence => {
                // Already withdrawn; just remember the newer sequence.
                current.sequence = withdrawal.sequence;
                false
            }
            _ => false,
        }
    }

    /// Invalidate every route through a disconnected next hop, producing the
    /// odd-sequence withdrawals to flood.
    pub fn invalidate_next_hop(&mut self, next_hop: &NodeId, at: u64) -> Vec<RouteWithdrawal> {
        let mut withdrawals = Vec::new();
        for route in self.routes.values_mut() {
            if route.next_hop == *next_hop && !route.withdrawn {
                route.withdrawn = true;
                route.sequence += 1;
                route.invalidated_at = Some(at);
                withdrawals.push(RouteWithdrawal {
                    destination: route.destination,
                    sequence: route.sequence,
                });
            }
        }
        withdrawals
    }

    /// Periodic sweep: stale routes get invalidated, invalidated routes past
    /// the grace window get removed.
    pub fn sweep(&mut self, at: u64, stale_timeout: u64) -> Vec<NodeId> {
        let mut removed = Vec::new();
        for route in self.routes.values_mut() {
            if !route.withdrawn && at.saturating_sub(route.last_updated) > stale_timeout {
                route.withdrawn = true;
                route.sequence += 1;
                route.invalidated_at = Some(at);
            }
        }
        self.routes.retain(|destination, route| {
            let expired = route
                .invalidated_at
                .map(|t| at.saturating_sub(t) > ROUTE_GRACE_SECS)
                .unwrap_or(false);
            if route.withdrawn && expired {
                removed.push(*destination);
                false
            } else {
                true
            }
        });
        removed
    }

    /// One announce round: bump our origin sequence and emit the full table.
    pub fn announce_round(&mut self) -> Vec<RouteAdvert> {
        self.own_sequence += 2;
        let mut adverts = vec![RouteAdvert {
            destination: self.self_id,
            metric: 0,
            sequence: self.own_sequence,
        }];
        adverts.extend(
            self.routes
                .values()
                .filter(|r| !r.withdrawn)
                .map(|r| RouteAdvert {
                    destination: r.destination,
                    metric: r.metric,
                    sequence: r.sequence,
                }),
        );
        adverts
    }

    /// Active (usable) destinations, for diagnostics.
    pub fn active_destinations(&self, at: u64, stale_timeout: u64) -> Vec<NodeId> {
        self.routes
            .values()
            .filter(|r| r.is_usable(at, stale_timeout))
            .map(|r| r.destination)
            .collect()
    }
}

/// LRU + TTL duplicate guard over payload ids.
pub struct SeenCache {
    seen: HashMap<Hash, u64>,
    order: VecDeque<(Hash, u64)>,
    cap: usize,
    ttl: u64,
}

impl SeenCache {
    pub fn new(cap: usize, ttl: u64) -> Self {
        Self {
            seen: HashMap::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap,
            ttl,
        }
    }

    fn purge(&mut self, at: u64) {
        while let Some((id, inserted)) = self.order.front() {
            if at.saturating_sub(*inserted) > self.ttl || self.order.len() > self.cap {
                let id = *id;
                self.order.pop_front();
                self.seen.remove(&id);
            } else {
                break;
            }
        }
    }

    /// True when the id is fresh (and now recorded); false when it was seen
    /// within the window.
    pub fn check_and_insert(&mut self, id: &Hash, at: u64) -> bool {
        self.purge(at);
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(*id, at);
        self.order.push_back((*id, at));
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(SEEN_CACHE_CAP, SEEN_CACHE_TTL_SECS)
    }
}

/// Why a packet was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TtlExpired,
    NoRoute,
    Duplicate,
}

/// What to do with an inbound unicast packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Deliver,
    /// Send to this next hop after decrementing the ttl.
    Forward(NodeId),
    Drop(DropReason),
}

/// Forwarding rule, applied in order: local delivery, ttl, route lookup,
/// duplicate guard.
pub fn forward_decision(
    packet: &DataPacket,
    self_id: &NodeId,
    table: &RoutingTable,
    seen: &mut SeenCache,
    at: u64,
    stale_timeout: u64,
) -> ForwardDecision {
    if packet.dest == *self_id {
        return ForwardDecision::Deliver;
    }
    if packet.ttl <= 1 {
        return ForwardDecision::Drop(DropReason::TtlExpired);
    }
    let next_hop = match table.next_hop(&packet.dest, at, stale_timeout) {
        Some(next_hop) => next_hop,
        None => return ForwardDecision::Drop(DropReason::NoRoute),
    };
    if !seen.check_and_insert(&packet.payload_id, at) {
        return ForwardDecision::Drop(DropReason::Duplicate);
    }
    ForwardDecision::Forward(next_hop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> NodeId {
        NodeId([id; 32])
    }

    fn advert(dest: u8, metric: u32, sequence: u64) -> RouteAdvert {
        RouteAdvert {
            destination: node(dest),
            metric,
            sequence,
        }
    }

    fn packet(dest: u8, ttl: u32, payload_id: u8) -> DataPacket {
        DataPacket {
            dest: node(dest),
            source: node(99),
            ttl,
            payload_id: [payload_id; 32],
            payload: vec![],
        }
    }

    #[test]
    fn installs_newer_sequence() {
        let mut table = RoutingTable::new(node(1), 6);
        assert!(table.apply_advert(&advert(2, 0, 2), node(2), 100));
        assert!(table.apply_advert(&advert(2, 0, 4), node(2), 110));
        assert_eq!(table.route(&node(2)).unwrap().sequence, 4);
        assert!(!table.apply_advert(&advert(2, 0, 2), node(3), 120));
        // Installed sequence is the maximum ever observed.
        assert_eq!(table.route(&node(2)).unwrap().sequence, 4);
    }

    #[test]
    fn equal_sequence_needs_strictly_better_metric() {
        let mut table = RoutingTable::new(node(1), 6);
        // Route to 4 via 2 with metric 3.
        assert!(table.apply_advert(&advert(4, 2, 10), node(2), 100));
        assert_eq!(table.route(&node(4)).unwrap().metric, 3);
        // Same sequence, same resulting metric: stability keeps 2.
        assert!(!table.apply_advert(&advert(4, 2, 10), node(3), 100));
        assert_eq!(table.route(&node(4)).unwrap().next_hop, node(2));
        // Same sequence, better metric: switch to 3.
        assert!(table.apply_advert(&advert(4, 1, 10), node(3), 100));
        assert_eq!(table.route(&node(4)).unwrap().next_hop, node(3));
        assert_eq!(table.route(&node(4)).unwrap().metric, 2);
    }

    #[test]
    fn equal_metric_tie_breaks_to_lower_next_hop() {
        let mut table = RoutingTable::new(node(1), 6);
        // Route to 9 via 5, metric 2.
        assert!(table.apply_advert(&advert(9, 1, 10), node(5), 100));
        // Same sequence and metric via a lexically higher neighbor: kept.
        assert!(!table.apply_advert(&advert(9, 1, 10), node(7), 100));
        assert_eq!(table.route(&node(9)).unwrap().next_hop, node(5));
        // Same via a lexically lower neighbor: switch, deterministically.
        assert!(table.apply_advert(&advert(9, 1, 10), node(3), 100));
        assert_eq!(table.route(&node(9)).unwrap().next_hop, node(3));
        // And the order of arrival no longer matters.
        assert!(!table.apply_advert(&advert(9, 1, 10), node(5), 100));
        assert_eq!(table.route(&node(9)).unwrap().next_hop, node(3));
    }

    #[test]
    fn refresh_from_current_next_hop_updates_timestamp() {
        let mut table = RoutingTable::new(node(1), 6);
        table.apply_advert(&advert(2, 0, 2), node(2), 100);
        assert!(!table.apply_advert(&advert(2, 0, 2), node(2), 150));
        assert_eq!(table.route(&node(2)).unwrap().last_updated, 150);
    }

    #[test]
    fn metric_capped_at_max_hops() {
        let mut table = RoutingTable::new(node(1), 3);
        assert!(!table.apply_advert(&advert(2, 3, 2), node(5), 100));
        assert!(table.route(&node(2)).is_none());
    }

    #[test]
    fn own_destination_ignored() {
        let mut table = RoutingTable::new(node(1), 6);
        assert!(!table.apply_advert(&advert(1, 0, 100), node(2), 100));
    }

    #[test]
    fn disconnect_withdraws_and_floods_odd_sequence() {
        let mut table = RoutingTable::new(node(1), 6);
        table.apply_advert(&advert(2, 0, 6), node(2), 100);
        table.apply_advert(&advert(3, 1, 8), node(2), 100);
        table.apply_advert(&advert(4, 0, 4), node(4), 100);

        let withdrawals = table.invalidate_next_hop(&node(2), 110);
        assert_eq!(withdrawals.len(), 2);
        for w in &withdrawals {
            assert_eq!(w.sequence % 2, 1);
        }
        assert!(table.next_hop(&node(3), 110, 90).is_none());
        assert!(table.next_hop(&node(4), 110, 90).is_some());
    }

    #[test]
    fn higher_sequence_reinstalls_after_withdrawal() {
        let mut table = RoutingTable::new(node(1), 6);
        table.apply_advert(&advert(2, 0, 6), node(2), 100);
        table.invalidate_next_hop(&node(2), 110);
        assert!(table.next_hop(&node(2), 111, 90).is_none());

        // Origin announces again with a newer even sequence via another peer.
        assert!(table.apply_advert(&advert(2, 1, 8), node(3), 120));
        assert_eq!(table.next_hop(&node(2), 121, 90), Some(node(3)));
    }

    #[test]
    fn withdrawal_with_stale_sequence_ignored() {
        let mut table = RoutingTable::new(node(1), 6);
        table.apply_advert(&advert(2, 0, 10), node(2), 100);
        let ignored = table.apply_withdrawal(
            &RouteWithdrawal {
                destination: node(2),
                sequence: 9,
            },
            110,
        );
        assert!(!ignored);
        assert!(table.next_hop(&node(2), 111, 90).is_some());
    }

    #[test]
    fn sweep_invalidates_then_removes() {
        let mut table = RoutingTable::new(node(1), 6);
        table.apply_advert(&advert(2, 0, 2), node(2), 100);

        // Past staleness: invalidated, still present through grace.
        let removed = table.sweep(100 + 91, 90);
        assert!(removed.is_empty());
        assert!(table.route(&node(2)).unwrap().withdrawn);

        // Past grace: removed.
        let removed = table.sweep(100 + 91 + ROUTE_GRACE_SECS + 1, 90);
        assert_eq!(removed, vec![node(2)]);
        assert!(table.route(&node(2)).is_none());
    }

    #[test]
    fn announce_round_bumps_even_sequence_and_lists_table() {
        let mut table = RoutingTable::new(node(1), 6);
        table.apply_advert(&advert(2, 0, 2), node(2), 100);

        let first = table.announce_round();
        assert_eq!(first[0].destination, node(1));
        assert_eq!(first[0].sequence, 2);
        assert_eq!(first[0].metric, 0);
        assert_eq!(first.len(), 2);

        let second = table.announce_round();
        assert_eq!(second[0].sequence, 4);
    }

    #[test]
    fn triangle_converges_and_reroutes() {
        // A fully-meshed triangle from A's point of view: direct routes to B
        // and C with metric 1. When B disconnects, C's re-announcement of B
        // restores reachability with metric 2.
        let (a, b, c) = (node(10), node(11), node(12));
        let mut table = RoutingTable::new(a, 6);

        table.apply_advert(&advert(11, 0, 2), b, 100);
        table.apply_advert(&advert(12, 0, 2), c, 100);
        assert_eq!(table.route(&b).unwrap().metric, 1);
        assert_eq!(table.route(&c).unwrap().metric, 1);

        table.invalidate_next_hop(&b, 130);
        assert!(table.next_hop(&b, 131, 90).is_none());

        // C heard B's next origination (sequence 4) and re-advertises it.
        assert!(table.apply_advert(&advert(11, 1, 4), c, 160));
        assert_eq!(table.next_hop(&b, 161, 90), Some(c));
        assert_eq!(table.route(&b).unwrap().metric, 2);
    }

    #[test]
    fn forward_decision_order() {
        let self_id = node(1);
        let mut table = RoutingTable::new(self_id, 6);
        table.apply_advert(&advert(2, 0, 2), node(2), 100);
        let mut seen = SeenCache::default();

        // Local delivery.
        assert_eq!(
            forward_decision(&packet(1, 5, 1), &self_id, &table, &mut seen, 100, 90),
            ForwardDecision::Deliver
        );
        // TTL exhausted on ingress.
        assert_eq!(
            forward_decision(&packet(2, 0, 2), &self_id, &table, &mut seen, 100, 90),
            ForwardDecision::Drop(DropReason::TtlExpired)
        );
        assert_eq!(
            forward_decision(&packet(2, 1, 3), &self_id, &table, &mut seen, 100, 90),
            ForwardDecision::Drop(DropReason::TtlExpired)
        );
        // No route.
        assert_eq!(
            forward_decision(&packet(7, 5, 4), &self_id, &table, &mut seen, 100, 90),
            ForwardDecision::Drop(DropReason::NoRoute)
        );
        // Forwarded, then duplicate on any link.
        assert_eq!(
            forward_decision(&packet(2, 5, 5), &self_id, &table, &mut seen, 100, 90),
            ForwardDecision::Forward(node(2))
        );
        assert_eq!(
            forward_decision(&packet(2, 5, 5), &self_id, &table, &mut seen, 110, 90),
            ForwardDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn seen_cache_ttl_expiry() {
        let mut seen = SeenCache::new(16, 60);
        assert!(seen.check_and_insert(&[1u8; 32], 100));
        assert!(!seen.check_and_insert(&[1u8; 32], 150));
        // Past the TTL window the id is fresh again.
        assert!(seen.check_and_insert(&[1u8; 32], 161));
    }

    #[test]
    fn seen_cache_capacity_bound() {
        let mut seen = SeenCache::new(8, 600);
        for i in 0..64u8 {
            seen.check_and_insert(&[i; 32], 100);
        }
        assert!(seen.len() <= 9);
    }
}
