//! Routing convergence scenarios on the distance-vector state machine.

use genesis_mesh::net::message::{DataPacket, RouteAdvert};
use genesis_mesh::routing::{
    DropReason, ForwardDecision, RoutingTable, SeenCache, forward_decision,
};
use genesis_mesh::types::NodeId;

fn node(tag: u8) -> NodeId {
    NodeId([tag; 32])
}

const STALE: u64 = 90;

/// Simulated mesh node: a routing table plus its own announce state.
struct SimNode {
    id: NodeId,
    table: RoutingTable,
}

impl SimNode {
    fn new(tag: u8) -> Self {
        let id = node(tag);
        Self {
            id,
            table: RoutingTable::new(id, 6),
        }
    }

    fn announce(&mut self) -> Vec<RouteAdvert> {
        self.table.announce_round()
    }

    fn receive(&mut self, from: NodeId, adverts: &[RouteAdvert], at: u64) {
        for advert in adverts {
            self.table.apply_advert(advert, from, at);
        }
    }
}

/// One gossip round over a set of links: everyone announces, everyone hears.
fn gossip_round(nodes: &mut [SimNode], links: &[(usize, usize)], at: u64) {
    let announcements: Vec<(NodeId, Vec<RouteAdvert>)> = nodes
        .iter_mut()
        .map(|n| (n.id, n.announce()))
        .collect();
    for &(a, b) in links {
        let (from_a, adverts_a) = (announcements[a].0, announcements[a].1.clone());
        let (from_b, adverts_b) = (announcements[b].0, announcements[b].1.clone());
        nodes[b].receive(from_a, &adverts_a, at);
        nodes[a].receive(from_b, &adverts_b, at);
    }
}

#[test]
fn three_anchor_triangle_converges() {
    let mut nodes = vec![SimNode::new(1), SimNode::new(2), SimNode::new(3)];
    let full_mesh = [(0, 1), (0, 2), (1, 2)];

    // Within two announce rounds every node knows the other two at metric 1.
    gossip_round(&mut nodes, &full_mesh, 100);
    gossip_round(&mut nodes, &full_mesh, 130);

    for i in 0..3 {
        for j in 0..3 {
            if i == j {
                continue;
            }
            let dest = nodes[j].id;
            let route = nodes[i].table.route(&dest).expect("route installed");
            assert_eq!(route.metric, 1, "direct neighbors at metric 1");
        }
    }

    // Sequence numbers are stable: another round does not churn metrics.
    gossip_round(&mut nodes, &full_mesh, 160);
    for i in 0..3 {
        for j in 0..3 {
            if i != j {
                assert_eq!(nodes[i].table.route(&nodes[j].id).unwrap().metric, 1);
            }
        }
    }
}

#[test]
fn link_loss_reroutes_through_third_anchor() {
    let mut nodes = vec![SimNode::new(1), SimNode::new(2), SimNode::new(3)];
    let full_mesh = [(0, 1), (0, 2), (1, 2)];
    gossip_round(&mut nodes, &full_mesh, 100);
    gossip_round(&mut nodes, &full_mesh, 130);

    // A↔B goes down: both sides invalidate routes via the lost next hop.
    let (a_id, b_id) = (nodes[0].id, nodes[1].id);
    let withdrawals_b = nodes[1].table.invalidate_next_hop(&a_id, 140);
    nodes[0].table.invalidate_next_hop(&b_id, 140);
    assert!(!withdrawals_b.is_empty());
    assert!(nodes[1].table.next_hop(&a_id, 141, STALE).is_none());

    // Gossip on the surviving links: C first hears A's newer origination,
    // then re-advertises it, restoring B→A via C at metric 2.
    let degraded = [(0, 2), (1, 2)];
    gossip_round(&mut nodes, &degraded, 150);
    gossip_round(&mut nodes, &degraded, 160);

    let route = nodes[1].table.route(&a_id).expect("rerouted via C");
    assert_eq!(route.next_hop, nodes[2].id);
    assert_eq!(route.metric, 2);
}

#[test]
fn installed_sequence_is_max_ever_observed() {
    let mut table = RoutingTable::new(node(1), 6);
    let dest = node(9);
    let sequences = [2u64, 8, 4, 6, 8, 2];
    for (i, seq) in sequences.iter().enumerate() {
        table.apply_advert(
            &RouteAdvert {
                destination: dest,
                metric: 0,
                sequence: *seq,
            },
            node(2),
            100 + i as u64,
        );
    }
    assert_eq!(table.route(&dest).unwrap().sequence, 8);
}

#[test]
fn ttl_zero_on_ingress_never_forwards() {
    let self_id = node(1);
    let mut table = RoutingTable::new(self_id, 6);
    table.apply_advert(
        &RouteAdvert {
            destination: node(2),
            metric: 0,
            sequence: 2,
        },
        node(2),
        100,
    );
    let mut seen = SeenCache::default();

    let packet = DataPacket {
        dest: node(2),
        source: node(3),
        ttl: 0,
        payload_id: [1u8; 32],
        payload: vec![],
    };
    assert_eq!(
        forward_decision(&packet, &self_id, &table, &mut seen, 100, STALE),
        ForwardDecision::Drop(DropReason::TtlExpired)
    );
    // Nothing entered the duplicate guard for a dropped packet.
    assert_eq!(seen.len(), 0);
}

#[test]
fn duplicate_dropped_even_on_new_link() {
    let self_id = node(1);
    let mut table = RoutingTable::new(self_id, 6);
    // Two distinct routes exist over time; the duplicate guard is global.
    table.apply_advert(
        &RouteAdvert {
            destination: node(5),
            metric: 0,
            sequence: 2,
        },
        node(2),
        100,
    );
    let mut seen = SeenCache::default();

    let packet = DataPacket {
        dest: node(5),
        source: node(3),
        ttl: 4,
        payload_id: [7u8; 32],
        payload: vec![],
    };
    assert!(matches!(
        forward_decision(&packet, &self_id, &table, &mut seen, 100, STALE),
        ForwardDecision::Forward(_)
    ));

    // The same payload arrives again via a different neighbor and a newer
    // route: still dropped inside the window.
    table.apply_advert(
        &RouteAdvert {
            destination: node(5),
            metric: 0,
            sequence: 4,
        },
        node(4),
        110,
    );
    assert_eq!(
        forward_decision(&packet, &self_id, &table, &mut seen, 110, STALE),
        ForwardDecision::Drop(DropReason::Duplicate)
    );
}

#[test]
fn withdrawal_floods_do_not_resurrect() {
    let mut a = SimNode::new(1);
    let b = node(2);
    let c = node(3);

    // Route to dest 9 via B.
    a.table.apply_advert(
        &RouteAdvert {
            destination: node(9),
            metric: 1,
            sequence: 6,
        },
        b,
        100,
    );

    // C floods a withdrawal with the superseding odd sequence.
    let withdrawn = a.table.apply_withdrawal(
        &genesis_mesh::net::message::RouteWithdrawal {
            destination: node(9),
            sequence: 7,
        },
        110,
    );
    assert!(withdrawn);
    assert!(a.table.next_hop(&node(9), 111, STALE).is_none());

    // A stale advert with the old even sequence does not reinstall.
    assert!(!a.table.apply_advert(
        &RouteAdvert {
            destination: node(9),
            metric: 1,
            sequence: 6,
        },
        c,
        120,
    ));
    assert!(a.table.next_hop(&node(9), 121, STALE).is_none());

    // The origin's next announcement (sequence 8) does.
    assert!(a.table.apply_advert(
        &RouteAdvert {
            destination: node(9),
            metric: 1,
            sequence: 8,
        },
        c,
        130,
    ));
    assert_eq!(a.table.next_hop(&node(9), 131, STALE), Some(c));
}
