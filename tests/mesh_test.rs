//! In-process mesh tests: two transports over localhost TCP.

use genesis_mesh::crypto::Keypair;
use genesis_mesh::metrics::Metrics;
use genesis_mesh::net::message::{DataPacket, Message};
use genesis_mesh::net::peer_manager::PeerManager;
use genesis_mesh::net::transport::{NetEvent, Transport, TransportConfig};
use genesis_mesh::rbac::Role;
use genesis_mesh::trust::JoinCertificate;
use genesis_mesh::trust::crl::{Crl, CrlStore, Revocation};
use genesis_mesh::trust::genesis::{AnchorEndpoint, AuthorityKey, GenesisBlock, PolicyRef};
use genesis_mesh::types::{NodeId, now};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct TestNet {
    genesis: Arc<GenesisBlock>,
    authority: Keypair,
}

fn make_net() -> TestNet {
    let root = Keypair::generate();
    let authority = Keypair::generate();
    let t = now();
    let mut genesis = GenesisBlock {
        network_name: "localmesh".into(),
        version: 1,
        root_public_key: root.public_bytes().to_vec(),
        network_authority: AuthorityKey {
            pubkey: authority.public_bytes().to_vec(),
            valid_from: t - 60,
            valid_to: t + 24 * 3600,
        },
        allowed_crypto_suites: vec!["ed25519".into()],
        allowed_transports: vec!["tcp".into()],
        policy_manifest_ref: PolicyRef {
            hash: [0u8; 32],
            url: "https://na.localmesh/policy".into(),
        },
        bootstrap_anchors: vec![AnchorEndpoint {
            endpoint: "127.0.0.1:1".parse().unwrap(),
        }],
        signatures: Vec::new(),
    };
    genesis.sign_with_root(&root).unwrap();
    TestNet {
        genesis: Arc::new(genesis),
        authority,
    }
}

struct TestNode {
    id: NodeId,
    addr: SocketAddr,
    transport: Arc<Transport>,
    events: mpsc::Receiver<NetEvent>,
}

async fn spawn_node(net: &TestNet, max_connections: usize, revoked: &[NodeId]) -> TestNode {
    let identity = Arc::new(Keypair::generate());
    let t = now();
    let cert = JoinCertificate::issue(
        &net.authority,
        identity.node_id(),
        vec![Role::Client],
        vec![],
        &net.genesis.network_id(),
        t - 10,
        t + 3600,
        1,
    )
    .unwrap();

    let crl = if revoked.is_empty() {
        CrlStore::new(None)
    } else {
        CrlStore::new(Some(
            Crl::issue(
                &net.authority,
                1,
                revoked
                    .iter()
                    .map(|id| Revocation {
                        subject_pubkey: *id,
                        reason: "test".into(),
                        revoked_at: t,
                    })
                    .collect(),
                t,
            )
            .unwrap(),
        ))
    };

    let (transport, events) = Transport::new(
        TransportConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            network_id: net.genesis.network_id(),
            max_connections,
            handshake_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
            advertised_endpoint: None,
        },
        identity.clone(),
        Arc::new(RwLock::new(cert)),
        net.genesis.clone(),
        Arc::new(crl),
        Arc::new(PeerManager::new(0.2)),
        Arc::new(Metrics::new()),
    );
    let addr = transport.start().await.unwrap();

    TestNode {
        id: identity.node_id(),
        addr,
        transport,
        events,
    }
}

async fn expect_connected(node: &mut TestNode) -> NodeId {
    loop {
        match timeout(Duration::from_secs(5), node.events.recv()).await {
            Ok(Some(NetEvent::PeerConnected { node_id, .. })) => return node_id,
            Ok(Some(_)) => continue,
            other => panic!("expected PeerConnected, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn handshake_establishes_and_frames_flow() {
    let net = make_net();
    let mut a = spawn_node(&net, 50, &[]).await;
    let mut b = spawn_node(&net, 50, &[]).await;

    b.transport.dial(a.addr);

    let seen_by_a = expect_connected(&mut a).await;
    let seen_by_b = expect_connected(&mut b).await;
    assert_eq!(seen_by_a, b.id);
    assert_eq!(seen_by_b, a.id);
    assert_eq!(a.transport.connection_count(), 1);
    assert_eq!(b.transport.connection_count(), 1);

    // A routed datagram crosses the authenticated session.
    let packet = DataPacket {
        dest: a.id,
        source: b.id,
        ttl: 4,
        payload_id: [9u8; 32],
        payload: b"over the mesh".to_vec(),
    };
    b.transport.send(&a.id, Message::Data(packet)).unwrap();

    loop {
        match timeout(Duration::from_secs(5), a.events.recv()).await {
            Ok(Some(NetEvent::Frame { from, message })) => {
                assert_eq!(from, b.id);
                match message {
                    Message::Data(p) => {
                        assert_eq!(p.payload, b"over the mesh");
                        break;
                    }
                    other => panic!("unexpected message {}", other.kind_name()),
                }
            }
            Ok(Some(_)) => continue,
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    a.transport.shutdown().await;
    b.transport.shutdown().await;
}

#[tokio::test]
async fn revoked_certificate_cannot_establish() {
    let net = make_net();
    // Build B first so A's CRL can name it.
    let b = spawn_node(&net, 50, &[]).await;
    let mut a = spawn_node(&net, 50, &[b.id]).await;

    b.transport.dial(a.addr);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(a.transport.connection_count(), 0);
    assert_eq!(b.transport.connection_count(), 0);
    assert!(
        timeout(Duration::from_millis(200), a.events.recv())
            .await
            .is_err(),
        "no event may surface for a revoked peer"
    );

    a.transport.shutdown().await;
    b.transport.shutdown().await;
}

#[tokio::test]
async fn pool_cap_refuses_excess_connections() {
    let net = make_net();
    let mut a = spawn_node(&net, 1, &[]).await;
    let mut b = spawn_node(&net, 50, &[]).await;
    let mut c = spawn_node(&net, 50, &[]).await;

    b.transport.dial(a.addr);
    expect_connected(&mut a).await;
    expect_connected(&mut b).await;

    c.transport.dial(a.addr);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(a.transport.connection_count(), 1);
    assert_eq!(c.transport.connection_count(), 0);
    assert!(
        timeout(Duration::from_millis(200), c.events.recv())
            .await
            .is_err(),
        "refused dial must not produce a connection event"
    );

    a.transport.shutdown().await;
    b.transport.shutdown().await;
    c.transport.shutdown().await;
}

#[tokio::test]
async fn foreign_network_certificate_rejected() {
    let net = make_net();
    let other_net = make_net();

    let mut a = spawn_node(&net, 50, &[]).await;
    let mut b = spawn_node(&other_net, 50, &[]).await;

    b.transport.dial(a.addr);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(a.transport.connection_count(), 0);
    assert_eq!(b.transport.connection_count(), 0);
    assert!(
        timeout(Duration::from_millis(200), a.events.recv())
            .await
            .is_err()
    );
    assert!(
        timeout(Duration::from_millis(200), b.events.recv())
            .await
            .is_err()
    );

    a.transport.shutdown().await;
    b.transport.shutdown().await;
}

#[tokio::test]
async fn disconnect_emits_peer_disconnected() {
    let net = make_net();
    let mut a = spawn_node(&net, 50, &[]).await;
    let mut b = spawn_node(&net, 50, &[]).await;

    b.transport.dial(a.addr);
    expect_connected(&mut a).await;
    expect_connected(&mut b).await;

    a.transport.disconnect(b.id, "test close");

    loop {
        match timeout(Duration::from_secs(5), a.events.recv()).await {
            Ok(Some(NetEvent::PeerDisconnected { node_id, .. })) => {
                assert_eq!(node_id, b.id);
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("expected PeerDisconnected, got {other:?}"),
        }
    }
    assert_eq!(a.transport.connection_count(), 0);

    a.transport.shutdown().await;
    b.transport.shutdown().await;
}
