//! Gossip-based peer discovery.
//!
//! Every discovery interval each connected peer is asked for a peer list.
//! Responses are self-signed by the responder's node key; a list that fails
//! verification is misbehavior.

use crate::canonical::signable_bytes;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::net::message::SignedPeerList;
use crate::net::peer_manager::PeerManager;
use crate::types::{NodeId, now};

/// Build a signed sample of our active peers for a requester.
pub fn build_peer_list(
    identity: &Keypair,
    peers: &PeerManager,
    cap: usize,
    requester: &NodeId,
) -> Result<SignedPeerList> {
    let mut list = SignedPeerList {
        responder: identity.node_id(),
        issued_at: now(),
        entries: peers.gossip_sample(cap, requester),
        signature: Vec::new(),
    };
    let payload = signable_bytes(&list, &["signature"])?;
    list.signature = identity.sign(&payload);
    Ok(list)
}

/// Verify a received list: it must come from the connection's peer, be
/// signed by that peer's key, and respect the entry cap.
pub fn verify_peer_list(list: &SignedPeerList, sender: &NodeId, cap: usize) -> Result<()> {
    if list.responder != *sender {
        return Err(Error::ProtocolViolation(
            "peer list responder does not match connection peer".into(),
        ));
    }
    if list.entries.len() > cap {
        return Err(Error::ProtocolViolation(format!(
            "peer list over cap: {} > {cap}",
            list.entries.len()
        )));
    }
    let payload = signable_bytes(list, &["signature"])?;
    crypto::verify(list.responder.as_bytes(), &payload, &list.signature)
}
