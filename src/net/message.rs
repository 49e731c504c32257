//! Wire message kinds and payloads.
//!
//! Payloads are canonical JSON. Kind codes are stable; unknown kinds decode
//! to `None` and are ignored for forward compatibility.

use crate::canonical::signable_bytes;
use crate::control::ControlMessage;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::net::types::MESSAGE_SIZE_LIMIT;
use crate::trust::cert::JoinCertificate;
use crate::trust::crl::Crl;
use crate::types::{Hash, NodeId, hexhash};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// First handshake frame, sent by the dialer. Signed by the certificate
/// subject key so the peer proves possession of its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub protocol_version: u8,
    pub network_id: String,
    pub cert: JoinCertificate,
    #[serde(with = "crate::types::hexbytes")]
    pub nonce: Vec<u8>,
    /// Where this node accepts inbound dials, if it listens at all.
    pub listen_endpoint: Option<SocketAddr>,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

impl HandshakePayload {
    pub fn new(
        identity: &Keypair,
        cert: JoinCertificate,
        network_id: &str,
        protocol_version: u8,
        nonce: Vec<u8>,
        listen_endpoint: Option<SocketAddr>,
    ) -> Result<Self> {
        let mut payload = Self {
            protocol_version,
            network_id: network_id.to_string(),
            cert,
            nonce,
            listen_endpoint,
            signature: Vec::new(),
        };
        let bytes = signable_bytes(&payload, &["signature"])?;
        payload.signature = identity.sign(&bytes);
        Ok(payload)
    }

    /// Verify the proof-of-possession signature under the cert subject key.
    pub fn verify_signature(&self) -> Result<()> {
        let bytes = signable_bytes(self, &["signature"])?;
        crypto::verify(self.cert.subject_pubkey.as_bytes(), &bytes, &self.signature)
    }
}

/// Handshake reply. Echoes the dialer's nonce to bind both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAckPayload {
    pub cert: JoinCertificate,
    #[serde(with = "crate::types::hexbytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::types::hexbytes")]
    pub echo_nonce: Vec<u8>,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

impl HandshakeAckPayload {
    pub fn new(
        identity: &Keypair,
        cert: JoinCertificate,
        nonce: Vec<u8>,
        echo_nonce: Vec<u8>,
    ) -> Result<Self> {
        let mut payload = Self {
            cert,
            nonce,
            echo_nonce,
            signature: Vec::new(),
        };
        let bytes = signable_bytes(&payload, &["signature"])?;
        payload.signature = identity.sign(&bytes);
        Ok(payload)
    }

    pub fn verify_signature(&self) -> Result<()> {
        let bytes = signable_bytes(self, &["signature"])?;
        crypto::verify(self.cert.subject_pubkey.as_bytes(), &bytes, &self.signature)
    }
}

/// One gossiped peer sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub endpoint: SocketAddr,
    pub last_heard: u64,
}

/// Discovery response: a sample of the responder's active peers, self-signed
/// with its node key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPeerList {
    pub responder: NodeId,
    pub issued_at: u64,
    pub entries: Vec<PeerEntry>,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

/// One advertised destination in a route announcement. `metric` is the
/// sender's own hop count to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub destination: NodeId,
    pub metric: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAnnouncePayload {
    pub entries: Vec<RouteAdvert>,
}

/// Withdrawal: odd sequence numbers invalidate a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteWithdrawal {
    pub destination: NodeId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteWithdrawPayload {
    pub entries: Vec<RouteWithdrawal>,
}

/// Routed datagram. `dest == NodeId::BROADCAST` floods to every active peer,
/// gated by the `payload_id` duplicate guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPacket {
    pub dest: NodeId,
    pub source: NodeId,
    pub ttl: u32,
    #[serde(with = "hexhash")]
    pub payload_id: Hash,
    #[serde(with = "crate::types::hexbytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Handshake(HandshakePayload),
    HandshakeAck(HandshakeAckPayload),
    Ping(u64),
    Pong(u64),
    PeerListRequest,
    PeerListResponse(SignedPeerList),
    RouteAnnounce(RouteAnnouncePayload),
    RouteWithdraw(RouteWithdrawPayload),
    Data(DataPacket),
    DataForward(DataPacket),
    Control(ControlMessage),
    CrlAnnounce { sequence: u64 },
    CrlRequest { since: u64 },
    CrlPush(Crl),
}

// Stable kind codes.
pub const KIND_HANDSHAKE: u8 = 1;
pub const KIND_HANDSHAKE_ACK: u8 = 2;
pub const KIND_PING: u8 = 3;
pub const KIND_PONG: u8 = 4;
pub const KIND_PEER_LIST_REQUEST: u8 = 5;
pub const KIND_PEER_LIST_RESPONSE: u8 = 6;
pub const KIND_ROUTE_ANNOUNCE: u8 = 7;
pub const KIND_ROUTE_WITHDRAW: u8 = 8;
pub const KIND_DATA: u8 = 9;
pub const KIND_DATA_FORWARD: u8 = 10;
pub const KIND_CONTROL: u8 = 11;
pub const KIND_CRL_ANNOUNCE: u8 = 12;
pub const KIND_CRL_REQUEST: u8 = 13;
pub const KIND_CRL_PUSH: u8 = 14;

impl Message {
    pub fn kind_code(&self) -> u8 {
        match self {
            Message::Handshake(_) => KIND_HANDSHAKE,
            Message::HandshakeAck(_) => KIND_HANDSHAKE_ACK,
            Message::Ping(_) => KIND_PING,
            Message::Pong(_) => KIND_PONG,
            Message::PeerListRequest => KIND_PEER_LIST_REQUEST,
            Message::PeerListResponse(_) => KIND_PEER_LIST_RESPONSE,
            Message::RouteAnnounce(_) => KIND_ROUTE_ANNOUNCE,
            Message::RouteWithdraw(_) => KIND_ROUTE_WITHDRAW,
            Message::Data(_) => KIND_DATA,
            Message::DataForward(_) => KIND_DATA_FORWARD,
            Message::Control(_) => KIND_CONTROL,
            Message::CrlAnnounce { .. } => KIND_CRL_ANNOUNCE,
            Message::CrlRequest { .. } => KIND_CRL_REQUEST,
            Message::CrlPush(_) => KIND_CRL_PUSH,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshakeack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::PeerListRequest => "peerlistrequest",
            Message::PeerListResponse(_) => "peerlistresponse",
            Message::RouteAnnounce(_) => "routeannounce",
            Message::RouteWithdraw(_) => "routewithdraw",
            Message::Data(_) => "data",
            Message::DataForward(_) => "dataforward",
            Message::Control(_) => "control",
            Message::CrlAnnounce { .. } => "crlannounce",
            Message::CrlRequest { .. } => "crlrequest",
            Message::CrlPush(_) => "crlpush",
        }
    }

    /// Only the handshake exchange may cross a connection that is not yet
    /// established.
    pub fn allowed_pre_handshake(&self) -> bool {
        matches!(self, Message::Handshake(_) | Message::HandshakeAck(_))
    }

    /// Control-plane frames are exempt from send-queue overflow drops.
    pub fn is_control(&self) -> bool {
        matches!(self, Message::Control(_))
    }

    /// Per-kind payload cap, tighter than the outer frame limit.
    pub fn max_size_for_kind(kind: u8) -> usize {
        match kind {
            KIND_HANDSHAKE | KIND_HANDSHAKE_ACK => 8 * 1024,
            KIND_PING | KIND_PONG => 64,
            KIND_PEER_LIST_REQUEST => 64,
            KIND_PEER_LIST_RESPONSE => 64 * 1024,
            KIND_ROUTE_ANNOUNCE | KIND_ROUTE_WITHDRAW => 256 * 1024,
            KIND_DATA | KIND_DATA_FORWARD => MESSAGE_SIZE_LIMIT,
            KIND_CONTROL => 64 * 1024,
            KIND_CRL_ANNOUNCE | KIND_CRL_REQUEST => 64,
            KIND_CRL_PUSH => 512 * 1024,
            _ => MESSAGE_SIZE_LIMIT,
        }
    }

    /// Serialize to `(kind, canonical JSON payload)`.
    pub fn encode(&self) -> Result<(u8, Vec<u8>)> {
        let payload = match self {
            Message::Handshake(p) => serde_json::to_vec(p),
            Message::HandshakeAck(p) => serde_json::to_vec(p),
            Message::Ping(nonce) | Message::Pong(nonce) => serde_json::to_vec(nonce),
            Message::PeerListRequest => Ok(b"{}".to_vec()),
            Message::PeerListResponse(p) => serde_json::to_vec(p),
            Message::RouteAnnounce(p) => serde_json::to_vec(p),
            Message::RouteWithdraw(p) => serde_json::to_vec(p),
            Message::Data(p) | Message::DataForward(p) => serde_json::to_vec(p),
            Message::Control(p) => serde_json::to_vec(p),
            Message::CrlAnnounce { sequence } => serde_json::to_vec(&Seq { v: *sequence }),
            Message::CrlRequest { since } => serde_json::to_vec(&Seq { v: *since }),
            Message::CrlPush(p) => serde_json::to_vec(p),
        }
        .map_err(|e| Error::Canonicalization(e.to_string()))?;
        Ok((self.kind_code(), payload))
    }

    /// Decode a frame payload. `Ok(None)` for unknown kinds.
    pub fn decode(kind: u8, payload: &[u8]) -> Result<Option<Message>> {
        fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
            serde_json::from_slice(payload)
                .map_err(|e| Error::ProtocolViolation(format!("malformed payload: {e}")))
        }

        if payload.len() > Self::max_size_for_kind(kind) {
            return Err(Error::ProtocolViolation(format!(
                "payload over kind cap: kind={kind} len={}",
                payload.len()
            )));
        }

        let message = match kind {
            KIND_HANDSHAKE => Message::Handshake(parse(payload)?),
            KIND_HANDSHAKE_ACK => Message::HandshakeAck(parse(payload)?),
            KIND_PING => Message::Ping(parse(payload)?),
            KIND_PONG => Message::Pong(parse(payload)?),
            KIND_PEER_LIST_REQUEST => Message::PeerListRequest,
            KIND_PEER_LIST_RESPONSE => Message::PeerListResponse(parse(payload)?),
            KIND_ROUTE_ANNOUNCE => Message::RouteAnnounce(parse(payload)?),
            KIND_ROUTE_WITHDRAW => Message::RouteWithdraw(parse(payload)?),
            KIND_DATA => Message::Data(parse(payload)?),
            KIND_DATA_FORWARD => Message::DataForward(parse(payload)?),
            KIND_CONTROL => Message::Control(parse(payload)?),
            KIND_CRL_ANNOUNCE => Message::CrlAnnounce {
                sequence: parse::<Seq>(payload)?.v,
            },
            KIND_CRL_REQUEST => Message::CrlRequest {
                since: parse::<Seq>(payload)?.v,
            },
            KIND_CRL_PUSH => Message::CrlPush(parse(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[derive(Serialize, Deserialize)]
struct Seq {
    v: u64,
}
