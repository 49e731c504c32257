//! Mesh transport and peer layer.

pub mod connection;
pub mod discovery;
pub mod framing;
pub mod message;
pub mod peer;
pub mod peer_manager;
pub mod rate_limit;
pub mod transport;
pub mod types;

pub use connection::{ConnectionManager, RetryInfo};
pub use discovery::{build_peer_list, verify_peer_list};
pub use framing::SessionKey;
pub use message::{
    DataPacket, HandshakeAckPayload, HandshakePayload, Message, PeerEntry, RouteAdvert,
    RouteAnnouncePayload, RouteWithdrawPayload, RouteWithdrawal, SignedPeerList,
};
pub use peer::{PeerRecord, PeerSnapshot};
pub use peer_manager::PeerManager;
pub use rate_limit::{PeerRateLimits, TokenBucket};
pub use transport::{NetEvent, Transport, TransportConfig};
pub use types::ConnState;
