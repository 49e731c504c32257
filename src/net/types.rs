//! Wire-level constants and connection states.
//!
//! Limits are explicit so memory usage stays bounded no matter what a remote
//! peer sends; per-kind payload caps live next to the message definitions.

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Frame format version. Increment on breaking wire changes; frames with a
/// different version byte are a protocol violation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default TCP port for the mesh transport.
pub const DEFAULT_PORT: u16 = 7400;

// =============================================================================
// SIZE LIMITS
// =============================================================================

/// Outer cap on any frame payload (1 MB). Individual kinds carry tighter
/// caps; see `Message::max_size_for_kind`.
pub const MESSAGE_SIZE_LIMIT: usize = 1024 * 1024;

/// Frame header: version byte, kind byte, payload length (u32 BE).
pub const FRAME_HEADER_LEN: usize = 6;

/// Truncated keyed-SHA3 authentication tag appended to every frame.
pub const FRAME_TAG_LEN: usize = 16;

// =============================================================================
// TIMEOUTS & LIVENESS
// =============================================================================
// Handshake and ping cadence are configuration (defaults 10 s and 15 s);
// the bounds below are not operator-tunable.

/// A connection with no inbound frame for this long is failed.
pub const IDLE_READ_TIMEOUT_SECS: u64 = 30;

/// Two pings may be outstanding before the connection is failed, which at
/// the default 15 s ping interval means 60 s without a pong.
pub const MAX_MISSED_PONGS: u32 = 2;

/// Cap on flushing enqueued messages during graceful drain.
pub const DRAIN_FLUSH_SECS: u64 = 5;

// =============================================================================
// DIAL RETRY
// =============================================================================

/// First retry delay after a failed dial; doubles per failure.
pub const INITIAL_DIAL_BACKOFF_SECS: u64 = 1;

/// Retry delay cap.
pub const MAX_DIAL_BACKOFF_SECS: u64 = 300;

// =============================================================================
// REPUTATION
// =============================================================================

/// Reputation of a freshly-sighted peer.
pub const REPUTATION_START: f64 = 0.5;

/// Increment per successful interaction (handshake, pong, valid announce).
pub const REPUTATION_REWARD: f64 = 0.02;

/// Decrement per misbehavior (bad signature, invalid route, TTL abuse).
pub const REPUTATION_PENALTY: f64 = 0.1;

/// First blacklist duration; doubles per recurrence.
pub const BLACKLIST_BASE_SECS: u64 = 60;

/// Blacklist duration cap (1 h).
pub const BLACKLIST_MAX_SECS: u64 = 3600;

// =============================================================================
// SEND QUEUE
// =============================================================================

/// Per-connection send queue bound. Overflow drops the oldest non-Control
/// message; a queue saturated with Control traffic fails the connection.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Connection lifecycle.
///
/// ```text
/// Dialing → Handshaking → Established → Draining → Closed
///     \          \             \
///      └──────────┴─────────────┴────→ Failed   (timeout, framing, auth)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Dialing,
    Handshaking,
    Established,
    Draining,
    Closed,
    Failed,
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ConnState::Closed.is_terminal());
        assert!(ConnState::Failed.is_terminal());
        assert!(!ConnState::Established.is_terminal());
        assert!(!ConnState::Draining.is_terminal());
    }
}
