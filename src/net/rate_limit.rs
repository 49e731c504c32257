//! Token-bucket rate limiting per peer.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Per-peer buckets for inbound message classes that can be flooded.
///
/// Capacities allow normal gossip cadence with generous burst headroom;
/// exceeding one is `RateLimited` misbehavior.
#[derive(Debug, Clone)]
pub struct PeerRateLimits {
    /// Peer-list responses: one per discovery interval expected.
    pub peer_lists: TokenBucket,
    /// Route announcements: one full-table announce per interval expected.
    pub route_announces: TokenBucket,
    /// CRL announce/request/push traffic.
    pub crl_messages: TokenBucket,
    /// Control-plane messages.
    pub control_messages: TokenBucket,
}

impl PeerRateLimits {
    pub fn new() -> Self {
        Self {
            peer_lists: TokenBucket::new(10.0, 0.1),
            route_announces: TokenBucket::new(20.0, 0.5),
            crl_messages: TokenBucket::new(20.0, 0.2),
            control_messages: TokenBucket::new(10.0, 0.2),
        }
    }
}

impl Default for PeerRateLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_consumes_to_zero() {
        let mut bucket = TokenBucket::new(3.0, 0.0);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[test]
    fn bucket_caps_at_capacity() {
        let mut bucket = TokenBucket::new(5.0, 1000.0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(bucket.available() <= 5.0);
    }

    #[test]
    fn burst_of_peer_lists_limited() {
        let mut limits = PeerRateLimits::new();
        let mut accepted = 0;
        for _ in 0..50 {
            if limits.peer_lists.try_consume(1.0) {
                accepted += 1;
            }
        }
        assert!(accepted <= 11);
    }
}
