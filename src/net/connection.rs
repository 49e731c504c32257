//! Connection pool accounting: caps, dial dedup, and retry backoff.

use crate::error::{Error, Result};
use crate::net::types::{INITIAL_DIAL_BACKOFF_SECS, MAX_DIAL_BACKOFF_SECS};
use crate::types::now;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Dial retry tracking with exponential backoff: 1, 2, 4, ... 300 s,
/// reset on success.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    pub attempts: u32,
    pub last_attempt: u64,
    pub next_delay: u64,
}

impl RetryInfo {
    fn new() -> Self {
        Self {
            attempts: 0,
            last_attempt: 0,
            next_delay: INITIAL_DIAL_BACKOFF_SECS,
        }
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
        self.last_attempt = now();
        // First failure waits the initial delay; doubling starts after that.
        if self.attempts > 1 {
            self.next_delay = (self.next_delay * 2).min(MAX_DIAL_BACKOFF_SECS);
        }
    }

    fn record_success(&mut self) {
        self.attempts = 0;
        self.next_delay = INITIAL_DIAL_BACKOFF_SECS;
    }

    fn can_retry(&self, at: u64) -> bool {
        self.last_attempt == 0 || at >= self.last_attempt + self.next_delay
    }
}

/// Enforces the connection cap and deduplicates concurrent dials.
pub struct ConnectionManager {
    max_connections: usize,
    active: AtomicUsize,
    dialing: Mutex<HashSet<SocketAddr>>,
    retry: Mutex<HashMap<SocketAddr, RetryInfo>>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: AtomicUsize::new(0),
            dialing: Mutex::new(HashSet::new()),
            retry: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Reserve a slot for a new connection; `PoolFull` past the cap.
    pub fn try_acquire(&self) -> Result<()> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_connections {
                return Err(Error::PoolFull);
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) {
        // Pairs with try_acquire; never drops below zero.
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// Mark a dial in progress; false if one is already running.
    pub fn start_dialing(&self, endpoint: SocketAddr) -> bool {
        self.dialing.lock().expect("dial lock").insert(endpoint)
    }

    pub fn finish_dialing(&self, endpoint: &SocketAddr) {
        self.dialing.lock().expect("dial lock").remove(endpoint);
    }

    pub fn can_retry(&self, endpoint: &SocketAddr, at: u64) -> bool {
        self.retry
            .lock()
            .expect("retry lock")
            .get(endpoint)
            .map(|r| r.can_retry(at))
            .unwrap_or(true)
    }

    pub fn record_failure(&self, endpoint: SocketAddr) {
        self.retry
            .lock()
            .expect("retry lock")
            .entry(endpoint)
            .or_insert_with(RetryInfo::new)
            .record_failure();
    }

    pub fn record_success(&self, endpoint: &SocketAddr) {
        if let Some(info) = self.retry.lock().expect("retry lock").get_mut(endpoint) {
            info.record_success();
        }
    }

    pub fn next_retry_delay(&self, endpoint: &SocketAddr) -> u64 {
        self.retry
            .lock()
            .expect("retry lock")
            .get(endpoint)
            .map(|r| r.next_delay)
            .unwrap_or(INITIAL_DIAL_BACKOFF_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_cap_enforced() {
        let mgr = ConnectionManager::new(2);
        assert!(mgr.try_acquire().is_ok());
        assert!(mgr.try_acquire().is_ok());
        assert!(matches!(mgr.try_acquire(), Err(Error::PoolFull)));
        mgr.release();
        assert!(mgr.try_acquire().is_ok());
    }

    #[test]
    fn release_never_underflows() {
        let mgr = ConnectionManager::new(1);
        mgr.release();
        assert_eq!(mgr.active(), 0);
    }

    #[test]
    fn dial_dedup() {
        let mgr = ConnectionManager::new(8);
        let ep: SocketAddr = "10.0.0.1:7400".parse().unwrap();
        assert!(mgr.start_dialing(ep));
        assert!(!mgr.start_dialing(ep));
        mgr.finish_dialing(&ep);
        assert!(mgr.start_dialing(ep));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mgr = ConnectionManager::new(8);
        let ep: SocketAddr = "10.0.0.1:7400".parse().unwrap();

        mgr.record_failure(ep);
        assert_eq!(mgr.next_retry_delay(&ep), 1);
        mgr.record_failure(ep);
        assert_eq!(mgr.next_retry_delay(&ep), 2);
        for _ in 0..20 {
            mgr.record_failure(ep);
        }
        assert_eq!(mgr.next_retry_delay(&ep), MAX_DIAL_BACKOFF_SECS);

        mgr.record_success(&ep);
        assert_eq!(mgr.next_retry_delay(&ep), INITIAL_DIAL_BACKOFF_SECS);
    }

    #[test]
    fn failed_endpoint_waits_for_backoff() {
        let mgr = ConnectionManager::new(8);
        let ep: SocketAddr = "10.0.0.1:7400".parse().unwrap();
        mgr.record_failure(ep);
        assert!(!mgr.can_retry(&ep, now()));
        assert!(mgr.can_retry(&ep, now() + MAX_DIAL_BACKOFF_SECS));
    }
}
