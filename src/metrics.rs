//! Runtime counters and the health check.

use crate::error::{ERROR_KINDS, Error};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter set shared across all subsystems.
///
/// Every error kind has its own counter; hot-path events get dedicated ones.
#[derive(Debug, Default)]
pub struct Metrics {
    errors: [AtomicU64; 17],

    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub packets_delivered: AtomicU64,
    pub packets_forwarded: AtomicU64,
    pub broadcasts_flooded: AtomicU64,
    pub routes_installed: AtomicU64,
    pub routes_withdrawn: AtomicU64,
    pub control_accepted: AtomicU64,
    pub control_rejected: AtomicU64,
    pub crl_updates: AtomicU64,
    pub cert_renewals: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub handshakes_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: &Error) {
        self.errors[err.kind_index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        ERROR_KINDS
            .iter()
            .position(|k| *k == kind)
            .map(|i| self.errors[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of all error counters, in `ERROR_KINDS` order.
    pub fn error_counts(&self) -> Vec<(&'static str, u64)> {
        ERROR_KINDS
            .iter()
            .enumerate()
            .map(|(i, k)| (*k, self.errors[i].load(Ordering::Relaxed)))
            .collect()
    }
}

/// Health tri-state surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Inputs sampled by the node when a health check runs.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    /// Seconds until the join certificate expires.
    pub cert_expires_in: u64,
    pub consecutive_renewal_failures: u32,
    pub connected_peers: usize,
    /// Seconds since the local CRL was last refreshed (u64::MAX if never).
    pub crl_age: u64,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: HealthState,
    pub concerns: Vec<String>,
}

/// Fold current conditions into the tri-state plus concern strings.
pub fn assess(inputs: &HealthInputs) -> HealthReport {
    let mut concerns = Vec::new();
    let mut degraded = false;
    let mut unhealthy = false;

    if inputs.cert_expires_in == 0 {
        concerns.push("certificate expired".to_string());
        unhealthy = true;
    } else if inputs.cert_expires_in < 6 * 3600 {
        concerns.push(format!(
            "cert expires in {}h{}",
            inputs.cert_expires_in / 3600,
            if inputs.consecutive_renewal_failures > 0 {
                ", renewal failing"
            } else {
                ""
            }
        ));
        degraded = true;
    } else if inputs.consecutive_renewal_failures > 0 {
        concerns.push(format!(
            "certificate renewal failing ({} attempts)",
            inputs.consecutive_renewal_failures
        ));
        degraded = true;
    }

    if inputs.connected_peers == 0 {
        concerns.push("no connected peers".to_string());
        unhealthy = true;
    }

    if inputs.crl_age == u64::MAX {
        concerns.push("no CRL received yet".to_string());
        degraded = true;
    } else if inputs.crl_age > 24 * 3600 {
        concerns.push(format!("CRL stale for {}h", inputs.crl_age / 3600));
        degraded = true;
    }

    let state = if unhealthy {
        HealthState::Unhealthy
    } else if degraded {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    };

    HealthReport { state, concerns }
}
