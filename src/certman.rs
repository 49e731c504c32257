//! Certificate manager: keeps the node's join certificate valid.

use crate::crypto::Keypair;
use crate::error::Result;
use crate::trust::authority::{AuthorityClient, RenewRequest};
use crate::trust::cert::JoinCertificate;
use crate::trust::crl::CrlStore;
use crate::trust::genesis::GenesisBlock;
use crate::types::now;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Renewal retry delays, capped at the last entry.
const RENEWAL_BACKOFF_SECS: [u64; 5] = [30, 60, 120, 300, 600];

/// Failures tolerated before an expired certificate becomes fatal.
const MAX_RENEWAL_FAILURES: u32 = 5;

#[derive(Debug)]
pub enum CertEvent {
    /// A renewal succeeded; handshakes now present this certificate.
    Renewed(JoinCertificate),
    RenewalFailed {
        attempt: u32,
        error: String,
    },
    /// Renewal failed permanently with the certificate expired; the node
    /// must shut down.
    Expired,
}

pub struct CertManager {
    identity: Arc<Keypair>,
    cert: Arc<RwLock<JoinCertificate>>,
    genesis: Arc<GenesisBlock>,
    crl: Arc<CrlStore>,
    authority: Arc<dyn AuthorityClient>,
    renewal_ratio: f64,
    consecutive_failures: Arc<AtomicU32>,
    events: mpsc::Sender<CertEvent>,
}

impl CertManager {
    pub fn new(
        identity: Arc<Keypair>,
        cert: Arc<RwLock<JoinCertificate>>,
        genesis: Arc<GenesisBlock>,
        crl: Arc<CrlStore>,
        authority: Arc<dyn AuthorityClient>,
        renewal_ratio: f64,
        events: mpsc::Sender<CertEvent>,
    ) -> Self {
        Self {
            identity,
            cert,
            genesis,
            crl,
            authority,
            renewal_ratio,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            events,
        }
    }

    /// Shared failure counter, read by the health check.
    pub fn failure_counter(&self) -> Arc<AtomicU32> {
        self.consecutive_failures.clone()
    }

    fn current(&self) -> JoinCertificate {
        self.cert.read().expect("cert lock").clone()
    }

    /// The shutdown rule: the Nth consecutive failure at or after expiry.
    fn is_fatal(attempt: u32, at: u64, expires_at: u64) -> bool {
        attempt >= MAX_RENEWAL_FAILURES && at >= expires_at
    }

    async fn try_renew(&self) -> Result<JoinCertificate> {
        let nonce = self.authority.renewal_nonce().await?;
        let request = RenewRequest::new(&self.identity, self.current(), nonce);
        let renewed = self.authority.renew(&request).await?;
        renewed.validate(&self.genesis, self.crl.current().as_ref(), now())?;
        Ok(renewed)
    }

    /// Renewal timer task. Fires at `renewal_ratio` of the certificate's
    /// lifetime, retries with backoff, and escalates to `Expired` per the
    /// shutdown rule.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let due = self.current().renewal_due_at(self.renewal_ratio);
            let wait = due.saturating_sub(now());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
            }

            let mut attempt = 0u32;
            loop {
                match self.try_renew().await {
                    Ok(renewed) => {
                        info!(
                            serial = renewed.serial,
                            expires_at = renewed.expires_at,
                            "certificate renewed"
                        );
                        *self.cert.write().expect("cert lock") = renewed.clone();
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                        if self.events.send(CertEvent::Renewed(renewed)).await.is_err() {
                            return;
                        }
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        self.consecutive_failures.store(attempt, Ordering::SeqCst);
                        warn!(attempt, "certificate renewal failed: {}", e);
                        let _ = self
                            .events
                            .send(CertEvent::RenewalFailed {
                                attempt,
                                error: e.to_string(),
                            })
                            .await;

                        if Self::is_fatal(attempt, now(), self.current().expires_at) {
                            let _ = self.events.send(CertEvent::Expired).await;
                            return;
                        }

                        let delay =
                            RENEWAL_BACKOFF_SECS[(attempt as usize - 1).min(RENEWAL_BACKOFF_SECS.len() - 1)];
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                        }
                    }
                }
            }
        }
    }
}
