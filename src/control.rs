//! Signed control plane: acceptance checks, replay defense, dispatch.

use crate::canonical::signable_bytes;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::rbac::{self, ControlKind};
use crate::trust::cert::JoinCertificate;
use crate::trust::crl::{Crl, CrlStore};
use crate::trust::genesis::GenesisBlock;
use crate::trust::policy::PolicyManifest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replay cache bounds. The TTL covers the longest control validity window.
const REPLAY_CACHE_CAP: usize = 16384;
const REPLAY_CACHE_TTL_SECS: u64 = 3600;

/// Signed administrative command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub message_id: String,
    pub kind: ControlKind,
    pub scope: String,
    pub payload: serde_json::Value,
    pub issued_at: u64,
    pub expires_at: u64,
    pub issuer_cert: JoinCertificate,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

impl ControlMessage {
    fn signed_payload(&self) -> Result<Vec<u8>> {
        signable_bytes(self, &["signature"])
    }

    /// Issue a control message under the subject key of `issuer_cert`.
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        issuer: &Keypair,
        issuer_cert: JoinCertificate,
        message_id: &str,
        kind: ControlKind,
        scope: &str,
        payload: serde_json::Value,
        issued_at: u64,
        expires_at: u64,
    ) -> Result<Self> {
        let mut message = Self {
            message_id: message_id.to_string(),
            kind,
            scope: scope.to_string(),
            payload,
            issued_at,
            expires_at,
            issuer_cert,
            signature: Vec::new(),
        };
        let bytes = message.signed_payload()?;
        message.signature = issuer.sign(&bytes);
        Ok(message)
    }

    pub fn verify_signature(&self) -> Result<()> {
        let bytes = self.signed_payload()?;
        crypto::verify(
            self.issuer_cert.subject_pubkey.as_bytes(),
            &bytes,
            &self.signature,
        )
    }
}

/// Bounded message-id cache with TTL eviction.
struct ReplayCache {
    seen: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
}

impl ReplayCache {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn purge(&mut self, at: u64) {
        while let Some((id, inserted)) = self.order.front() {
            let expired = at.saturating_sub(*inserted) > REPLAY_CACHE_TTL_SECS;
            if expired || self.order.len() > REPLAY_CACHE_CAP {
                let id = id.clone();
                self.order.pop_front();
                self.seen.remove(&id);
            } else {
                break;
            }
        }
    }

    fn contains(&mut self, id: &str, at: u64) -> bool {
        self.purge(at);
        self.seen.contains_key(id)
    }

    fn insert(&mut self, id: &str, at: u64) {
        self.purge(at);
        self.seen.insert(id.to_string(), at);
        self.order.push_back((id.to_string(), at));
    }
}

/// What an accepted control message does to node state.
#[derive(Debug)]
pub enum ControlAction {
    /// Verified manifest ready to apply and persist.
    ApplyPolicy(PolicyManifest),
    /// Authority-issued revocation update for the CRL store.
    ApplyCrl(Crl),
    /// Begin graceful drain.
    Shutdown,
    /// Liveness probe from an anchor; no state change.
    Acknowledge,
}

/// Applies the six acceptance checks in order, then maps the payload onto a
/// [`ControlAction`]. Audit and reputation consequences stay with the node
/// event loop.
pub struct ControlHandler {
    genesis: Arc<GenesisBlock>,
    crl: Arc<CrlStore>,
    replay: Mutex<ReplayCache>,
}

impl ControlHandler {
    pub fn new(genesis: Arc<GenesisBlock>, crl: Arc<CrlStore>) -> Self {
        Self {
            genesis,
            crl,
            replay: Mutex::new(ReplayCache::new()),
        }
    }

    pub fn accept(&self, message: &ControlMessage, now: u64) -> Result<ControlAction> {
        // 1. Issuer certificate chains to the trust root and is live.
        message
            .issuer_cert
            .validate(&self.genesis, self.crl.current().as_ref(), now)?;

        // 2 + 3. Role authorizes this kind over this scope.
        if !rbac::authorizes(&message.issuer_cert.roles, message.kind, &message.scope) {
            return Err(Error::UnauthorizedRole(format!(
                "{} over {}",
                message.kind.as_str(),
                message.scope
            )));
        }

        // 4. Signature over the canonical bytes under the subject key.
        message.verify_signature()?;

        // 5. Message validity window.
        if now < message.issued_at || now > message.expires_at {
            return Err(Error::ProtocolViolation(
                "control message outside validity window".into(),
            ));
        }

        // 6. Replay defense.
        {
            let mut replay = self.replay.lock().expect("replay lock");
            if replay.contains(&message.message_id, now) {
                return Err(Error::ReplayDetected(message.message_id.clone()));
            }
        }

        let action = self.dispatch(message)?;

        // Only a fully-accepted message consumes its id; a rejected one may
        // be retried by the issuer.
        self.replay
            .lock()
            .expect("replay lock")
            .insert(&message.message_id, now);
        Ok(action)
    }

    fn dispatch(&self, message: &ControlMessage) -> Result<ControlAction> {
        match message.kind {
            ControlKind::PolicyUpdate => {
                let manifest: PolicyManifest = serde_json::from_value(message.payload.clone())
                    .map_err(|e| {
                        Error::ProtocolViolation(format!("malformed policy payload: {e}"))
                    })?;
                manifest.verify(&self.genesis)?;
                Ok(ControlAction::ApplyPolicy(manifest))
            }
            ControlKind::Revoke | ControlKind::CrlPush => {
                let crl: Crl =
                    serde_json::from_value(message.payload.clone()).map_err(|e| {
                        Error::ProtocolViolation(format!("malformed CRL payload: {e}"))
                    })?;
                crl.verify(&self.genesis)?;
                Ok(ControlAction::ApplyCrl(crl))
            }
            ControlKind::Shutdown => Ok(ControlAction::Shutdown),
            ControlKind::Ping => Ok(ControlAction::Acknowledge),
        }
    }
}
