//! Certificate revocation list and its authoritative local store.

use crate::canonical::signable_bytes;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::trust::genesis::GenesisBlock;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    pub subject_pubkey: NodeId,
    pub reason: String,
    pub revoked_at: u64,
}

/// Signed, monotonically-sequenced revocation snapshot.
///
/// The latest CRL is authoritative: it carries the full revocation set, not
/// a delta, and a higher sequence replaces the previous list wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crl {
    pub sequence: u64,
    pub issued_at: u64,
    pub revocations: Vec<Revocation>,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

impl Crl {
    fn signed_payload(&self) -> Result<Vec<u8>> {
        signable_bytes(self, &["signature"])
    }

    /// Authority-side issuance helper (also the test stand-in for the NA).
    pub fn issue(
        authority: &Keypair,
        sequence: u64,
        revocations: Vec<Revocation>,
        issued_at: u64,
    ) -> Result<Self> {
        let mut crl = Self {
            sequence,
            issued_at,
            revocations,
            signature: Vec::new(),
        };
        let payload = crl.signed_payload()?;
        crl.signature = authority.sign(&payload);
        Ok(crl)
    }

    /// Verify the NA signature against the genesis-embedded authority key.
    pub fn verify(&self, genesis: &GenesisBlock) -> Result<()> {
        let authority = genesis.authority_key()?;
        let payload = self.signed_payload()?;
        crypto::verify(&authority, &payload, &self.signature)
    }

    pub fn is_revoked(&self, subject: &NodeId) -> bool {
        self.revocations.iter().any(|r| r.subject_pubkey == *subject)
    }
}

/// The node's single authoritative CRL, keyed by sequence.
pub struct CrlStore {
    current: RwLock<Option<Crl>>,
}

impl CrlStore {
    pub fn new(initial: Option<Crl>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Sequence of the held CRL; 0 when none has been received.
    pub fn sequence(&self) -> u64 {
        self.current
            .read()
            .expect("crl lock poisoned")
            .as_ref()
            .map(|c| c.sequence)
            .unwrap_or(0)
    }

    pub fn current(&self) -> Option<Crl> {
        self.current.read().expect("crl lock poisoned").clone()
    }

    pub fn is_revoked(&self, subject: &NodeId) -> bool {
        self.current
            .read()
            .expect("crl lock poisoned")
            .as_ref()
            .map(|c| c.is_revoked(subject))
            .unwrap_or(false)
    }

    /// Replace the held CRL with a validly-signed, strictly-higher-sequence
    /// one. Returns the subjects that are newly revoked relative to the
    /// previous list.
    pub fn apply(&self, crl: Crl, genesis: &GenesisBlock) -> Result<Vec<NodeId>> {
        crl.verify(genesis)?;

        let mut guard = self.current.write().expect("crl lock poisoned");
        let local_seq = guard.as_ref().map(|c| c.sequence).unwrap_or(0);
        if crl.sequence <= local_seq {
            return Err(Error::ProtocolViolation(format!(
                "stale CRL sequence {} (local {})",
                crl.sequence, local_seq
            )));
        }

        let newly_revoked: Vec<NodeId> = crl
            .revocations
            .iter()
            .filter(|r| {
                guard
                    .as_ref()
                    .map(|prev| !prev.is_revoked(&r.subject_pubkey))
                    .unwrap_or(true)
            })
            .map(|r| r.subject_pubkey)
            .collect();

        info!(
            sequence = crl.sequence,
            revocations = crl.revocations.len(),
            new = newly_revoked.len(),
            "CRL updated"
        );
        *guard = Some(crl);
        Ok(newly_revoked)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trust::genesis::tests::sample as sample_genesis;
    use crate::types::now;

    pub(crate) fn revoking(
        authority: &Keypair,
        sequence: u64,
        subjects: &[NodeId],
        at: u64,
    ) -> Crl {
        let revocations = subjects
            .iter()
            .map(|s| Revocation {
                subject_pubkey: *s,
                reason: "compromised".into(),
                revoked_at: at,
            })
            .collect();
        Crl::issue(authority, sequence, revocations, at).unwrap()
    }

    #[test]
    fn higher_sequence_replaces() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let victim = NodeId([9u8; 32]);
        let store = CrlStore::new(None);

        let crl1 = revoking(&authority, 1, &[], now());
        assert!(store.apply(crl1, &genesis).unwrap().is_empty());
        assert_eq!(store.sequence(), 1);

        let crl2 = revoking(&authority, 2, &[victim], now());
        let newly = store.apply(crl2, &genesis).unwrap();
        assert_eq!(newly, vec![victim]);
        assert!(store.is_revoked(&victim));
    }

    #[test]
    fn lower_or_equal_sequence_rejected() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let store = CrlStore::new(None);

        store
            .apply(revoking(&authority, 5, &[], now()), &genesis)
            .unwrap();
        assert!(store.apply(revoking(&authority, 5, &[], now()), &genesis).is_err());
        assert!(store.apply(revoking(&authority, 4, &[], now()), &genesis).is_err());
        assert_eq!(store.sequence(), 5);
    }

    #[test]
    fn foreign_signature_rejected() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let rogue = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let store = CrlStore::new(None);

        let crl = revoking(&rogue, 1, &[NodeId([1u8; 32])], now());
        assert!(matches!(
            store.apply(crl, &genesis),
            Err(Error::BadSignature(_))
        ));
        assert_eq!(store.sequence(), 0);
    }

    #[test]
    fn revocations_survive_replacement() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let victim = NodeId([7u8; 32]);
        let other = NodeId([8u8; 32]);
        let store = CrlStore::new(None);

        store
            .apply(revoking(&authority, 1, &[victim], now()), &genesis)
            .unwrap();
        // The authoritative snapshot keeps prior entries.
        let newly = store
            .apply(revoking(&authority, 2, &[victim, other], now()), &genesis)
            .unwrap();
        assert_eq!(newly, vec![other]);
        assert!(store.is_revoked(&victim));
        assert!(store.is_revoked(&other));
    }
}
