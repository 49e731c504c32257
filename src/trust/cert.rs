//! Join certificates: short-lived credentials binding a node key to roles.

use crate::canonical::signable_bytes;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::rbac::Role;
use crate::trust::crl::Crl;
use crate::trust::genesis::GenesisBlock;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCertificate {
    pub subject_pubkey: NodeId,
    pub roles: Vec<Role>,
    pub scopes: Vec<String>,
    pub network_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub serial: u64,
    pub issuer_key_id: String,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

impl JoinCertificate {
    fn signed_payload(&self) -> Result<Vec<u8>> {
        signable_bytes(self, &["signature"])
    }

    /// Issue a certificate under the NA signing key (authority-side helper,
    /// also used by tests standing in for the remote signer).
    pub fn issue(
        authority: &Keypair,
        subject: NodeId,
        roles: Vec<Role>,
        scopes: Vec<String>,
        network_id: &str,
        issued_at: u64,
        expires_at: u64,
        serial: u64,
    ) -> Result<Self> {
        let mut cert = Self {
            subject_pubkey: subject,
            roles,
            scopes,
            network_id: network_id.to_string(),
            issued_at,
            expires_at,
            serial,
            issuer_key_id: crypto::key_id(&authority.public_bytes()),
            signature: Vec::new(),
        };
        let payload = cert.signed_payload()?;
        cert.signature = authority.sign(&payload);
        Ok(cert)
    }

    /// Full validity check against the current trust chain.
    ///
    /// A certificate is currently valid iff it is signed by the NA key from
    /// genesis, `now` falls within its window (expiry boundary exclusive),
    /// the subject is not in the latest CRL, and it carries at least one
    /// role for this network.
    pub fn validate(&self, genesis: &GenesisBlock, crl: Option<&Crl>, now: u64) -> Result<()> {
        let authority = genesis.authority_key()?;
        if self.issuer_key_id != crypto::key_id(&authority) {
            return Err(Error::UnknownIssuer(self.issuer_key_id.clone()));
        }
        if self.network_id != genesis.network_id() {
            return Err(Error::UnknownIssuer(format!(
                "certificate for foreign network {}",
                self.network_id
            )));
        }
        if self.roles.is_empty() || self.expires_at <= self.issued_at {
            return Err(Error::ProtocolViolation("malformed certificate".into()));
        }

        let payload = self.signed_payload()?;
        crypto::verify(&authority, &payload, &self.signature)?;

        if now < self.issued_at || now > self.expires_at {
            return Err(Error::ExpiredCert);
        }
        if let Some(crl) = crl {
            if crl.is_revoked(&self.subject_pubkey) {
                return Err(Error::RevokedCert);
            }
        }
        Ok(())
    }

    /// Remaining lifetime at `now` (0 when expired).
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// The instant the renewal timer fires: `issued_at + lifetime * ratio`.
    pub fn renewal_due_at(&self, ratio: f64) -> u64 {
        let lifetime = self.expires_at.saturating_sub(self.issued_at);
        self.issued_at + (lifetime as f64 * ratio) as u64
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trust::crl::tests::revoking;
    use crate::trust::genesis::tests::sample as sample_genesis;
    use crate::types::now;

    pub(crate) fn issue_for(
        authority: &Keypair,
        subject: &Keypair,
        roles: &[Role],
        network_id: &str,
        issued_at: u64,
        expires_at: u64,
    ) -> JoinCertificate {
        JoinCertificate::issue(
            authority,
            subject.node_id(),
            roles.to_vec(),
            vec!["mesh:*".into()],
            network_id,
            issued_at,
            expires_at,
            1,
        )
        .unwrap()
    }

    #[test]
    fn valid_certificate_accepted() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let node = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let t = now();
        let cert = issue_for(&authority, &node, &[Role::Client], &genesis.network_id(), t - 10, t + 3600);
        assert!(cert.validate(&genesis, None, t).is_ok());
    }

    #[test]
    fn expiry_boundary_exact() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let node = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let t0 = 1_000_000;
        let cert = issue_for(&authority, &node, &[Role::Client], &genesis.network_id(), t0, t0 + 100);
        // Accepted at t-1 and at t, rejected at t+1.
        assert!(cert.validate(&genesis, None, t0 + 99).is_ok());
        assert!(cert.validate(&genesis, None, t0 + 100).is_ok());
        assert!(matches!(
            cert.validate(&genesis, None, t0 + 101),
            Err(Error::ExpiredCert)
        ));
    }

    #[test]
    fn not_yet_valid_rejected() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let node = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let cert = issue_for(&authority, &node, &[Role::Client], &genesis.network_id(), 5_000, 6_000);
        assert!(matches!(
            cert.validate(&genesis, None, 4_999),
            Err(Error::ExpiredCert)
        ));
    }

    #[test]
    fn foreign_issuer_rejected() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let rogue = Keypair::generate();
        let node = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let t = now();
        let cert = issue_for(&rogue, &node, &[Role::Client], &genesis.network_id(), t - 10, t + 3600);
        assert!(matches!(
            cert.validate(&genesis, None, t),
            Err(Error::UnknownIssuer(_))
        ));
    }

    #[test]
    fn tampered_roles_rejected() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let node = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let t = now();
        let mut cert =
            issue_for(&authority, &node, &[Role::Client], &genesis.network_id(), t - 10, t + 3600);
        cert.roles = vec![Role::Admin];
        assert!(matches!(
            cert.validate(&genesis, None, t),
            Err(Error::BadSignature(_))
        ));
    }

    #[test]
    fn revoked_subject_rejected() {
        let root = Keypair::generate();
        let authority = Keypair::generate();
        let node = Keypair::generate();
        let genesis = sample_genesis(&root, &authority);
        let t = now();
        let cert = issue_for(&authority, &node, &[Role::Client], &genesis.network_id(), t - 10, t + 3600);
        let crl = revoking(&authority, 2, &[node.node_id()], t);
        assert!(matches!(
            cert.validate(&genesis, Some(&crl), t),
            Err(Error::RevokedCert)
        ));
    }

    #[test]
    fn renewal_due_at_half_life() {
        let authority = Keypair::generate();
        let node = Keypair::generate();
        let cert = issue_for(&authority, &node, &[Role::Client], "net:1", 1_000, 1_000 + 7 * 24 * 3600);
        assert_eq!(cert.renewal_due_at(0.5), 1_000 + 7 * 24 * 3600 / 2);
    }
}
