//! Signed operational policy published by the Network Authority.

use crate::canonical::signable_bytes;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::trust::genesis::GenesisBlock;
use serde::{Deserialize, Serialize};

/// Routing parameters carried in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub preferred_transports: Vec<String>,
    pub max_hops: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyManifest {
    pub policy_id: u64,
    pub issued_at: u64,
    pub issued_by: String,
    pub min_client_version: String,
    pub allowed_ports: Vec<u16>,
    pub allowed_services: Vec<String>,
    pub routing: RoutingPolicy,
    #[serde(with = "crate::types::hexbytes")]
    pub signature: Vec<u8>,
}

impl PolicyManifest {
    fn signed_payload(&self) -> Result<Vec<u8>> {
        signable_bytes(self, &["signature"])
    }

    /// Authority-side issuance helper.
    pub fn issue(
        authority: &Keypair,
        policy_id: u64,
        issued_at: u64,
        max_hops: u32,
    ) -> Result<Self> {
        let mut manifest = Self {
            policy_id,
            issued_at,
            issued_by: crypto::key_id(&authority.public_bytes()),
            min_client_version: "0.1.0".into(),
            allowed_ports: vec![7400],
            allowed_services: vec!["mesh".into()],
            routing: RoutingPolicy {
                preferred_transports: vec!["tcp".into()],
                max_hops,
            },
            signature: Vec::new(),
        };
        let payload = manifest.signed_payload()?;
        manifest.signature = authority.sign(&payload);
        Ok(manifest)
    }

    /// Verify the NA signature and issuer id against genesis.
    pub fn verify(&self, genesis: &GenesisBlock) -> Result<()> {
        let authority = genesis.authority_key()?;
        if self.issued_by != crypto::key_id(&authority) {
            return Err(Error::UnknownIssuer(self.issued_by.clone()));
        }
        let payload = self.signed_payload()?;
        crypto::verify(&authority, &payload, &self.signature)
    }

    /// Apply rule: `policy_id` is monotonically increasing per network.
    /// Equal ids are the idempotent re-apply case.
    pub fn supersedes(&self, current: Option<&PolicyManifest>) -> bool {
        current.map(|c| self.policy_id > c.policy_id).unwrap_or(true)
    }
}
