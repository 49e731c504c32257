//! The genesis block: the network constitution every node embeds.

use crate::canonical::signable_bytes;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::types::hexhash;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Network Authority key with its validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityKey {
    #[serde(with = "crate::types::hexbytes")]
    pub pubkey: Vec<u8>,
    pub valid_from: u64,
    pub valid_to: u64,
}

impl AuthorityKey {
    pub fn key_bytes(&self) -> Result<[u8; 32]> {
        self.pubkey
            .as_slice()
            .try_into()
            .map_err(|_| Error::UnknownIssuer("authority key must be 32 bytes".into()))
    }

    pub fn key_id(&self) -> Result<String> {
        Ok(crypto::key_id(&self.key_bytes()?))
    }
}

/// Reference to the policy manifest published at genesis time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRef {
    #[serde(with = "hexhash")]
    pub hash: [u8; 32],
    pub url: String,
}

/// Well-known bootstrap peer listed in genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorEndpoint {
    pub endpoint: SocketAddr,
}

/// Root-signature entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisSignature {
    pub key_id: String,
    #[serde(with = "crate::types::hexbytes")]
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisBlock {
    pub network_name: String,
    pub version: u32,
    #[serde(with = "crate::types::hexbytes")]
    pub root_public_key: Vec<u8>,
    pub network_authority: AuthorityKey,
    pub allowed_crypto_suites: Vec<String>,
    pub allowed_transports: Vec<String>,
    pub policy_manifest_ref: PolicyRef,
    pub bootstrap_anchors: Vec<AnchorEndpoint>,
    pub signatures: Vec<GenesisSignature>,
}

impl GenesisBlock {
    /// The `(network_name, version)` pair as the wire-level network id.
    pub fn network_id(&self) -> String {
        format!("{}:{}", self.network_name, self.version)
    }

    pub fn root_key_bytes(&self) -> Result<[u8; 32]> {
        self.root_public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::UnknownIssuer("root key must be 32 bytes".into()))
    }

    /// The NA verifying key all certificates, CRLs and policies chain to.
    pub fn authority_key(&self) -> Result<[u8; 32]> {
        self.network_authority.key_bytes()
    }

    fn signed_payload(&self) -> Result<Vec<u8>> {
        signable_bytes(self, &["signatures"])
    }

    /// Import-time verification: the Root Sovereign signature must check out
    /// under its declared key id, and the NA validity window must be open,
    /// at both ends.
    pub fn verify(&self, now: u64) -> Result<()> {
        let root = self.root_key_bytes()?;
        let root_id = crypto::key_id(&root);
        let payload = self.signed_payload()?;

        let entry = self
            .signatures
            .iter()
            .find(|s| s.key_id == root_id)
            .ok_or_else(|| Error::UnknownIssuer("no root signature present".into()))?;
        crypto::verify(&root, &payload, &entry.sig)?;

        if now < self.network_authority.valid_from {
            return Err(Error::ExpiredCert);
        }
        if self.network_authority.valid_to <= now {
            return Err(Error::ExpiredCert);
        }
        if self.network_authority.key_bytes().is_err() {
            return Err(Error::UnknownIssuer("malformed authority key".into()));
        }
        Ok(())
    }

    /// Sign a genesis block with the root key (authoring-side helper).
    pub fn sign_with_root(&mut self, root: &Keypair) -> Result<()> {
        let payload = self.signed_payload()?;
        self.signatures = vec![GenesisSignature {
            key_id: crypto::key_id(&root.public_bytes()),
            sig: root.sign(&payload),
        }];
        Ok(())
    }
}
