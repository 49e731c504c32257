//! Ed25519 signing plus SHA3-256 hashing.
//!
//! All mesh signatures are Ed25519 over canonical bytes (see `canonical`).

use crate::error::{Error, Result};
use crate::types::{Hash, NodeId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use std::fs;
use std::path::Path;

pub const PUBKEY_SIZE: usize = 32;
pub const SIG_SIZE: usize = 64;

/// Node identity keypair.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The node's mesh identity is its verifying key.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.public_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Load from `keys/node.key` (hex-encoded 32-byte secret).
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let raw = hex::decode(text.trim())
            .map_err(|_| Error::Config(format!("{}: invalid key encoding", path.display())))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::Config(format!("{}: key must be 32 bytes", path.display())))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Write `node.key` and `node.pub` into the keys directory.
    pub fn save(&self, keys_dir: &Path) -> Result<()> {
        fs::create_dir_all(keys_dir)?;
        fs::write(keys_dir.join("node.key"), hex::encode(self.secret_bytes()))?;
        fs::write(keys_dir.join("node.pub"), hex::encode(self.public_bytes()))?;
        Ok(())
    }
}

/// Verify an Ed25519 signature under a raw 32-byte verifying key.
pub fn verify(pubkey: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(pubkey)
        .map_err(|_| Error::BadSignature("malformed public key".into()))?;
    let sig = Signature::from_slice(signature)
        .map_err(|_| Error::BadSignature("malformed signature".into()))?;
    key.verify(message, &sig)
        .map_err(|_| Error::BadSignature("signature verification failed".into()))
}

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

pub fn sha3_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Key identifier: hex of SHA3-256 over the raw public key bytes.
pub fn key_id(pubkey: &[u8; 32]) -> String {
    hex::encode(sha3(pubkey))
}
