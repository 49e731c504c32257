//! Persisted state layout.
//!
//! ```text
//! <data_dir>/
//!   genesis.json        signed network constitution
//!   keys/node.key       hex-encoded Ed25519 secret
//!   keys/node.pub       hex-encoded verifying key
//!   state/cert.json     current join certificate
//!   state/crl.json      latest CRL
//!   state/policy.json   latest policy manifest
//!   state/audit.log     append-only audit chain
//!   state/peers.json    peer table snapshot for warm start
//! ```

use crate::crypto::Keypair;
use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Oversized state files are rejected before deserialization.
const MAX_STATE_FILE_SIZE: u64 = 4 * 1024 * 1024;

pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir.join("keys"))?;
        fs::create_dir_all(data_dir.join("state"))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.data_dir.join("genesis.json")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("keys").join("node.key")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join("state").join("cert.json")
    }

    pub fn crl_path(&self) -> PathBuf {
        self.data_dir.join("state").join("crl.json")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.data_dir.join("state").join("policy.json")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("state").join("audit.log")
    }

    pub fn peers_path(&self) -> PathBuf {
        self.data_dir.join("state").join("peers.json")
    }

    /// Load the node identity, generating and persisting one on first run.
    pub fn load_or_create_identity(&self) -> Result<Keypair> {
        let key_path = self.key_path();
        if key_path.exists() {
            return Keypair::load(&key_path);
        }
        let keypair = Keypair::generate();
        keypair.save(&self.data_dir.join("keys"))?;
        info!("generated node identity {}", keypair.node_id());
        Ok(keypair)
    }

    /// Read a JSON state file; `None` when it does not exist yet.
    pub fn load_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let meta = fs::metadata(path)?;
        if meta.len() > MAX_STATE_FILE_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "{}: state file too large ({} bytes)",
                path.display(),
                meta.len()
            )));
        }
        let data = fs::read(path)?;
        let value = serde_json::from_slice(&data)
            .map_err(|e| Error::Canonicalization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(value))
    }

    /// Write a JSON state file atomically (write-then-rename).
    pub fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Canonicalization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
