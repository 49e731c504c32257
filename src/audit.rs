//! Tamper-evident audit log.
//!
//! Every security-relevant event is appended to a hash chain: each event
//! commits to its predecessor's hash, so truncation or in-place edits are
//! detectable at exactly the damaged index. The chain is verified in full
//! when the log is opened; a broken chain is fatal for the node.

use crate::canonical::{signable_bytes, to_canonical_bytes};
use crate::crypto::sha3_concat;
use crate::error::{Error, Result};
use crate::types::{Hash, hexhash, now};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    CertIssued,
    CertRenewed,
    CertRevoked,
    CertExpired,
    NodeStarted,
    NodeStopped,
    NodeJoined,
    NodeLeft,
    NodeBlacklisted,
    ConnEstablished,
    ConnFailed,
    ConnClosed,
    ControlReceived,
    ControlAccepted,
    ControlRejected,
    PolicyApplied,
    AuthSuccess,
    AuthFailure,
    SignatureInvalid,
    CrlUpdated,
    CrlInvalidSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub index: u64,
    #[serde(with = "hexhash")]
    pub prev_hash: Hash,
    pub timestamp: u64,
    pub kind: AuditKind,
    pub actor: String,
    pub subject: String,
    pub detail: String,
    #[serde(with = "hexhash")]
    pub this_hash: Hash,
}

impl AuditEvent {
    /// `this_hash = H(prev_hash ‖ canonical(fields except this_hash))`.
    fn compute_hash(&self) -> Result<Hash> {
        let body = signable_bytes(self, &["this_hash"])?;
        Ok(sha3_concat(&self.prev_hash, &body))
    }
}

struct Inner {
    file: File,
    next_index: u64,
    tail_hash: Hash,
}

/// Append-only audit chain. Single writer; the lock is always the last one
/// acquired and the first released in any lock ordering.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Open (creating if absent) and verify the whole chain.
    pub fn open(path: &Path) -> Result<Self> {
        let (next_index, tail_hash) = if path.exists() {
            let events = read_and_verify(path)?;
            match events.last() {
                Some(last) => (last.index + 1, last.this_hash),
                None => (0, [0u8; 32]),
            }
        } else {
            (0, [0u8; 32])
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                next_index,
                tail_hash,
            }),
        })
    }

    /// Append one event; returns its index.
    pub fn append(
        &self,
        kind: AuditKind,
        actor: &str,
        subject: &str,
        detail: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().expect("audit lock poisoned");
        let mut event = AuditEvent {
            index: inner.next_index,
            prev_hash: inner.tail_hash,
            timestamp: now(),
            kind,
            actor: actor.to_string(),
            subject: subject.to_string(),
            detail: detail.to_string(),
            this_hash: [0u8; 32],
        };
        event.this_hash = event.compute_hash()?;

        let mut line = to_canonical_bytes(&event)?;
        line.push(b'\n');
        inner.file.write_all(&line)?;
        inner.file.flush()?;

        inner.tail_hash = event.this_hash;
        inner.next_index += 1;
        Ok(event.index)
    }

    /// Index of the next event to be written.
    pub fn next_index(&self) -> u64 {
        self.inner.lock().expect("audit lock poisoned").next_index
    }
}

/// Verify a chain file and return its events.
///
/// Fails with `ChainBroken(i)` at the first index whose hash or link does
/// not check out; events before `i` are known good.
pub fn read_and_verify(path: &Path) -> Result<Vec<AuditEvent>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut prev_hash: Hash = [0u8; 32];

    for (i, line) in reader.lines().enumerate() {
        let index = i as u64;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent =
            serde_json::from_str(&line).map_err(|_| Error::ChainBroken(index))?;

        if event.index != index || event.prev_hash != prev_hash {
            return Err(Error::ChainBroken(index));
        }
        let recomputed = event.compute_hash().map_err(|_| Error::ChainBroken(index))?;
        if recomputed != event.this_hash {
            return Err(Error::ChainBroken(index));
        }
        prev_hash = event.this_hash;
        events.push(event);
    }
    Ok(events)
}
