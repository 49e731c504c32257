//! Length-prefixed frames with a per-session authentication tag.
//!
//! Layout: `[u8 version][u8 kind][u32 len BE][payload][16-byte tag]`.
//!
//! The tag is a truncated SHA3-256 keyed with the session secret derived
//! from both handshake nonces. Before the session exists (the handshake
//! exchange itself) the tag is an unkeyed integrity digest; identity during
//! the handshake rests on the Ed25519 signatures inside the payloads.

use crate::crypto::sha3;
use crate::error::{Error, Result};
use crate::net::types::{FRAME_HEADER_LEN, FRAME_TAG_LEN, MESSAGE_SIZE_LIMIT, PROTOCOL_VERSION};
use crate::types::Hash;
use sha3::{Digest, Sha3_256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const HANDSHAKE_TAG_CONTEXT: &[u8] = b"genesis-mesh/hs";

/// Shared secret for one established connection.
#[derive(Clone)]
pub struct SessionKey(Hash);

impl SessionKey {
    /// Both sides derive the same key: dialer nonce first.
    pub fn derive(dialer_nonce: &[u8], acceptor_nonce: &[u8], network_id: &str) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(dialer_nonce);
        hasher.update(acceptor_nonce);
        hasher.update(network_id.as_bytes());
        SessionKey(hasher.finalize().into())
    }
}

fn frame_tag(session: Option<&SessionKey>, kind: u8, payload: &[u8]) -> [u8; FRAME_TAG_LEN] {
    let mut hasher = Sha3_256::new();
    match session {
        Some(key) => hasher.update(key.0),
        None => hasher.update(sha3(HANDSHAKE_TAG_CONTEXT)),
    }
    hasher.update([kind]);
    hasher.update(payload);
    let digest: Hash = hasher.finalize().into();
    let mut tag = [0u8; FRAME_TAG_LEN];
    tag.copy_from_slice(&digest[..FRAME_TAG_LEN]);
    tag
}

/// Write one frame.
pub async fn write_frame<W>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
    session: Option<&SessionKey>,
) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > MESSAGE_SIZE_LIMIT {
        return Err(Error::ProtocolViolation(format!(
            "outbound payload too large: {}",
            payload.len()
        )));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = PROTOCOL_VERSION;
    header[1] = kind;
    header[2..6].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer
        .write_all(&frame_tag(session, kind, payload))
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, verifying version, size bound, and tag.
pub async fn read_frame<R>(
    reader: &mut R,
    session: Option<&SessionKey>,
) -> Result<(u8, Vec<u8>)>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    if header[0] != PROTOCOL_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "unsupported frame version {}",
            header[0]
        )));
    }
    let kind = header[1];
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if len > MESSAGE_SIZE_LIMIT {
        return Err(Error::ProtocolViolation(format!(
            "frame length {len} over limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let mut tag = [0u8; FRAME_TAG_LEN];
    reader.read_exact(&mut tag).await?;
    if tag != frame_tag(session, kind, &payload) {
        return Err(Error::BadSignature("frame tag mismatch".into()));
    }
    Ok((kind, payload))
}
