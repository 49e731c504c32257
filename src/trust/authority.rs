//! Client for the Network Authority's HTTPS API.
//!
//! The NA is a remote signer: it publishes the genesis block, policy
//! manifests and CRLs, and issues join certificates. The core consumes it
//! through [`AuthorityClient`] so tests can substitute an in-process signer.

use crate::canonical::signable_bytes;
use crate::crypto::Keypair;
use crate::error::{Error, Result};
use crate::rbac::Role;
use crate::trust::cert::JoinCertificate;
use crate::trust::crl::Crl;
use crate::trust::genesis::GenesisBlock;
use crate::trust::policy::PolicyManifest;
use crate::types::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline for every NA call.
const AUTHORITY_TIMEOUT: Duration = Duration::from_secs(30);

/// `POST /join` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_public_key: NodeId,
    pub roles: Vec<Role>,
    pub validity_hours: u64,
    #[serde(with = "crate::types::hexbytes")]
    pub pop_signature: Vec<u8>,
}

impl JoinRequest {
    /// Build a join request with a proof-of-possession signature over the
    /// canonical request body.
    pub fn new(identity: &Keypair, roles: Vec<Role>, validity_hours: u64) -> Result<Self> {
        let mut req = Self {
            node_public_key: identity.node_id(),
            roles,
            validity_hours,
            pop_signature: Vec::new(),
        };
        let payload = signable_bytes(&req, &["pop_signature"])?;
        req.pop_signature = identity.sign(&payload);
        Ok(req)
    }
}

/// `POST /renew` body. The proof-of-possession signs the NA-issued nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub current_cert: JoinCertificate,
    #[serde(with = "crate::types::hexbytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::types::hexbytes")]
    pub pop_signature: Vec<u8>,
}

impl RenewRequest {
    pub fn new(identity: &Keypair, current_cert: JoinCertificate, nonce: Vec<u8>) -> Self {
        let pop_signature = identity.sign(&nonce);
        Self {
            current_cert,
            nonce,
            pop_signature,
        }
    }
}

#[async_trait]
pub trait AuthorityClient: Send + Sync {
    async fn fetch_genesis(&self) -> Result<GenesisBlock>;
    async fn fetch_policy(&self) -> Result<PolicyManifest>;
    async fn fetch_crl(&self) -> Result<Crl>;
    /// Fresh nonce for a renewal proof-of-possession.
    async fn renewal_nonce(&self) -> Result<Vec<u8>>;
    async fn join(&self, request: &JoinRequest) -> Result<JoinCertificate>;
    async fn renew(&self, request: &RenewRequest) -> Result<JoinCertificate>;
}

/// HTTPS implementation of the NA API.
pub struct HttpAuthority {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct NonceResponse {
    #[serde(with = "crate::types::hexbytes")]
    nonce: Vec<u8>,
}

impl HttpAuthority {
    pub fn new(base_url: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(Error::Config("authority URL not configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(AUTHORITY_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("authority client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(map_reqwest)?;
        decode(response, path).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode(response, path).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> Result<T> {
    if !response.status().is_success() {
        return Err(Error::ProtocolViolation(format!(
            "authority {} returned {}",
            path,
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Canonicalization(format!("authority {path}: {e}")))
}

fn map_reqwest(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout("authority request".into())
    } else {
        Error::Io(std::io::Error::other(err))
    }
}

#[async_trait]
impl AuthorityClient for HttpAuthority {
    async fn fetch_genesis(&self) -> Result<GenesisBlock> {
        self.get_json("/genesis").await
    }

    async fn fetch_policy(&self) -> Result<PolicyManifest> {
        self.get_json("/policy").await
    }

    async fn fetch_crl(&self) -> Result<Crl> {
        self.get_json("/crl").await
    }

    async fn renewal_nonce(&self) -> Result<Vec<u8>> {
        let response: NonceResponse = self.get_json("/renew/nonce").await?;
        Ok(response.nonce)
    }

    async fn join(&self, request: &JoinRequest) -> Result<JoinCertificate> {
        self.post_json("/join", request).await
    }

    async fn renew(&self, request: &RenewRequest) -> Result<JoinCertificate> {
        self.post_json("/renew", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn join_request_pop_verifies() {
        let identity = Keypair::generate();
        let req = JoinRequest::new(&identity, vec![Role::Client], 24).unwrap();
        let payload = signable_bytes(&req, &["pop_signature"]).unwrap();
        assert!(crypto::verify(&identity.public_bytes(), &payload, &req.pop_signature).is_ok());
    }

    #[test]
    fn renew_request_signs_authority_nonce() {
        let identity = Keypair::generate();
        let authority = Keypair::generate();
        let cert = JoinCertificate::issue(
            &authority,
            identity.node_id(),
            vec![Role::Client],
            vec![],
            "net:1",
            0,
            100,
            1,
        )
        .unwrap();
        let nonce = vec![5u8; 32];
        let req = RenewRequest::new(&identity, cert, nonce.clone());
        assert!(crypto::verify(&identity.public_bytes(), &nonce, &req.pop_signature).is_ok());
    }

    #[test]
    fn empty_base_url_is_config_error() {
        assert!(matches!(HttpAuthority::new(""), Err(Error::Config(_))));
    }
}
