//! Trust chain: genesis, certificates, policy, revocation, and the
//! Network Authority client.

pub mod authority;
pub mod cert;
pub mod crl;
pub mod genesis;
pub mod policy;

pub use authority::{AuthorityClient, HttpAuthority, JoinRequest, RenewRequest};
pub use cert::JoinCertificate;
pub use crl::{Crl, CrlStore, Revocation};
pub use genesis::{AnchorEndpoint, AuthorityKey, GenesisBlock};
pub use policy::PolicyManifest;
