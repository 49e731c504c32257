//! Error taxonomy for the node runtime.
//!
//! The set of kinds is closed: every failure path maps onto one of these,
//! and metrics counters are keyed by `Error::kind()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("certificate expired")]
    ExpiredCert,

    #[error("certificate revoked")]
    RevokedCert,

    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    #[error("role not authorized for {0}")]
    UnauthorizedRole(String),

    #[error("replayed message id {0}")]
    ReplayDetected(String),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("ttl expired")]
    TtlExpired,

    #[error("connection pool full")]
    PoolFull,

    #[error("peer blacklisted until {0}")]
    PeerBlacklisted(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("canonicalization failed: {0}")]
    Canonicalization(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("audit chain broken at index {0}")]
    ChainBroken(u64),
}

/// Stable kind names, used as metric labels and audit detail.
pub const ERROR_KINDS: [&str; 17] = [
    "Config",
    "Io",
    "Timeout",
    "BadSignature",
    "ExpiredCert",
    "RevokedCert",
    "UnknownIssuer",
    "UnauthorizedRole",
    "ReplayDetected",
    "NoRoute",
    "TtlExpired",
    "PoolFull",
    "PeerBlacklisted",
    "RateLimited",
    "Canonicalization",
    "ProtocolViolation",
    "ChainBroken",
];

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "Config",
            Error::Io(_) => "Io",
            Error::Timeout(_) => "Timeout",
            Error::BadSignature(_) => "BadSignature",
            Error::ExpiredCert => "ExpiredCert",
            Error::RevokedCert => "RevokedCert",
            Error::UnknownIssuer(_) => "UnknownIssuer",
            Error::UnauthorizedRole(_) => "UnauthorizedRole",
            Error::ReplayDetected(_) => "ReplayDetected",
            Error::NoRoute(_) => "NoRoute",
            Error::TtlExpired => "TtlExpired",
            Error::PoolFull => "PoolFull",
            Error::PeerBlacklisted(_) => "PeerBlacklisted",
            Error::RateLimited(_) => "RateLimited",
            Error::Canonicalization(_) => "Canonicalization",
            Error::ProtocolViolation(_) => "ProtocolViolation",
            Error::ChainBroken(_) => "ChainBroken",
        }
    }

    /// Kind index into [`ERROR_KINDS`], for metric counters.
    pub fn kind_index(&self) -> usize {
        let kind = self.kind();
        ERROR_KINDS.iter().position(|k| *k == kind).unwrap_or(0)
    }

    /// Security-relevant kinds are audited, degrade the peer's reputation,
    /// and are reported to the remote side only as a generic rejection.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Error::BadSignature(_)
                | Error::RevokedCert
                | Error::UnauthorizedRole(_)
                | Error::ReplayDetected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
