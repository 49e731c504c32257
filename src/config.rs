//! Node configuration.

use crate::error::{Error, Result};
use crate::rbac::Role;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Runtime configuration for a mesh node.
///
/// Defaults follow the network-wide operational parameters; deployments
/// override them per node via `meshd` flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory holding `keys/`, `state/` and `genesis.json`.
    pub data_dir: PathBuf,
    /// Local listen address for the mesh transport.
    pub listen_address: SocketAddr,
    /// Extra bootstrap endpoints dialed alongside the genesis anchors.
    pub bootstrap_endpoints: Vec<SocketAddr>,
    /// Role requested when joining the network.
    pub role: Role,
    /// Network Authority base URL (HTTPS API).
    pub authority_url: String,

    pub max_connections: usize,
    pub route_announce_interval_s: u64,
    pub discovery_interval_s: u64,
    pub crl_announce_interval_s: u64,
    /// Fraction of certificate lifetime after which renewal starts.
    pub renewal_ratio: f64,
    pub handshake_timeout_s: u64,
    pub ping_interval_s: u64,
    pub max_hops: u32,
    pub peer_gossip_cap: usize,
    pub stale_peer_timeout_s: u64,
    pub reputation_blacklist_threshold: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            listen_address: "0.0.0.0:7400".parse().expect("static addr"),
            bootstrap_endpoints: Vec::new(),
            role: Role::Client,
            authority_url: String::new(),
            max_connections: 50,
            route_announce_interval_s: 30,
            discovery_interval_s: 60,
            crl_announce_interval_s: 60,
            renewal_ratio: 0.5,
            handshake_timeout_s: 10,
            ping_interval_s: 15,
            max_hops: 6,
            peer_gossip_cap: 32,
            stale_peer_timeout_s: 900,
            reputation_blacklist_threshold: 0.2,
        }
    }
}

impl NodeConfig {
    /// Reject configurations the runtime cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.renewal_ratio) || self.renewal_ratio <= 0.0 {
            return Err(Error::Config(
                "renewal_ratio must be within (0, 1)".into(),
            ));
        }
        if self.max_hops == 0 {
            return Err(Error::Config("max_hops must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.reputation_blacklist_threshold) {
            return Err(Error::Config(
                "reputation_blacklist_threshold must be within [0, 1]".into(),
            ));
        }
        if self.route_announce_interval_s == 0
            || self.discovery_interval_s == 0
            || self.crl_announce_interval_s == 0
            || self.ping_interval_s == 0
            || self.handshake_timeout_s == 0
        {
            return Err(Error::Config("intervals must be > 0".into()));
        }
        if self.peer_gossip_cap == 0 {
            return Err(Error::Config("peer_gossip_cap must be > 0".into()));
        }
        Ok(())
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.data_dir.join("genesis.json")
    }

    /// Routes unrefreshed for this long are evicted.
    pub fn route_stale_timeout_s(&self) -> u64 {
        self.route_announce_interval_s * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_connections_rejected() {
        let cfg = NodeConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn renewal_ratio_bounds() {
        let mut cfg = NodeConfig::default();
        cfg.renewal_ratio = 0.0;
        assert!(cfg.validate().is_err());
        cfg.renewal_ratio = 1.0;
        assert!(cfg.validate().is_err());
        cfg.renewal_ratio = 0.5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn route_stale_is_three_announce_intervals() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.route_stale_timeout_s(), 90);
    }
}
