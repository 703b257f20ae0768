//! Configuration tree for the integration facade.
//!
//! Covers the `[p2p]` keys the facade consumes (§6): node id, gossip
//! listen address, seed nodes, plus the tuning defaults the DHT and gossip
//! layers use internally. Everything here is loadable from TOML but callers
//! may also build a `Config` directly (e.g. in tests).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNode {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub host: String,
    pub port: u16,
    pub seed_nodes: Vec<SeedNode>,
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub suspicion_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dead_timeout: Duration,
    pub max_ttl: u8,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9400,
            seed_nodes: Vec::new(),
            gossip_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            suspicion_timeout: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(60),
            max_ttl: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub host: String,
    pub port: u16,
    pub k: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub contact_staleness: Duration,
    pub replication_factor: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9401,
            k: 20,
            request_timeout: Duration::from_secs(5),
            contact_staleness: Duration::from_secs(3600),
            replication_factor: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct P2pConfig {
    /// Node identity seed. If empty, a random NodeID is generated at startup.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub dht: DhtConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub p2p: P2pConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}
