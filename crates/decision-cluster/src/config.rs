//! # config
//!
//! why: gather everything a node needs to boot from defaults, a file and the environment
//! relations: read by node.rs and the agent binary; produces RaftConfig and the seed roster for decision-core
//! what: MemberConfig, NodeConfig (figment loading, validation, store selection)

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use decision_core::{ClusterConfig, LogStore, MemLogStore, NodeId, RaftConfig, StorageError};
use decision_storage::FileLogStore;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variables with this prefix override file values,
/// e.g. `DECISION_NODE_ID=2`.
pub const ENV_PREFIX: &str = "DECISION_";

/// One seed member: id and the address its transport listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    pub address: String,
}

/// Everything a node needs to boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Address the peer/client listener binds to
    pub listen_addr: String,
    /// Seed roster. Must contain `node_id` unless `join` is set. The first
    /// leader replicates its roster at index 1; after that the log decides
    /// membership and a joiner's seeds are only contact points.
    pub members: Vec<MemberConfig>,
    /// Start outside the roster and wait to be added through a committed
    /// membership change.
    pub join: bool,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Per-call deadline before a peer is treated as unresponsive
    pub rpc_timeout_ms: u64,
    /// How long a client waits for its proposal to be applied
    pub commit_timeout_ms: u64,
    /// Missed-heartbeat window before a member is suspected
    pub suspect_after_ms: u64,
    pub ping_interval_ms: u64,
    /// Log persistence location; `None` keeps the log in memory
    pub data_dir: Option<PathBuf>,
    pub pre_vote: bool,
    pub max_entries_per_append: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let raft = RaftConfig::default();
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:7001".to_string(),
            members: vec![MemberConfig { id: 1, address: "127.0.0.1:7001".to_string() }],
            join: false,
            heartbeat_interval_ms: raft.heartbeat_interval,
            election_timeout_min_ms: raft.election_timeout_min,
            election_timeout_max_ms: raft.election_timeout_max,
            rpc_timeout_ms: 100,
            commit_timeout_ms: 2_000,
            suspect_after_ms: 1_000,
            ping_interval_ms: 250,
            data_dir: None,
            pre_vote: raft.pre_vote,
            max_entries_per_append: raft.max_entries_per_append,
        }
    }
}

impl NodeConfig {
    /// Load configuration from all sources with proper priority
    ///
    /// Priority (highest to lowest):
    /// 1. `DECISION_`-prefixed environment variables
    /// 2. The TOML file at `path`, if given
    /// 3. Default values
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(NodeConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));
        Self::extract(figment)
    }

    /// Defaults overlaid with an inline TOML document.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(NodeConfig::default()))
            .merge(Toml::string(toml));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: NodeConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms ({}) must be below election_timeout_min_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(ConfigError::Invalid(format!(
                "election_timeout_min_ms ({}) exceeds election_timeout_max_ms ({})",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.rpc_timeout_ms == 0 || self.commit_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::Invalid("max_entries_per_append must be at least 1".to_string()));
        }

        let mut seen = BTreeSet::new();
        for member in &self.members {
            if !seen.insert(member.id) {
                return Err(ConfigError::Invalid(format!("duplicate member id {}", member.id)));
            }
        }
        if !self.join && !seen.contains(&self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node {} is not in the member list (set join = true to join a running cluster)",
                self.node_id
            )));
        }
        if self.join && self.members.iter().all(|m| m.id == self.node_id) {
            return Err(ConfigError::Invalid("join requires at least one existing member".to_string()));
        }
        Ok(())
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            heartbeat_interval: self.heartbeat_interval_ms,
            pre_vote: self.pre_vote,
            max_entries_per_append: self.max_entries_per_append,
        }
    }

    /// The seed roster the node boots with. A joining node leaves itself
    /// out and cannot campaign until the replicated roster and its Join
    /// entry reach its log.
    pub fn bootstrap_cluster(&self) -> ClusterConfig {
        ClusterConfig::new(
            self.members
                .iter()
                .filter(|m| !(self.join && m.id == self.node_id))
                .map(|m| (m.id, m.address.clone())),
        )
    }

    /// This node's advertised address: its member entry, else the listen address.
    pub fn advertised_addr(&self) -> &str {
        self.members
            .iter()
            .find(|m| m.id == self.node_id)
            .map(|m| m.address.as_str())
            .unwrap_or(self.listen_addr.as_str())
    }

    /// Open the configured log store: file-backed under `data_dir`, else in memory.
    pub fn open_store(&self) -> Result<Box<dyn LogStore>, StorageError> {
        match &self.data_dir {
            Some(dir) => Ok(Box::new(FileLogStore::open(dir)?)),
            None => Ok(Box::new(MemLogStore::new())),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.suspect_after_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }
}
