use crate::error::ConfigurationError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Timing and sizing knobs of the consensus engine and its transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub leader_lease_ms: u64,
    pub proposal_timeout_ms: u64,

    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,

    pub max_key_len: usize,
    pub max_frame_len: usize,
    pub max_batch_rounds: usize,
    pub retained_rounds: usize,
    pub inbound_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 1500,
            leader_lease_ms: 300,
            proposal_timeout_ms: 5000,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 2000,
            max_key_len: 1024,
            max_frame_len: 16 * 1024 * 1024,
            max_batch_rounds: 64,
            retained_rounds: 4096,
            inbound_queue: 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: &str| Err(ConfigurationError::InvalidEngineConfig(msg.to_string()));

        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be positive");
        }
        if self.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be positive");
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return invalid("election_timeout_min_ms exceeds election_timeout_max_ms");
        }
        if self.leader_lease_ms <= self.heartbeat_interval_ms {
            return invalid("leader_lease_ms must exceed heartbeat_interval_ms");
        }
        if self.leader_lease_ms > self.election_timeout_min_ms {
            return invalid("leader_lease_ms must not exceed election_timeout_min_ms");
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            return invalid("reconnect backoff range is empty");
        }
        if self.max_key_len == 0 {
            return invalid("max_key_len must be positive");
        }
        if self.max_frame_len == 0 {
            return invalid("max_frame_len must be positive");
        }
        if self.retained_rounds == 0 {
            return invalid("retained_rounds must be positive");
        }
        if self.max_batch_rounds == 0 {
            return invalid("max_batch_rounds must be positive");
        }
        if self.inbound_queue == 0 {
            return invalid("inbound_queue must be positive");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn leader_lease(&self) -> Duration {
        Duration::from_millis(self.leader_lease_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// On-disk configuration of the `abcastd` daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub node_id: NodeId,
    pub listen_addr: String,
    pub cluster_size: usize,

    /// Name of the environment variable holding the shared cluster key.
    pub key_env: String,

    pub peers: Vec<String>,

    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:2020".to_string(),
            cluster_size: 1,
            key_env: "ABCAST_KEY".to_string(),
            peers: Vec::new(),
            data_dir: PathBuf::from("/var/lib/abcast"),
            engine: EngineConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn shared_key(&self) -> anyhow::Result<String> {
        std::env::var(&self.key_env)
            .map_err(|_| anyhow::anyhow!("environment variable {} is not set", self.key_env))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.node_id))
    }
}
