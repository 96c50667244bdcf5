// Node configuration loaded from TOML
//
// Every section is optional; missing fields take their defaults. Keys in the
// [ledger] section are hex-encoded ed25519 public keys.

use crate::api::{LedgerNodeConfig, RuntimeConfig};
use crate::coverage::CoverageConfig;
use crate::identity::{KeypairError, PublicKey};
use crate::ledger::{LedgerPolicy, RewardMode};
use crate::sync::{GossipConfig, ReconcileConfig};
use crate::transport::{LoraTransportConfig, MeshAdapterConfig, TransportError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid key in [ledger].{field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid transport config: {0}")]
    Transport(#[from] TransportError),
}

/// Who may mint, administer and reward
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub genesis_authorities: Vec<String>,
    /// The first admin is the root admin
    pub admins: Vec<String>,
    /// Reward issuer key; without one, relayers self-issue under witness quorum
    pub reward_issuer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Tracing filter used when RUST_LOG is unset
    pub log_level: String,
    pub ledger: LedgerSection,
    pub coverage: CoverageConfig,
    pub gossip: GossipConfig,
    pub reconcile: ReconcileConfig,
    pub runtime: RuntimeConfig,
    pub lora: LoraTransportConfig,
    pub mesh: MeshAdapterConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./geohop_data"),
            log_level: "info".to_string(),
            ledger: LedgerSection::default(),
            coverage: CoverageConfig::default(),
            gossip: GossipConfig::default(),
            reconcile: ReconcileConfig::default(),
            runtime: RuntimeConfig::default(),
            lora: LoraTransportConfig::default(),
            mesh: MeshAdapterConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy()?;
        self.lora.validate()?;
        if self.coverage.min_witnesses == 0 {
            return Err(ConfigError::Invalid(
                "coverage.min_witnesses must be at least 1".to_string(),
            ));
        }
        if self.coverage.schedule.epoch_length_ms == 0 {
            return Err(ConfigError::Invalid(
                "coverage.schedule.epoch_length_ms cannot be 0".to_string(),
            ));
        }
        if self.gossip.gossip_interval_ms == 0 || self.runtime.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals cannot be 0".to_string()));
        }
        if self.reconcile.max_batch == 0 {
            return Err(ConfigError::Invalid("reconcile.max_batch cannot be 0".to_string()));
        }
        Ok(())
    }

    /// The ledger rules every node on the network must share
    pub fn policy(&self) -> Result<LedgerPolicy, ConfigError> {
        let mut policy = LedgerPolicy::new().with_coverage(self.coverage.clone());
        for key in &self.ledger.genesis_authorities {
            policy = policy.with_genesis_authority(parse_key("genesis_authorities", key)?);
        }
        for key in &self.ledger.admins {
            policy = policy.with_admin(parse_key("admins", key)?);
        }
        let mode = match &self.ledger.reward_issuer {
            Some(key) => RewardMode::Authority(parse_key("reward_issuer", key)?),
            None => RewardMode::WitnessQuorum,
        };
        Ok(policy.with_reward_mode(mode))
    }

    pub fn node_config(&self) -> LedgerNodeConfig {
        LedgerNodeConfig::new()
            .with_gossip(self.gossip.clone())
            .with_reconcile(self.reconcile.clone())
    }

    /// Runtime timers, with the gossip period taken from [gossip]
    pub fn runtime_config(&self) -> RuntimeConfig {
        self.runtime.clone().with_gossip_interval(self.gossip.gossip_interval_ms)
    }
}

fn parse_key(field: &'static str, value: &str) -> Result<PublicKey, ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| ConfigError::InvalidKey {
        field,
        reason: e.to_string(),
    })?;
    PublicKey::from_bytes(&bytes).map_err(|e: KeypairError| ConfigError::InvalidKey {
        field,
        reason: e.to_string(),
    })
}
