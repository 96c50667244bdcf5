use crate::coverage::CoverageConfig;
use crate::identity::{NodeId, PublicKey};
use serde::{Deserialize, Serialize};

/// Who may sign relay rewards
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardMode {
    /// A single trusted issuer signs every reward
    Authority(PublicKey),
    /// The relayer signs its own reward; witness attestations carry the trust
    WitnessQuorum,
}

/// Rules every node must agree on to reach the same balances
///
/// Authorities and admin keys are fixed at deployment time. The first admin
/// key is the root admin and can never be removed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerPolicy {
    genesis_authorities: Vec<PublicKey>,
    admin_keys: Vec<PublicKey>,
    reward_mode: RewardMode,
    coverage: CoverageConfig,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            genesis_authorities: Vec::new(),
            admin_keys: Vec::new(),
            reward_mode: RewardMode::WitnessQuorum,
            coverage: CoverageConfig::default(),
        }
    }
}

impl LedgerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_genesis_authority(mut self, key: PublicKey) -> Self {
        if !self.genesis_authorities.contains(&key) {
            self.genesis_authorities.push(key);
        }
        self
    }

    pub fn with_admin(mut self, key: PublicKey) -> Self {
        if !self.admin_keys.contains(&key) {
            self.admin_keys.push(key);
        }
        self
    }

    pub fn with_reward_mode(mut self, mode: RewardMode) -> Self {
        self.reward_mode = mode;
        self
    }

    pub fn with_coverage(mut self, coverage: CoverageConfig) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn genesis_authorities(&self) -> &[PublicKey] {
        &self.genesis_authorities
    }

    pub fn admin_keys(&self) -> &[PublicKey] {
        &self.admin_keys
    }

    pub fn reward_mode(&self) -> &RewardMode {
        &self.reward_mode
    }

    pub fn coverage(&self) -> &CoverageConfig {
        &self.coverage
    }

    pub fn is_genesis_authority(&self, key: &PublicKey) -> bool {
        self.genesis_authorities.contains(key)
    }

    pub fn is_admin(&self, key: &PublicKey) -> bool {
        self.admin_keys.contains(key)
    }

    pub fn root_admin(&self) -> Option<NodeId> {
        self.admin_keys.first().map(NodeId::from_public_key)
    }

    /// True if `key` may sign a RelayReward for `relayer`
    pub fn may_issue_reward(&self, key: &PublicKey, relayer: &NodeId) -> bool {
        match &self.reward_mode {
            RewardMode::Authority(issuer) => issuer == key,
            RewardMode::WitnessQuorum => &NodeId::from_public_key(key) == relayer,
        }
    }
}
