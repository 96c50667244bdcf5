// Schedule - Deterministic reward curve and coverage acceptance rules

use crate::coverage::CoverageWindow;
use crate::ledger::Amount;
use serde::{Deserialize, Serialize};

/// Reward amount as a function of how many rewards an issuer already paid
/// in the current epoch
///
/// The amount halves every `halving_interval` rewards and never drops below
/// `min_reward`. Every node evaluates the same curve, so rewards gossiped
/// from elsewhere can be checked locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSchedule {
    pub base_reward: Amount,
    pub halving_interval: u32,
    pub min_reward: Amount,
    pub epoch_length_ms: u64,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            base_reward: Amount::from_micro(500_000),
            halving_interval: 16,
            min_reward: Amount::from_micro(100),
            epoch_length_ms: 60 * 60 * 1000,
        }
    }
}

impl RewardSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_reward(mut self, amount: Amount) -> Self {
        self.base_reward = amount;
        self
    }

    pub fn with_halving_interval(mut self, rewards: u32) -> Self {
        self.halving_interval = rewards;
        self
    }

    pub fn with_min_reward(mut self, amount: Amount) -> Self {
        self.min_reward = amount;
        self
    }

    pub fn with_epoch_length(mut self, ms: u64) -> Self {
        self.epoch_length_ms = ms;
        self
    }

    /// Reward for the next proof when `already_paid` rewards exist this epoch
    pub fn reward(&self, already_paid: usize) -> Amount {
        let halvings = already_paid / self.halving_interval.max(1) as usize;
        let decayed = if halvings >= 64 {
            0
        } else {
            self.base_reward.micro() >> halvings
        };
        Amount::from_micro(decayed).max(self.min_reward)
    }

    pub fn epoch_of(&self, ms: u64) -> u64 {
        ms / self.epoch_length_ms.max(1)
    }
}

/// Acceptance rules for relay proofs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Distinct valid witnesses a proof needs
    pub min_witnesses: usize,
    /// Longest coverage window accepted
    pub max_window_ms: u64,
    pub schedule: RewardSchedule,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            min_witnesses: 2,
            max_window_ms: 10 * 60 * 1000,
            schedule: RewardSchedule::default(),
        }
    }
}

impl CoverageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_witnesses(mut self, count: usize) -> Self {
        self.min_witnesses = count;
        self
    }

    pub fn with_max_window(mut self, ms: u64) -> Self {
        self.max_window_ms = ms;
        self
    }

    pub fn with_schedule(mut self, schedule: RewardSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Ordered, bounded, and within a single epoch
    pub fn accepts_window(&self, window: &CoverageWindow) -> bool {
        window.is_ordered()
            && window.duration_ms() <= self.max_window_ms
            && self.schedule.epoch_of(window.start_ms) == self.schedule.epoch_of(window.end_ms)
    }
}
