// Accountant - Turns validated relay proofs into RelayReward transactions
// and re-checks reward amounts when rewards commit

use crate::coverage::{CoverageConfig, RelayProof};
use crate::identity::{Keypair, NodeId, PublicKey};
use crate::ledger::{
    Amount, LedgerPolicy, RewardClaim, RewardMode, Transaction, TransactionBuilder,
    TransactionError, TransactionLog, TxKind,
};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur in coverage accounting
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoverageError {
    #[error("Insufficient witnesses: {valid} valid, {required} required")]
    InsufficientWitnesses { valid: usize, required: usize },

    #[error("Coverage window rejected by policy")]
    InvalidWindow,

    #[error("Relayer {0} was already rewarded for this packet")]
    AlreadyRewarded(NodeId),

    #[error("This key may not issue rewards for {0}")]
    NotIssuer(NodeId),

    #[error("Reward amount {actual} does not match schedule {expected}")]
    AmountMismatch { expected: Amount, actual: Amount },

    #[error("Not a relay reward")]
    NotAReward,

    #[error("Failed to build reward: {0}")]
    Build(String),
}

impl From<TransactionError> for CoverageError {
    fn from(err: TransactionError) -> Self {
        CoverageError::Build(err.to_string())
    }
}

/// Proof-of-Coverage accounting
///
/// Stateless over the ledger: reward counts and duplicate checks read the
/// transaction log passed in, so the same answers come out on every node.
#[derive(Clone, Debug)]
pub struct CoverageAccountant {
    config: CoverageConfig,
    policy: LedgerPolicy,
}

impl CoverageAccountant {
    pub fn new(policy: &LedgerPolicy) -> Self {
        Self {
            config: policy.coverage().clone(),
            policy: policy.clone(),
        }
    }

    pub fn reward_mode(&self) -> &RewardMode {
        self.policy.reward_mode()
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    /// True if `key` signs rewards for `relayer` under the current mode
    pub fn is_issuer_for(&self, key: &PublicKey, relayer: &NodeId) -> bool {
        self.policy.may_issue_reward(key, relayer)
    }

    /// Check window and witness quorum of a proof
    pub fn validate(&self, proof: &RelayProof) -> Result<RewardClaim, CoverageError> {
        if !self.config.accepts_window(&proof.window) {
            return Err(CoverageError::InvalidWindow);
        }
        let valid = proof.valid_witnesses();
        if valid < self.config.min_witnesses {
            return Err(CoverageError::InsufficientWitnesses {
                valid,
                required: self.config.min_witnesses,
            });
        }
        Ok(RewardClaim {
            packet_hash: proof.packet_hash,
            window: proof.window,
            epoch: self.config.schedule.epoch_of(proof.window.start_ms),
            attestations: proof.attestations.clone(),
        })
    }

    /// Reward the next proof on `stream` would earn in `epoch`
    pub fn expected_reward(&self, log: &TransactionLog, stream: &NodeId, epoch: u64) -> Amount {
        self.config.schedule.reward(log.rewards_in_epoch(stream, epoch))
    }

    /// Validate `proof` and sign the RelayReward that pays for it
    ///
    /// The reward takes the next sequence on the issuer's stream and a
    /// lamport above everything the log has seen.
    pub fn issue(
        &self,
        issuer: &Keypair,
        proof: &RelayProof,
        log: &TransactionLog,
    ) -> Result<Transaction, CoverageError> {
        if !self.is_issuer_for(&issuer.public_key(), &proof.relayer) {
            return Err(CoverageError::NotIssuer(proof.relayer));
        }
        let claim = self.validate(proof)?;
        if log.is_rewarded(&proof.relayer, &proof.packet_hash) {
            return Err(CoverageError::AlreadyRewarded(proof.relayer));
        }
        let stream = NodeId::from_public_key(&issuer.public_key());
        let amount = self.expected_reward(log, &stream, claim.epoch);
        debug!(
            relayer = %proof.relayer.short(),
            %amount,
            epoch = claim.epoch,
            "issuing relay reward"
        );

        let tx = TransactionBuilder::relay_reward(issuer, proof.relayer, amount, claim)
            .sequence(log.tip(&stream) + 1)
            .lamport(log.max_lamport() + 1)
            .build()?;
        Ok(tx)
    }

    /// Ledger-state checks for a reward about to commit
    ///
    /// Signature, issuer and witness quorum were checked by the validator;
    /// this enforces the schedule and the one-reward-per-packet rule
    /// against the commits that precede it.
    pub fn check_reward(
        &self,
        tx: &Transaction,
        log: &TransactionLog,
    ) -> Result<(), CoverageError> {
        if tx.kind() != &TxKind::RelayReward {
            return Err(CoverageError::NotAReward);
        }
        let claim = tx.reward().ok_or(CoverageError::NotAReward)?;
        if log.is_rewarded(&tx.recipient(), &claim.packet_hash) {
            return Err(CoverageError::AlreadyRewarded(tx.recipient()));
        }
        let expected = self.expected_reward(log, &tx.stream(), claim.epoch);
        if tx.amount() != expected {
            return Err(CoverageError::AmountMismatch {
                expected,
                actual: tx.amount(),
            });
        }
        Ok(())
    }
}
