use crate::coverage::count_valid_witnesses;
use crate::identity::NodeId;
use crate::ledger::transaction::{Transaction, TxId, TxKind, MAX_MEMO_LEN};
use crate::ledger::LedgerPolicy;
use thiserror::Error;

/// Reasons a transaction is malformed or unauthorised
///
/// These never depend on ledger state, so a transaction that fails here is
/// dropped without being logged or forwarded.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid signature: signature does not match the transaction content")]
    InvalidSignature,

    #[error("Invalid sequence: sequence numbers start at 1")]
    InvalidSequence,

    #[error("Sender mismatch: {0} transactions must be signed by the sender")]
    SenderMismatch(&'static str),

    #[error("Self-transfer not allowed")]
    SelfTransfer,

    #[error("Invalid amount: {0}")]
    InvalidAmount(&'static str),

    #[error("Invalid display name")]
    InvalidDisplayName,

    #[error("Unauthorized: signer may not issue {0} transactions")]
    Unauthorized(&'static str),

    #[error("The root admin account cannot be removed")]
    RootAdminRemoval,

    #[error("Reward claim missing or attached to the wrong kind")]
    RewardClaimMismatch,

    #[error("Invalid coverage window")]
    InvalidCoverageWindow,

    #[error("Reward epoch {claimed} does not match window epoch {expected}")]
    EpochMismatch { claimed: u64, expected: u64 },

    #[error("Insufficient witnesses: {valid} valid, {required} required")]
    InsufficientWitnesses { valid: usize, required: usize },
}

/// A transaction whose signature and authorisation have been checked
///
/// Only the validator constructs these, so the commit path can trust them
/// without re-verifying.
#[derive(Clone, Debug)]
pub struct VerifiedTransaction {
    tx: Transaction,
    id: TxId,
    stream: NodeId,
}

impl VerifiedTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn stream(&self) -> NodeId {
        self.stream
    }

    pub fn seq(&self) -> u64 {
        self.tx.sender_seq()
    }

    pub fn into_inner(self) -> Transaction {
        self.tx
    }
}

/// Stateless transaction checks
pub struct TransactionValidator;

impl TransactionValidator {
    /// Verify signature and kind-specific rules against the ledger policy
    ///
    /// This performs:
    /// - Signature verification
    /// - Sequence and amount sanity
    /// - Sender/signer binding for self-signed kinds
    /// - Authority checks for privileged kinds
    /// - Witness verification for relay rewards
    pub fn verify(
        tx: &Transaction,
        policy: &LedgerPolicy,
    ) -> Result<VerifiedTransaction, ValidationError> {
        if !tx.verify_signature() {
            return Err(ValidationError::InvalidSignature);
        }
        if tx.sender_seq() == 0 {
            return Err(ValidationError::InvalidSequence);
        }

        let stream = tx.stream();
        if tx.reward().is_some() != (tx.kind() == &TxKind::RelayReward) {
            return Err(ValidationError::RewardClaimMismatch);
        }

        match tx.kind() {
            TxKind::Transfer => {
                if tx.sender() != Some(stream) {
                    return Err(ValidationError::SenderMismatch("transfer"));
                }
                if tx.recipient() == stream {
                    return Err(ValidationError::SelfTransfer);
                }
                if tx.amount().is_zero() {
                    return Err(ValidationError::InvalidAmount("transfer amount cannot be zero"));
                }
            }
            TxKind::Register { display_name } => {
                if tx.sender() != Some(stream) || tx.recipient() != stream {
                    return Err(ValidationError::SenderMismatch("register"));
                }
                if display_name.trim().is_empty() || display_name.len() > MAX_MEMO_LEN {
                    return Err(ValidationError::InvalidDisplayName);
                }
                if !tx.amount().is_zero() {
                    return Err(ValidationError::InvalidAmount("register carries no amount"));
                }
            }
            TxKind::Genesis => {
                Self::require_no_sender(tx)?;
                if !policy.is_genesis_authority(tx.signer()) {
                    return Err(ValidationError::Unauthorized("genesis"));
                }
                if tx.amount().is_zero() {
                    return Err(ValidationError::InvalidAmount("genesis amount cannot be zero"));
                }
            }
            TxKind::RelayReward => {
                Self::require_no_sender(tx)?;
                if !policy.may_issue_reward(tx.signer(), &tx.recipient()) {
                    return Err(ValidationError::Unauthorized("relay_reward"));
                }
                Self::verify_claim(tx, policy)?;
            }
            TxKind::AdminAdjust { .. } => {
                Self::require_no_sender(tx)?;
                if !policy.is_admin(tx.signer()) {
                    return Err(ValidationError::Unauthorized("admin_adjust"));
                }
                if tx.amount().is_zero() {
                    return Err(ValidationError::InvalidAmount("adjustment cannot be zero"));
                }
            }
            TxKind::AdminBan { .. } => {
                Self::require_no_sender(tx)?;
                if !policy.is_admin(tx.signer()) {
                    return Err(ValidationError::Unauthorized("admin_ban"));
                }
            }
            TxKind::AdminRemove => {
                Self::require_no_sender(tx)?;
                if !policy.is_admin(tx.signer()) {
                    return Err(ValidationError::Unauthorized("admin_remove"));
                }
                if policy.root_admin() == Some(tx.recipient()) {
                    return Err(ValidationError::RootAdminRemoval);
                }
            }
        }

        Ok(VerifiedTransaction {
            id: tx.id(),
            tx: tx.clone(),
            stream,
        })
    }

    fn require_no_sender(tx: &Transaction) -> Result<(), ValidationError> {
        match tx.sender() {
            None => Ok(()),
            Some(_) => Err(ValidationError::SenderMismatch(tx.kind().name())),
        }
    }

    fn verify_claim(tx: &Transaction, policy: &LedgerPolicy) -> Result<(), ValidationError> {
        let claim = tx.reward().ok_or(ValidationError::RewardClaimMismatch)?;
        let coverage = policy.coverage();

        if !coverage.accepts_window(&claim.window) {
            return Err(ValidationError::InvalidCoverageWindow);
        }
        let expected = coverage.schedule.epoch_of(claim.window.start_ms);
        if claim.epoch != expected {
            return Err(ValidationError::EpochMismatch {
                claimed: claim.epoch,
                expected,
            });
        }

        let valid = count_valid_witnesses(
            &tx.recipient(),
            &claim.packet_hash,
            &claim.window,
            &claim.attestations,
        );
        if valid < coverage.min_witnesses {
            return Err(ValidationError::InsufficientWitnesses {
                valid,
                required: coverage.min_witnesses,
            });
        }
        Ok(())
    }
}
