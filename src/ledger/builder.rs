use crate::identity::{Keypair, NodeId, Signer};
use crate::ledger::transaction::{
    RewardClaim, Transaction, TransactionError, TxBody, TxId, TxKind, MAX_MEMO_LEN,
};
use crate::ledger::Amount;
use std::collections::BTreeSet;

/// Builder for signed transactions
///
/// The constructor picks the kind and fills the fields that kind requires;
/// sequence, lamport and causal deps are set by the caller before `build`.
pub struct TransactionBuilder<'a> {
    signer: &'a Keypair,
    kind: TxKind,
    sender: Option<NodeId>,
    recipient: NodeId,
    amount: Amount,
    sequence: Option<u64>,
    lamport: u64,
    causal_deps: BTreeSet<TxId>,
    reward: Option<RewardClaim>,
}

impl<'a> TransactionBuilder<'a> {
    fn new(
        signer: &'a Keypair,
        kind: TxKind,
        sender: Option<NodeId>,
        recipient: NodeId,
        amount: Amount,
    ) -> Self {
        Self {
            signer,
            kind,
            sender,
            recipient,
            amount,
            sequence: None,
            lamport: 0,
            causal_deps: BTreeSet::new(),
            reward: None,
        }
    }

    /// Transfer from the signer's own account
    pub fn transfer(sender: &'a Keypair, recipient: NodeId, amount: Amount) -> Self {
        let from = NodeId::from_public_key(&sender.public_key());
        Self::new(sender, TxKind::Transfer, Some(from), recipient, amount)
    }

    /// Self-registration with a callsign
    pub fn register(node: &'a Keypair, display_name: impl Into<String>) -> Self {
        let id = NodeId::from_public_key(&node.public_key());
        let kind = TxKind::Register {
            display_name: display_name.into(),
        };
        Self::new(node, kind, Some(id), id, Amount::ZERO)
    }

    pub fn genesis(authority: &'a Keypair, recipient: NodeId, amount: Amount) -> Self {
        Self::new(authority, TxKind::Genesis, None, recipient, amount)
    }

    pub fn relay_reward(
        issuer: &'a Keypair,
        relayer: NodeId,
        amount: Amount,
        claim: RewardClaim,
    ) -> Self {
        let mut builder = Self::new(issuer, TxKind::RelayReward, None, relayer, amount);
        builder.reward = Some(claim);
        builder
    }

    /// Add `amount` to the target's balance and the issued supply
    pub fn admin_credit(admin: &'a Keypair, target: NodeId, amount: Amount) -> Self {
        Self::new(admin, TxKind::AdminAdjust { credit: true }, None, target, amount)
    }

    /// Remove up to `amount` from the target's balance
    pub fn admin_debit(admin: &'a Keypair, target: NodeId, amount: Amount) -> Self {
        Self::new(admin, TxKind::AdminAdjust { credit: false }, None, target, amount)
    }

    pub fn admin_remove(admin: &'a Keypair, target: NodeId) -> Self {
        Self::new(admin, TxKind::AdminRemove, None, target, Amount::ZERO)
    }

    pub fn admin_ban(admin: &'a Keypair, target: NodeId, banned: bool) -> Self {
        Self::new(admin, TxKind::AdminBan { banned }, None, target, Amount::ZERO)
    }

    /// Position in the transaction's sequence stream (required, starts at 1)
    pub fn sequence(mut self, seq: u64) -> Self {
        self.sequence = Some(seq);
        self
    }

    pub fn lamport(mut self, lamport: u64) -> Self {
        self.lamport = lamport;
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = TxId>) -> Self {
        self.causal_deps.extend(deps);
        self
    }

    /// Sign and return the transaction
    pub fn build(self) -> Result<Transaction, TransactionError> {
        let sender_seq = self.sequence.ok_or(TransactionError::MissingField("sequence"))?;
        if sender_seq == 0 {
            return Err(TransactionError::InvalidSequence);
        }

        match &self.kind {
            TxKind::Transfer => {
                if self.amount.is_zero() {
                    return Err(TransactionError::InvalidAmount(
                        "transfer amount cannot be zero".into(),
                    ));
                }
                if self.sender == Some(self.recipient) {
                    return Err(TransactionError::SelfTransfer);
                }
            }
            TxKind::Register { display_name } => {
                if display_name.trim().is_empty() || display_name.len() > MAX_MEMO_LEN {
                    return Err(TransactionError::InvalidDisplayName);
                }
            }
            TxKind::Genesis | TxKind::RelayReward => {
                if self.amount.is_zero() {
                    return Err(TransactionError::InvalidAmount("issuance cannot be zero".into()));
                }
            }
            TxKind::AdminAdjust { .. } => {
                if self.amount.is_zero() {
                    return Err(TransactionError::InvalidAmount("adjustment cannot be zero".into()));
                }
            }
            _ => {}
        }
        if self.kind == TxKind::RelayReward && self.reward.is_none() {
            return Err(TransactionError::MissingField("reward claim"));
        }

        let body = TxBody {
            kind: self.kind,
            signer: self.signer.public_key(),
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            sender_seq,
            lamport: self.lamport,
            causal_deps: self.causal_deps,
            reward: self.reward,
        };
        let signature = Signer::sign(self.signer, &body.to_signing_bytes());

        Ok(Transaction::from_parts(body, signature))
    }
}
