// Account store: the only writer of balances

use crate::identity::NodeId;
use crate::ledger::{Amount, Transaction, TxKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that can occur while applying a transaction to accounts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Amount, required: Amount },

    #[error("Unknown account: {0:?}")]
    UnknownAccount(NodeId),

    #[error("Account is banned: {0:?}")]
    AccountBanned(NodeId),

    #[error("Account was removed: {0:?}")]
    AccountRemoved(NodeId),

    #[error("Account already registered: {0:?}")]
    AlreadyRegistered(NodeId),

    #[error("Balance would overflow")]
    BalanceOverflow,
}

/// One account's state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    node_id: NodeId,
    display_name: String,
    balance: Amount,
    highest_balance_seen: Amount,
    /// Lamport time of the transaction that created the account
    created_at: u64,
    banned: bool,
    relay_rewards: u32,
    transfers_sent: u32,
    transfers_received: u32,
}

impl Account {
    fn new(node_id: NodeId, created_at: u64) -> Self {
        Self {
            node_id,
            display_name: String::new(),
            balance: Amount::ZERO,
            highest_balance_seen: Amount::ZERO,
            created_at,
            banned: false,
            relay_rewards: 0,
            transfers_sent: 0,
            transfers_received: 0,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Callsign; empty for accounts created implicitly by a credit
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn highest_balance_seen(&self) -> Amount {
        self.highest_balance_seen
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_banned(&self) -> bool {
        self.banned
    }

    pub fn relay_rewards(&self) -> u32 {
        self.relay_rewards
    }

    pub fn transfers_sent(&self) -> u32 {
        self.transfers_sent
    }

    pub fn transfers_received(&self) -> u32 {
        self.transfers_received
    }

    /// 0..=100, derived from relay work and transfer activity
    pub fn trust_score(&self) -> u8 {
        if self.banned {
            return 0;
        }
        let activity = u64::from(self.relay_rewards) * 5
            + u64::from(self.transfers_sent)
            + u64::from(self.transfers_received);
        activity.min(100) as u8
    }

    fn set_balance(&mut self, balance: Amount) -> BalanceChange {
        let change = BalanceChange {
            node_id: self.node_id,
            old: self.balance,
            new: balance,
        };
        self.balance = balance;
        if balance > self.highest_balance_seen {
            self.highest_balance_seen = balance;
        }
        change
    }
}

/// A balance movement caused by applying one transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub node_id: NodeId,
    pub old: Amount,
    pub new: Amount,
}

/// Effects of a successfully applied transaction
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    /// Balance movements, in application order
    pub changes: Vec<BalanceChange>,
    /// Accounts whose record changed and must be persisted
    pub touched: Vec<NodeId>,
    /// Account tombstoned by this transaction
    pub removed: Option<NodeId>,
}

/// Mapping from node identity to account state
///
/// Mutated only through [`AccountStore::apply_transaction`], which either
/// applies the whole transaction or nothing.
#[derive(Clone, Debug, Default)]
pub struct AccountStore {
    accounts: BTreeMap<NodeId, Account>,
    removed: BTreeSet<NodeId>,
    issued: Amount,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_account(&self, node_id: &NodeId) -> Result<&Account, AccountError> {
        self.accounts
            .get(node_id)
            .ok_or(AccountError::UnknownAccount(*node_id))
    }

    /// Balance of `node_id`, zero for unknown accounts
    pub fn balance(&self, node_id: &NodeId) -> Amount {
        self.accounts
            .get(node_id)
            .map(|a| a.balance)
            .unwrap_or(Amount::ZERO)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.accounts.contains_key(node_id)
    }

    pub fn is_removed(&self, node_id: &NodeId) -> bool {
        self.removed.contains(node_id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn total_balance(&self) -> Amount {
        self.accounts.values().map(|a| a.balance).sum()
    }

    /// Genesis + rewards + net admin adjustments applied so far
    pub fn issued_supply(&self) -> Amount {
        self.issued
    }

    /// Check the supply invariant: every unit in an account was issued
    pub fn is_conserved(&self) -> bool {
        self.total_balance() == self.issued
    }

    /// Check whether `tx` would apply, without mutating anything
    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), AccountError> {
        self.clone().apply_transaction(tx).map(|_| ())
    }

    /// Apply a committed transaction atomically
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<Applied, AccountError> {
        let recipient = tx.recipient();
        let amount = tx.amount();

        match tx.kind() {
            TxKind::Genesis | TxKind::RelayReward => {
                if self.is_removed(&recipient) {
                    return Ok(Applied::default());
                }
                let current = self.balance(&recipient);
                let new_balance = current.checked_add(amount).ok_or(AccountError::BalanceOverflow)?;
                let issued = self.issued.checked_add(amount).ok_or(AccountError::BalanceOverflow)?;

                let is_reward = tx.kind() == &TxKind::RelayReward;
                let account = self.get_or_create(recipient, tx.lamport());
                let change = account.set_balance(new_balance);
                if is_reward {
                    account.relay_rewards += 1;
                }
                self.issued = issued;
                Ok(Applied {
                    changes: vec![change],
                    touched: vec![recipient],
                    removed: None,
                })
            }

            TxKind::Register { display_name } => {
                self.ensure_not_removed(&recipient)?;
                if let Some(existing) = self.accounts.get(&recipient) {
                    if !existing.display_name.is_empty() {
                        return Err(AccountError::AlreadyRegistered(recipient));
                    }
                }
                let account = self.get_or_create(recipient, tx.lamport());
                account.display_name = display_name.clone();
                Ok(Applied {
                    changes: Vec::new(),
                    touched: vec![recipient],
                    removed: None,
                })
            }

            TxKind::Transfer => {
                let sender = tx.sender().ok_or(AccountError::UnknownAccount(tx.stream()))?;
                let from = self.get_account(&sender)?;
                if from.banned {
                    return Err(AccountError::AccountBanned(sender));
                }
                if from.balance < amount {
                    return Err(AccountError::InsufficientFunds {
                        available: from.balance,
                        required: amount,
                    });
                }
                let debited = from.balance.saturating_sub(amount);
                let burned = self.is_removed(&recipient);
                let credited = if burned {
                    Amount::ZERO
                } else {
                    self.balance(&recipient)
                        .checked_add(amount)
                        .ok_or(AccountError::BalanceOverflow)?
                };

                let mut changes = Vec::with_capacity(2);
                if let Some(from) = self.accounts.get_mut(&sender) {
                    changes.push(from.set_balance(debited));
                    from.transfers_sent += 1;
                }
                if burned {
                    // Funds sent to a tombstoned account leave the supply
                    self.issued = self.issued.saturating_sub(amount);
                    return Ok(Applied {
                        changes,
                        touched: vec![sender],
                        removed: None,
                    });
                }
                let to = self.get_or_create(recipient, tx.lamport());
                changes.push(to.set_balance(credited));
                to.transfers_received += 1;

                Ok(Applied {
                    changes,
                    touched: vec![sender, recipient],
                    removed: None,
                })
            }

            TxKind::AdminAdjust { credit: true } => {
                if self.is_removed(&recipient) {
                    return Ok(Applied::default());
                }
                let new_balance = self
                    .balance(&recipient)
                    .checked_add(amount)
                    .ok_or(AccountError::BalanceOverflow)?;
                let issued = self.issued.checked_add(amount).ok_or(AccountError::BalanceOverflow)?;
                let change = self.get_or_create(recipient, tx.lamport()).set_balance(new_balance);
                self.issued = issued;
                Ok(Applied {
                    changes: vec![change],
                    touched: vec![recipient],
                    removed: None,
                })
            }

            TxKind::AdminAdjust { credit: false } => {
                let Some(account) = self.accounts.get_mut(&recipient) else {
                    return Ok(Applied::default());
                };
                let taken = account.balance.min(amount);
                let change = account.set_balance(account.balance.saturating_sub(taken));
                self.issued = self.issued.saturating_sub(taken);
                Ok(Applied {
                    changes: vec![change],
                    touched: vec![recipient],
                    removed: None,
                })
            }

            TxKind::AdminRemove => {
                self.removed.insert(recipient);
                let Some(account) = self.accounts.remove(&recipient) else {
                    return Ok(Applied {
                        removed: Some(recipient),
                        ..Applied::default()
                    });
                };
                self.issued = self.issued.saturating_sub(account.balance);
                Ok(Applied {
                    changes: vec![BalanceChange {
                        node_id: recipient,
                        old: account.balance,
                        new: Amount::ZERO,
                    }],
                    touched: Vec::new(),
                    removed: Some(recipient),
                })
            }

            TxKind::AdminBan { banned } => {
                if self.is_removed(&recipient) {
                    return Ok(Applied::default());
                }
                self.get_or_create(recipient, tx.lamport()).banned = *banned;
                Ok(Applied {
                    changes: Vec::new(),
                    touched: vec![recipient],
                    removed: None,
                })
            }
        }
    }

    fn ensure_not_removed(&self, node_id: &NodeId) -> Result<(), AccountError> {
        if self.removed.contains(node_id) {
            return Err(AccountError::AccountRemoved(*node_id));
        }
        Ok(())
    }

    /// Creation time is the earliest lamport that touched the account
    fn get_or_create(&mut self, node_id: NodeId, lamport: u64) -> &mut Account {
        let account = self
            .accounts
            .entry(node_id)
            .or_insert_with(|| Account::new(node_id, lamport));
        account.created_at = account.created_at.min(lamport);
        account
    }
}
