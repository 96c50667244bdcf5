// Transaction log: every transaction this node knows about, keyed by txId,
// with a (stream, seq) index for range queries and gap detection

use crate::identity::NodeId;
use crate::ledger::{AccountError, Amount, Transaction, TxId, TxKind, TxStatus, VerifiedTransaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogError {
    #[error("Duplicate transaction: {0:?} is already in the log")]
    DuplicateTxId(TxId),

    #[error("Unknown transaction: {0:?}")]
    UnknownTx(TxId),

    #[error("Invalid status transition for {id:?}: {from:?} -> {to:?}")]
    InvalidTransition { id: TxId, from: TxStatus, to: TxStatus },

    #[error("Slot ({stream:?}, {seq}) is already decided by {winner:?}")]
    SlotDecided { stream: NodeId, seq: u64, winner: TxId },
}

/// Why a transaction ended up Rejected
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// A sibling with a smaller txId holds the same (stream, seq) slot
    Conflict { winner: TxId },
    DependencyRejected { dep: TxId },
    InsufficientFunds { available: Amount, required: Amount },
    AccountState(String),
    InvalidReward(String),
}

impl RejectReason {
    /// Losing a sibling race is final; other outcomes depend on replay state
    pub fn is_conflict(&self) -> bool {
        matches!(self, RejectReason::Conflict { .. })
    }
}

impl From<AccountError> for RejectReason {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InsufficientFunds { available, required } => {
                RejectReason::InsufficientFunds { available, required }
            }
            other => RejectReason::AccountState(other.to_string()),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Conflict { winner } => write!(f, "conflict, lost to {}", winner.short()),
            RejectReason::DependencyRejected { dep } => {
                write!(f, "dependency {} rejected", dep.short())
            }
            RejectReason::InsufficientFunds { available, required } => {
                write!(f, "insufficient funds ({available} < {required})")
            }
            RejectReason::AccountState(msg) => write!(f, "{msg}"),
            RejectReason::InvalidReward(msg) => write!(f, "invalid reward: {msg}"),
        }
    }
}

/// A transaction plus its local bookkeeping
#[derive(Clone, Debug)]
pub struct LogEntry {
    tx: Transaction,
    id: TxId,
    stream: NodeId,
    status: TxStatus,
    reject_reason: Option<RejectReason>,
    received_at: u64,
}

impl LogEntry {
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

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        self.reject_reason.as_ref()
    }

    /// Local wall-clock millis when the entry was appended
    pub fn received_at(&self) -> u64 {
        self.received_at
    }

    fn canonical_key(&self) -> (u64, TxId) {
        (self.tx.lamport(), self.id)
    }
}

/// Append-only transaction log
///
/// Each (stream, seq) slot is decided by exactly one transaction, which is
/// either Committed or Rejected; siblings of the decider are Rejected as
/// conflicts. Decided slots of a stream are always contiguous from 1.
#[derive(Debug, Default)]
pub struct TransactionLog {
    entries: HashMap<TxId, LogEntry>,
    slots: BTreeMap<(NodeId, u64), BTreeSet<TxId>>,
    decided: BTreeMap<(NodeId, u64), TxId>,
    /// Committed ids in the order they were applied to accounts
    commit_order: Vec<TxId>,
    max_lamport: u64,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a verified transaction as Pending
    pub fn append(&mut self, tx: VerifiedTransaction, received_at: u64) -> Result<(), LogError> {
        let id = tx.id();
        if self.entries.contains_key(&id) {
            return Err(LogError::DuplicateTxId(id));
        }
        let stream = tx.stream();
        let seq = tx.seq();
        self.max_lamport = self.max_lamport.max(tx.transaction().lamport());
        self.slots.entry((stream, seq)).or_default().insert(id);
        self.entries.insert(
            id,
            LogEntry {
                tx: tx.into_inner(),
                id,
                stream,
                status: TxStatus::Pending,
                reject_reason: None,
                received_at,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &TxId) -> Option<&LogEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn status(&self, id: &TxId) -> Option<TxStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_lamport(&self) -> u64 {
        self.max_lamport
    }

    /// Commit a Pending transaction, deciding its slot
    pub fn mark_committed(&mut self, id: &TxId) -> Result<(), LogError> {
        self.decide(id, TxStatus::Committed, None)?;
        self.commit_order.push(*id);
        Ok(())
    }

    /// Reject a Pending transaction
    ///
    /// With `decides_slot` the rejection settles the slot so the stream can
    /// advance; otherwise the slot stays open for a sibling.
    pub fn mark_rejected(
        &mut self,
        id: &TxId,
        reason: RejectReason,
        decides_slot: bool,
    ) -> Result<(), LogError> {
        if decides_slot {
            return self.decide(id, TxStatus::Rejected, Some(reason));
        }
        let entry = self.entries.get_mut(id).ok_or(LogError::UnknownTx(*id))?;
        if entry.status != TxStatus::Pending {
            return Err(LogError::InvalidTransition {
                id: *id,
                from: entry.status,
                to: TxStatus::Rejected,
            });
        }
        entry.status = TxStatus::Rejected;
        entry.reject_reason = Some(reason);
        Ok(())
    }

    /// Generic status update; Committed decides the slot, Rejected does not
    pub fn mark_status(
        &mut self,
        id: &TxId,
        status: TxStatus,
        reason: Option<RejectReason>,
    ) -> Result<(), LogError> {
        match status {
            TxStatus::Committed => self.mark_committed(id),
            TxStatus::Rejected => {
                let reason = reason.unwrap_or(RejectReason::AccountState("rejected".into()));
                self.mark_rejected(id, reason, false)
            }
            TxStatus::Pending => {
                let from = self.status(id).ok_or(LogError::UnknownTx(*id))?;
                Err(LogError::InvalidTransition { id: *id, from, to: status })
            }
        }
    }

    fn decide(
        &mut self,
        id: &TxId,
        status: TxStatus,
        reason: Option<RejectReason>,
    ) -> Result<(), LogError> {
        let entry = self.entries.get(id).ok_or(LogError::UnknownTx(*id))?;
        if entry.status != TxStatus::Pending {
            return Err(LogError::InvalidTransition {
                id: *id,
                from: entry.status,
                to: status,
            });
        }
        let slot = (entry.stream, entry.seq());
        if let Some(winner) = self.decided.get(&slot) {
            return Err(LogError::SlotDecided {
                stream: slot.0,
                seq: slot.1,
                winner: *winner,
            });
        }
        self.decided.insert(slot, *id);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = status;
            entry.reject_reason = reason;
        }
        Ok(())
    }

    /// Drop a Pending entry entirely (timeout); decided entries stay forever
    pub fn remove_pending(&mut self, id: &TxId) -> Result<Transaction, LogError> {
        let status = self.status(id).ok_or(LogError::UnknownTx(*id))?;
        if status != TxStatus::Pending {
            return Err(LogError::InvalidTransition {
                id: *id,
                from: status,
                to: TxStatus::Pending,
            });
        }
        let entry = self.entries.remove(id).ok_or(LogError::UnknownTx(*id))?;
        let slot = (entry.stream, entry.seq());
        if let Some(ids) = self.slots.get_mut(&slot) {
            ids.remove(id);
            if ids.is_empty() {
                self.slots.remove(&slot);
            }
        }
        Ok(entry.tx)
    }

    /// Undo every slot decision except conflict losses, for deterministic replay
    ///
    /// Returns the previous commit order. `superseded` (if any) becomes a
    /// conflict loser to `winner` instead of returning to Pending.
    pub fn reopen_for_replay(&mut self, superseded: Option<(TxId, TxId)>) -> Vec<TxId> {
        for entry in self.entries.values_mut() {
            let reopen = match (&entry.status, &entry.reject_reason) {
                (TxStatus::Committed, _) => true,
                (TxStatus::Rejected, Some(reason)) => !reason.is_conflict(),
                _ => false,
            };
            if reopen {
                entry.status = TxStatus::Pending;
                entry.reject_reason = None;
            }
        }
        if let Some((loser, winner)) = superseded {
            if let Some(entry) = self.entries.get_mut(&loser) {
                entry.status = TxStatus::Rejected;
                entry.reject_reason = Some(RejectReason::Conflict { winner });
            }
        }
        self.decided.clear();
        std::mem::take(&mut self.commit_order)
    }

    /// Highest decided seq of `stream` (0 if none)
    pub fn tip(&self, stream: &NodeId) -> u64 {
        self.decided
            .range((*stream, 0)..=(*stream, u64::MAX))
            .next_back()
            .map(|((_, seq), _)| *seq)
            .unwrap_or(0)
    }

    /// Highest seq of `stream` that is decided or still Pending
    pub fn highest_seq(&self, stream: &NodeId) -> u64 {
        self.entries
            .values()
            .filter(|e| e.stream == *stream && e.status == TxStatus::Pending)
            .map(LogEntry::seq)
            .max()
            .unwrap_or(0)
            .max(self.tip(stream))
    }

    pub fn decider(&self, stream: &NodeId, seq: u64) -> Option<TxId> {
        self.decided.get(&(*stream, seq)).copied()
    }

    /// All known ids at a slot, ascending
    pub fn slot_candidates(&self, stream: &NodeId, seq: u64) -> Vec<TxId> {
        self.slots
            .get(&(*stream, seq))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Decided transactions of `stream` from `from_seq` on, in seq order
    pub fn range(&self, stream: &NodeId, from_seq: u64) -> Vec<&Transaction> {
        self.range_between(stream, from_seq, u64::MAX)
    }

    pub fn range_between(&self, stream: &NodeId, from_seq: u64, to_seq: u64) -> Vec<&Transaction> {
        if from_seq > to_seq {
            return Vec::new();
        }
        self.decided
            .range((*stream, from_seq)..=(*stream, to_seq))
            .filter_map(|(_, id)| self.entries.get(id).map(|e| &e.tx))
            .collect()
    }

    /// Decided ids of `stream` in seq order
    pub fn decided_ids(&self, stream: &NodeId) -> impl Iterator<Item = &TxId> {
        self.decided
            .range((*stream, 0)..=(*stream, u64::MAX))
            .map(|(_, id)| id)
    }

    /// Every stream with at least one decided slot
    pub fn streams(&self) -> BTreeSet<NodeId> {
        self.decided.keys().map(|(stream, _)| *stream).collect()
    }

    /// Streams holding Pending entries
    pub fn pending_streams(&self) -> BTreeSet<NodeId> {
        self.entries
            .values()
            .filter(|e| e.status == TxStatus::Pending)
            .map(|e| e.stream)
            .collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values().filter(|e| e.status == TxStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn commit_order(&self) -> &[TxId] {
        &self.commit_order
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    /// Committed transactions involving `node`, in canonical (lamport, txId) order
    pub fn history(&self, node: &NodeId) -> Vec<&Transaction> {
        let mut entries: Vec<&LogEntry> = self
            .entries
            .values()
            .filter(|e| e.status == TxStatus::Committed && e.tx.involves(node))
            .collect();
        entries.sort_by_key(|e| e.canonical_key());
        entries.into_iter().map(|e| &e.tx).collect()
    }

    /// Latest committed transaction of each stream that credited `node`
    pub fn latest_credits(&self, node: &NodeId) -> BTreeSet<TxId> {
        let mut latest: BTreeMap<NodeId, (u64, TxId)> = BTreeMap::new();
        for id in &self.commit_order {
            let Some(entry) = self.entries.get(id) else { continue };
            let credits = entry.tx.recipient() == *node
                && matches!(
                    entry.tx.kind(),
                    TxKind::Transfer
                        | TxKind::Genesis
                        | TxKind::RelayReward
                        | TxKind::AdminAdjust { credit: true }
                );
            if credits {
                let slot = latest.entry(entry.stream).or_insert((0, *id));
                if entry.seq() >= slot.0 {
                    *slot = (entry.seq(), *id);
                }
            }
        }
        latest.into_values().map(|(_, id)| id).collect()
    }

    /// Committed Register transaction of `node`, if any
    pub fn registration(&self, node: &NodeId) -> Option<TxId> {
        self.decided_ids(node).copied().find(|id| {
            self.entries.get(id).is_some_and(|e| {
                e.status == TxStatus::Committed && matches!(e.tx.kind(), TxKind::Register { .. })
            })
        })
    }

    /// True if `relayer` already holds a committed reward for `packet_hash`
    pub fn is_rewarded(&self, relayer: &NodeId, packet_hash: &[u8; 32]) -> bool {
        self.committed_rewards().any(|tx| {
            tx.recipient() == *relayer && tx.reward().is_some_and(|c| &c.packet_hash == packet_hash)
        })
    }

    /// Committed rewards issued on `stream` in `epoch`
    pub fn rewards_in_epoch(&self, stream: &NodeId, epoch: u64) -> usize {
        self.committed_rewards()
            .filter(|tx| tx.stream() == *stream && tx.reward().is_some_and(|c| c.epoch == epoch))
            .count()
    }

    fn committed_rewards(&self) -> impl Iterator<Item = &Transaction> {
        self.commit_order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.tx)
            .filter(|tx| tx.kind() == &TxKind::RelayReward)
    }
}
