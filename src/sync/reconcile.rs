// Reconciliation - Merges verified transactions into the local log and
// decides every (stream, seq) slot exactly once
//
// A slot is decided by its smallest Pending candidate once the previous
// slot of the stream is decided and every causal dependency is Committed.
// The decider commits if the account store accepts it and is Rejected
// otherwise; its siblings become conflict losers. A late sibling with a
// smaller txId than the decider supersedes it and the account store is
// rebuilt by replay.

use crate::coverage::{CoverageAccountant, CoverageError};
use crate::identity::NodeId;
use crate::ledger::{
    AccountError, AccountStore, Amount, Applied, BalanceChange, LedgerPolicy, LogError,
    RejectReason, Transaction, TransactionLog, TransactionValidator, TxId, TxKind, TxStatus,
    VerifiedTransaction,
};
use crate::storage::{LedgerStorage, StoreError, StoredTransaction};
use crate::sync::LogDigest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by the reconciliation engine
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Rejected locally: {0}")]
    Account(#[from] AccountError),

    #[error("Reward rejected: {0}")]
    Coverage(#[from] CoverageError),

    #[error("Out of sequence: expected seq {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },

    #[error("Dependency {0:?} is not committed")]
    MissingDependency(TxId),

    #[error("Pending buffer full ({0} entries)")]
    PendingFull(usize),
}

/// Reconciliation tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Pending entries older than this are dropped
    pub pending_timeout_ms: u64,
    /// Bound on buffered Pending entries
    pub max_pending: usize,
    /// Transactions per range response
    pub max_batch: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 10 * 60 * 1000,
            max_pending: 1024,
            max_batch: 4,
        }
    }
}

impl ReconcileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending_timeout(mut self, ms: u64) -> Self {
        self.pending_timeout_ms = ms;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max.max(1);
        self
    }
}

/// What happened to an ingested transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already in the log
    Duplicate,
    /// Appended; it may have been decided in the same call
    Accepted,
    /// Its slot was already decided by a smaller txId
    LostConflict { winner: TxId },
    /// It displaced the previous decider of its slot
    Superseded { loser: TxId },
}

impl IngestOutcome {
    /// True if the log learned something new
    pub fn is_new(&self) -> bool {
        !matches!(self, IngestOutcome::Duplicate)
    }
}

/// State changes for subscribers, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Committed { id: TxId, tx: Transaction },
    Rejected { id: TxId, reason: RejectReason },
    BalanceChanged(BalanceChange),
    Expired { id: TxId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub received: u64,
    pub duplicates: u64,
    pub committed: u64,
    pub rejected: u64,
    pub conflicts: u64,
    pub superseded: u64,
    pub expired: u64,
    pub dropped: u64,
}

/// Owner of the local log and account store
///
/// Every mutation of either goes through this type, and the caller holds it
/// behind a single lock, so log append and account mutation form one
/// critical section.
pub struct ReconciliationEngine {
    policy: LedgerPolicy,
    accountant: CoverageAccountant,
    log: TransactionLog,
    accounts: AccountStore,
    storage: Box<dyn LedgerStorage>,
    config: ReconcileConfig,
    events: Vec<LedgerEvent>,
    stats: ReconcileStats,
}

impl ReconciliationEngine {
    /// Open the engine over `storage`, replaying any persisted log
    pub fn new(
        policy: LedgerPolicy,
        storage: Box<dyn LedgerStorage>,
        config: ReconcileConfig,
    ) -> Result<Self, ReconcileError> {
        let mut engine = Self {
            accountant: CoverageAccountant::new(&policy),
            policy,
            log: TransactionLog::new(),
            accounts: AccountStore::new(),
            storage,
            config,
            events: Vec::new(),
            stats: ReconcileStats::default(),
        };
        engine.restore()?;
        Ok(engine)
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn accountant(&self) -> &CoverageAccountant {
        &self.accountant
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    pub fn storage(&self) -> &dyn LedgerStorage {
        self.storage.as_ref()
    }

    pub fn digest(&self, origin: NodeId, now: u64) -> LogDigest {
        LogDigest::compute(origin, &self.log, now)
    }

    /// Events produced since the last call
    pub fn take_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    // ========================================================================
    // RESTORE
    // ========================================================================

    fn restore(&mut self) -> Result<(), ReconcileError> {
        let mut records = self.storage.load_transactions()?;
        if records.is_empty() {
            return Ok(());
        }
        records.sort_by_key(|r| {
            (
                r.commit_index.unwrap_or(u64::MAX),
                r.tx.stream(),
                r.tx.sender_seq(),
            )
        });

        for record in &records {
            let id = record.id();
            let verified = TransactionValidator::verify(&record.tx, &self.policy).map_err(|e| {
                warn!(tx = %id.short(), error = %e, "persisted transaction fails validation");
                StoreError::Corrupted {
                    tree: "transactions",
                    key: id.to_string(),
                }
            })?;
            self.log.append(verified, record.received_at)?;
        }

        for record in &records {
            let id = record.id();
            match (record.status, &record.reject_reason) {
                (TxStatus::Committed, _) => {
                    self.accounts
                        .apply_transaction(&record.tx)
                        .map_err(|_| StoreError::Corrupted {
                            tree: "transactions",
                            key: id.to_string(),
                        })?;
                    self.log.mark_committed(&id)?;
                }
                (TxStatus::Rejected, Some(reason)) => {
                    self.log.mark_rejected(&id, reason.clone(), !reason.is_conflict())?;
                }
                (TxStatus::Rejected, None) => {
                    self.log
                        .mark_rejected(&id, RejectReason::AccountState("rejected".into()), true)?;
                }
                (TxStatus::Pending, _) => {}
            }
        }

        let stored = self.storage.load_accounts()?;
        let derived: Vec<_> = self.accounts.accounts().cloned().collect();
        if stored != derived {
            warn!(
                stored = stored.len(),
                derived = derived.len(),
                "account records differ from log replay, rewriting"
            );
            self.storage.replace_accounts(&derived)?;
        }
        info!(
            transactions = self.log.len(),
            accounts = self.accounts.len(),
            pending = self.log.pending_count(),
            "ledger restored"
        );
        Ok(())
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Merge a transaction received from a peer
    pub fn ingest(
        &mut self,
        tx: VerifiedTransaction,
        now: u64,
    ) -> Result<IngestOutcome, ReconcileError> {
        let id = tx.id();
        if self.log.contains(&id) {
            self.stats.duplicates += 1;
            return Ok(IngestOutcome::Duplicate);
        }
        self.stats.received += 1;
        let (stream, seq) = (tx.stream(), tx.seq());

        if let Some(decider) = self.log.decider(&stream, seq) {
            self.log.append(tx, now)?;
            if decider < id {
                debug!(tx = %id.short(), winner = %decider.short(), "late sibling loses conflict");
                self.reject(&id, RejectReason::Conflict { winner: decider }, false)?;
                self.stats.conflicts += 1;
                return Ok(IngestOutcome::LostConflict { winner: decider });
            }
            self.supersede(decider, id)?;
            return Ok(IngestOutcome::Superseded { loser: decider });
        }

        if self.log.pending_count() >= self.config.max_pending && !self.is_decidable(&tx) {
            self.stats.dropped += 1;
            return Err(ReconcileError::PendingFull(self.config.max_pending));
        }
        self.log.append(tx, now)?;
        self.persist_entry(&id)?;
        if seq > self.log.tip(&stream) + 1 {
            debug!(
                tx = %id.short(),
                seq,
                tip = self.log.tip(&stream),
                "sequence gap, holding pending"
            );
        }
        self.drain()?;
        Ok(IngestOutcome::Accepted)
    }

    /// True if `tx` fills the next slot of its stream and every dependency
    /// is already Committed, so it leaves the buffer on the same ingest
    fn is_decidable(&self, tx: &VerifiedTransaction) -> bool {
        tx.seq() == self.log.tip(&tx.stream()) + 1
            && tx
                .transaction()
                .causal_deps()
                .iter()
                .all(|dep| self.log.status(dep) == Some(TxStatus::Committed))
    }

    /// Admit a locally created transaction only if it commits immediately
    ///
    /// Nothing is appended when the checks fail, so a refused submission
    /// never consumes a sequence number and is never gossiped.
    pub fn submit_local(
        &mut self,
        tx: VerifiedTransaction,
        now: u64,
    ) -> Result<TxId, ReconcileError> {
        let id = tx.id();
        if self.log.contains(&id) {
            return Err(LogError::DuplicateTxId(id).into());
        }
        let expected = self.log.tip(&tx.stream()) + 1;
        if tx.seq() != expected || self.log.decider(&tx.stream(), tx.seq()).is_some() {
            return Err(ReconcileError::OutOfSequence {
                expected,
                got: tx.seq(),
            });
        }
        if let Some(dep) = tx
            .transaction()
            .causal_deps()
            .iter()
            .find(|dep| self.log.status(dep) != Some(TxStatus::Committed))
        {
            return Err(ReconcileError::MissingDependency(*dep));
        }
        if tx.transaction().kind() == &TxKind::RelayReward {
            self.accountant.check_reward(tx.transaction(), &self.log)?;
        }
        self.accounts.check_transaction(tx.transaction())?;

        self.ingest(tx, now)?;
        if self.log.status(&id) != Some(TxStatus::Committed) {
            let reason = self.log.get(&id).and_then(|e| e.reject_reason().cloned());
            warn!(tx = %id.short(), ?reason, "local transaction did not commit");
        }
        Ok(id)
    }

    // ========================================================================
    // SLOT DECISIONS
    // ========================================================================

    /// Decide every slot that is ready, across all streams
    fn drain(&mut self) -> Result<(), ReconcileError> {
        loop {
            let mut progressed = false;
            for stream in self.log.pending_streams() {
                while self.decide_next(&stream)? {
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Try to decide the slot after the stream's tip; false if it must wait
    fn decide_next(&mut self, stream: &NodeId) -> Result<bool, ReconcileError> {
        let seq = self.log.tip(stream) + 1;
        let candidate = self
            .log
            .slot_candidates(stream, seq)
            .into_iter()
            .find(|id| self.log.status(id) == Some(TxStatus::Pending));
        let Some(id) = candidate else {
            return Ok(false);
        };
        let tx = match self.log.get(&id) {
            Some(entry) => entry.transaction().clone(),
            None => return Ok(false),
        };

        for dep in tx.causal_deps() {
            match self.log.status(dep) {
                Some(TxStatus::Committed) => {}
                Some(TxStatus::Rejected) => {
                    self.reject(&id, RejectReason::DependencyRejected { dep: *dep }, true)?;
                    self.reject_siblings(stream, seq, id)?;
                    return Ok(true);
                }
                _ => return Ok(false),
            }
        }

        match self.evaluate(&tx) {
            Ok(applied) => self.commit(&id, tx, applied)?,
            Err(reason) => self.reject(&id, reason, true)?,
        }
        self.reject_siblings(stream, seq, id)?;
        Ok(true)
    }

    fn evaluate(&mut self, tx: &Transaction) -> Result<Applied, RejectReason> {
        if tx.kind() == &TxKind::RelayReward {
            self.accountant
                .check_reward(tx, &self.log)
                .map_err(|e| RejectReason::InvalidReward(e.to_string()))?;
        }
        self.accounts.apply_transaction(tx).map_err(RejectReason::from)
    }

    fn commit(
        &mut self,
        id: &TxId,
        tx: Transaction,
        applied: Applied,
    ) -> Result<(), ReconcileError> {
        self.log.mark_committed(id)?;
        self.stats.committed += 1;
        debug!(tx = %id.short(), kind = tx.kind().name(), seq = tx.sender_seq(), "committed");

        self.persist_entry(id)?;
        for node in &applied.touched {
            if let Ok(account) = self.accounts.get_account(node) {
                self.storage.put_account(account)?;
            }
        }
        if let Some(node) = applied.removed {
            self.storage.remove_account(&node)?;
        }

        self.events.push(LedgerEvent::Committed { id: *id, tx });
        self.events
            .extend(applied.changes.into_iter().map(LedgerEvent::BalanceChanged));
        Ok(())
    }

    fn reject(
        &mut self,
        id: &TxId,
        reason: RejectReason,
        decides_slot: bool,
    ) -> Result<(), ReconcileError> {
        debug!(tx = %id.short(), %reason, "rejected");
        self.log.mark_rejected(id, reason.clone(), decides_slot)?;
        self.stats.rejected += 1;
        self.persist_entry(id)?;
        self.events.push(LedgerEvent::Rejected { id: *id, reason });
        Ok(())
    }

    fn reject_siblings(
        &mut self,
        stream: &NodeId,
        seq: u64,
        winner: TxId,
    ) -> Result<(), ReconcileError> {
        for sibling in self.log.slot_candidates(stream, seq) {
            if sibling != winner && self.log.status(&sibling) == Some(TxStatus::Pending) {
                self.reject(&sibling, RejectReason::Conflict { winner }, false)?;
                self.stats.conflicts += 1;
            }
        }
        Ok(())
    }

    // ========================================================================
    // FORK SUPERSEDE
    // ========================================================================

    /// Replace `loser` as decider of its slot by the smaller `winner`
    fn supersede(&mut self, loser: TxId, winner: TxId) -> Result<(), ReconcileError> {
        warn!(
            loser = %loser.short(),
            winner = %winner.short(),
            "fork detected, rebuilding accounts"
        );
        self.stats.superseded += 1;
        self.stats.conflicts += 1;

        let before_status: HashMap<TxId, TxStatus> =
            self.log.entries().map(|e| (e.id(), e.status())).collect();
        let before_balances: BTreeMap<NodeId, Amount> =
            self.accounts.accounts().map(|a| (*a.node_id(), a.balance())).collect();
        let pending_events = self.events.len();

        let order = self.log.reopen_for_replay(Some((loser, winner)));
        self.accounts = AccountStore::new();
        for id in order {
            let Some(entry) = self.log.get(&id) else { continue };
            let (stream, seq) = (entry.stream(), entry.seq());
            if self.log.tip(&stream) + 1 == seq {
                self.decide_next(&stream)?;
            }
        }
        self.drain()?;

        // Replay re-announces unchanged decisions; keep only real transitions.
        self.events.truncate(pending_events);
        let mut ids: Vec<TxId> = self.log.entries().map(|e| e.id()).collect();
        ids.sort();
        for id in ids {
            let Some(entry) = self.log.get(&id) else { continue };
            let now = entry.status();
            if before_status.get(&id) == Some(&now) {
                continue;
            }
            match now {
                TxStatus::Committed => self.events.push(LedgerEvent::Committed {
                    id,
                    tx: entry.transaction().clone(),
                }),
                TxStatus::Rejected => {
                    if let Some(reason) = entry.reject_reason() {
                        self.events.push(LedgerEvent::Rejected {
                            id,
                            reason: reason.clone(),
                        });
                    }
                }
                TxStatus::Pending => {}
            }
        }
        let mut nodes: Vec<NodeId> = before_balances.keys().copied().collect();
        nodes.extend(self.accounts.accounts().map(|a| *a.node_id()));
        nodes.sort();
        nodes.dedup();
        for node in nodes {
            let old = before_balances.get(&node).copied().unwrap_or(Amount::ZERO);
            let new = self.accounts.balance(&node);
            if old != new {
                self.events
                    .push(LedgerEvent::BalanceChanged(BalanceChange { node_id: node, old, new }));
            }
        }

        self.persist_all()
    }

    // ========================================================================
    // EXPIRY
    // ========================================================================

    /// Drop Pending entries older than the configured timeout
    pub fn expire_pending(&mut self, now: u64) -> Result<Vec<TxId>, ReconcileError> {
        let timeout = self.config.pending_timeout_ms;
        let mut expired: Vec<TxId> = self
            .log
            .pending()
            .filter(|e| now.saturating_sub(e.received_at()) > timeout)
            .map(|e| e.id())
            .collect();
        expired.sort();
        for id in &expired {
            self.log.remove_pending(id)?;
            self.storage.remove_transaction(id)?;
            self.stats.expired += 1;
            self.events.push(LedgerEvent::Expired { id: *id });
            debug!(tx = %id.short(), "pending transaction expired");
        }
        if !expired.is_empty() {
            self.drain()?;
        }
        Ok(expired)
    }

    // ========================================================================
    // SERVING
    // ========================================================================

    /// Decided transactions of `stream` in `from_seq..=to_seq`, at most one batch
    ///
    /// Returns the batch and whether more of the range remains.
    pub fn serve_range(
        &self,
        stream: &NodeId,
        from_seq: u64,
        to_seq: u64,
    ) -> (Vec<Transaction>, bool) {
        let mut range = self.log.range_between(stream, from_seq.max(1), to_seq);
        let has_more = range.len() > self.config.max_batch;
        range.truncate(self.config.max_batch);
        (range.into_iter().cloned().collect(), has_more)
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    fn stored_record(&self, id: &TxId, commit_index: Option<u64>) -> Option<StoredTransaction> {
        self.log.get(id).map(|entry| StoredTransaction {
            tx: entry.transaction().clone(),
            status: entry.status(),
            reject_reason: entry.reject_reason().cloned(),
            commit_index,
            received_at: entry.received_at(),
        })
    }

    fn persist_entry(&mut self, id: &TxId) -> Result<(), ReconcileError> {
        let commit_index = self
            .log
            .commit_order()
            .iter()
            .rposition(|c| c == id)
            .map(|i| i as u64);
        if let Some(record) = self.stored_record(id, commit_index) {
            self.storage.put_transaction(&record)?;
        }
        Ok(())
    }

    fn persist_all(&mut self) -> Result<(), ReconcileError> {
        let positions: HashMap<TxId, u64> = self
            .log
            .commit_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as u64))
            .collect();
        let ids: Vec<TxId> = self.log.entries().map(|e| e.id()).collect();
        for id in ids {
            if let Some(record) = self.stored_record(&id, positions.get(&id).copied()) {
                self.storage.put_transaction(&record)?;
            }
        }
        let accounts: Vec<_> = self.accounts.accounts().cloned().collect();
        self.storage.replace_accounts(&accounts)?;
        self.storage.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ReconcileError> {
        self.storage.flush()?;
        Ok(())
    }
}
