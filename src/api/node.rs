// Ledger Node - The single entry point for wallets and admin tools
//
// Wraps the gossip engine behind one async lock. Every local submission
// reads the log, signs, and commits inside that lock so sequence numbers
// never race; inbound payloads are decoded and signature-checked before
// the lock is taken. Outbound messages go to an mpsc queue drained by the
// runtime, and ledger events are pushed to subscribers.

use crate::api::{BalanceSubscription, SubscriptionHub};
use crate::clock::now_ms;
use crate::coverage::{CoverageAccountant, CoverageError, RelayProof};
use crate::identity::{Keypair, NodeId, PublicKey};
use crate::ledger::{
    Account, AccountError, AccountStore, Amount, LedgerPolicy, Transaction, TransactionBuilder,
    TransactionError, TransactionLog, TransactionValidator, TxId, TxStatus, ValidationError,
};
use crate::storage::{LedgerStorage, SledStore, StoreError};
use crate::sync::{
    GossipConfig, GossipEngine, GossipEvent, GossipStats, Inbound, LedgerEvent, LogDigest, Message,
    PeerState, ProtocolError, ReconcileConfig, ReconcileError, ReconcileStats, ReconciliationEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Errors reported to API callers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Amount, required: Amount },

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Insufficient witnesses: {valid} valid, {required} required")]
    InsufficientWitnesses { valid: usize, required: usize },

    #[error("Account is banned: {0:?}")]
    AccountBanned(NodeId),

    #[error("Unknown account: {0:?}")]
    UnknownAccount(NodeId),

    #[error("Signer is not authorized for {0}")]
    NotAuthorized(&'static str),

    /// No keypair in the data directory; fatal at startup
    #[error("Node key unavailable")]
    KeyUnavailable,

    #[error("Invalid transaction: {0}")]
    Invalid(String),

    #[error("Coverage error: {0}")]
    Coverage(CoverageError),

    #[error("Reconciliation error: {0}")]
    Reconcile(ReconcileError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InsufficientFunds { available, required } => {
                ApiError::InsufficientFunds { available, required }
            }
            AccountError::AccountBanned(id) => ApiError::AccountBanned(id),
            AccountError::UnknownAccount(id) => ApiError::UnknownAccount(id),
            AccountError::AccountRemoved(_) => {
                ApiError::InvalidRecipient("account was removed".to_string())
            }
            other => ApiError::Invalid(other.to_string()),
        }
    }
}

impl From<CoverageError> for ApiError {
    fn from(err: CoverageError) -> Self {
        match err {
            CoverageError::InsufficientWitnesses { valid, required } => {
                ApiError::InsufficientWitnesses { valid, required }
            }
            other => ApiError::Coverage(other),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Account(e) => e.into(),
            ReconcileError::Coverage(e) => e.into(),
            ReconcileError::Store(e) => ApiError::Store(e),
            other => ApiError::Reconcile(other),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::SelfTransfer => {
                ApiError::InvalidRecipient("cannot transfer to yourself".to_string())
            }
            ValidationError::InsufficientWitnesses { valid, required } => {
                ApiError::InsufficientWitnesses { valid, required }
            }
            ValidationError::Unauthorized(kind) => ApiError::NotAuthorized(kind),
            other => ApiError::Invalid(other.to_string()),
        }
    }
}

impl From<TransactionError> for ApiError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::SelfTransfer => {
                ApiError::InvalidRecipient("cannot transfer to yourself".to_string())
            }
            other => ApiError::Invalid(other.to_string()),
        }
    }
}

/// Node tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerNodeConfig {
    pub gossip: GossipConfig,
    pub reconcile: ReconcileConfig,
    /// Messages waiting for the runtime to broadcast them
    pub outbound_capacity: usize,
    /// Events buffered per subscriber before it lags
    pub subscription_capacity: usize,
}

impl Default for LedgerNodeConfig {
    fn default() -> Self {
        Self {
            gossip: GossipConfig::default(),
            reconcile: ReconcileConfig::default(),
            outbound_capacity: 256,
            subscription_capacity: 256,
        }
    }
}

impl LedgerNodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }
}

/// Result of submitting a relay proof
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofReceipt {
    /// This node holds the issuer key and committed the reward
    Issued(TxId),
    /// The proof was valid and sent on to the issuer
    Forwarded,
}

/// Read-only view of one gossip peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub node_id: NodeId,
    pub state: PeerState,
    pub last_seen: u64,
    pub last_digest_streams: usize,
}

/// Counters across the node's subsystems
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub gossip: GossipStats,
    pub reconcile: ReconcileStats,
    pub accounts: usize,
    pub transactions: usize,
    pub pending: usize,
    pub issued_supply: Amount,
    pub peers: usize,
}

/// A running ledger participant
pub struct LedgerNode {
    keypair: Keypair,
    node_id: NodeId,
    policy: LedgerPolicy,
    accountant: CoverageAccountant,
    engine: Mutex<GossipEngine>,
    outbound: mpsc::Sender<Message>,
    hub: SubscriptionHub,
}

impl LedgerNode {
    /// Create a node over `storage`, replaying whatever it already holds
    ///
    /// Returns the node and the queue of messages it wants broadcast.
    pub fn new(
        keypair: Keypair,
        policy: LedgerPolicy,
        storage: Box<dyn LedgerStorage>,
        config: LedgerNodeConfig,
    ) -> Result<(Self, mpsc::Receiver<Message>), ApiError> {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        let reconciler =
            ReconciliationEngine::new(policy.clone(), storage, config.reconcile.clone())?;
        let engine = GossipEngine::new(node_id, reconciler, config.gossip.clone());
        let (outbound, rx) = mpsc::channel(config.outbound_capacity.max(1));
        info!(
            node = %node_id.short(),
            accounts = engine.reconciler().accounts().len(),
            transactions = engine.reconciler().log().len(),
            "ledger node ready"
        );
        Ok((
            Self {
                accountant: CoverageAccountant::new(&policy),
                keypair,
                node_id,
                policy,
                engine: Mutex::new(engine),
                outbound,
                hub: SubscriptionHub::new(config.subscription_capacity),
            },
            rx,
        ))
    }

    /// Open a node from a sled data directory holding its keypair
    pub fn open<P: AsRef<Path>>(
        path: P,
        policy: LedgerPolicy,
        config: LedgerNodeConfig,
    ) -> Result<(Self, mpsc::Receiver<Message>), ApiError> {
        let store = SledStore::open(path)?;
        let keypair = store.load_keypair()?.ok_or(ApiError::KeyUnavailable)?;
        Self::new(keypair, policy, Box::new(store), config)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub async fn get_balance(&self, node_id: &NodeId) -> Amount {
        self.engine.lock().await.reconciler().accounts().balance(node_id)
    }

    pub async fn get_account(&self, node_id: &NodeId) -> Result<Account, ApiError> {
        let engine = self.engine.lock().await;
        Ok(engine.reconciler().accounts().get_account(node_id)?.clone())
    }

    pub async fn accounts(&self) -> Vec<Account> {
        let engine = self.engine.lock().await;
        engine.reconciler().accounts().accounts().cloned().collect()
    }

    /// Committed transactions involving `node_id` in canonical order
    pub async fn get_history(&self, node_id: &NodeId) -> Vec<Transaction> {
        let engine = self.engine.lock().await;
        engine.reconciler().log().history(node_id).into_iter().cloned().collect()
    }

    pub async fn transaction_status(&self, id: &TxId) -> Option<TxStatus> {
        self.engine.lock().await.reconciler().log().status(id)
    }

    /// Local wall-clock time the transaction was first logged
    pub async fn received_at(&self, id: &TxId) -> Option<u64> {
        self.engine.lock().await.reconciler().log().get(id).map(|e| e.received_at())
    }

    pub async fn digest(&self) -> LogDigest {
        self.engine.lock().await.digest(now_ms())
    }

    /// Gossip peers and their sync state
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let engine = self.engine.lock().await;
        engine
            .peers()
            .all_peers()
            .into_iter()
            .map(|p| PeerSnapshot {
                node_id: *p.node_id(),
                state: p.state(),
                last_seen: p.last_seen(),
                last_digest_streams: p.last_digest_streams(),
            })
            .collect()
    }

    pub async fn stats(&self) -> NodeStats {
        let engine = self.engine.lock().await;
        let reconciler = engine.reconciler();
        NodeStats {
            gossip: engine.stats().clone(),
            reconcile: reconciler.stats().clone(),
            accounts: reconciler.accounts().len(),
            transactions: reconciler.log().len(),
            pending: reconciler.log().pending_count(),
            issued_supply: reconciler.accounts().issued_supply(),
            peers: engine.peers().peer_count(),
        }
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Balance changes of `node_id`, local or arriving by gossip
    pub fn subscribe(&self, node_id: NodeId) -> BalanceSubscription {
        self.hub.subscribe(node_id)
    }

    pub fn on_balance_change<F>(&self, node_id: NodeId, handler: F) -> JoinHandle<()>
    where
        F: FnMut(crate::ledger::BalanceChange) + Send + 'static,
    {
        self.hub.on_balance_change(node_id, handler)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LedgerEvent> {
        self.hub.subscribe_all()
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    /// Register this node's account under `display_name`
    pub async fn register(&self, display_name: &str) -> Result<TxId, ApiError> {
        self.register_as(&self.keypair, display_name).await
    }

    pub async fn register_as(
        &self,
        keypair: &Keypair,
        display_name: &str,
    ) -> Result<TxId, ApiError> {
        let node = NodeId::from_public_key(&keypair.public_key());
        self.submit_with(|log, _| {
            Ok(TransactionBuilder::register(keypair, display_name)
                .sequence(log.tip(&node) + 1)
                .lamport(log.max_lamport() + 1)
                .build()?)
        })
        .await
    }

    /// Pay `amount` from this node's account
    pub async fn submit_transfer(
        &self,
        recipient: NodeId,
        amount: Amount,
    ) -> Result<TxId, ApiError> {
        self.submit_transfer_from(&self.keypair, recipient, amount).await
    }

    /// Pay `amount` from the account of `sender`
    ///
    /// Refused submissions are reported here and never gossiped.
    pub async fn submit_transfer_from(
        &self,
        sender: &Keypair,
        recipient: NodeId,
        amount: Amount,
    ) -> Result<TxId, ApiError> {
        let sender_id = NodeId::from_public_key(&sender.public_key());
        if recipient == sender_id {
            return Err(ApiError::InvalidRecipient("cannot transfer to yourself".to_string()));
        }
        if amount.is_zero() {
            return Err(ApiError::Invalid("amount must be positive".to_string()));
        }
        let id = self
            .submit_with(|log, accounts| {
                check_recipient(accounts, &recipient)?;
                let mut deps = log.latest_credits(&sender_id);
                deps.extend(log.registration(&recipient));
                Ok(TransactionBuilder::transfer(sender, recipient, amount)
                    .sequence(log.tip(&sender_id) + 1)
                    .lamport(log.max_lamport() + 1)
                    .depends_on(deps)
                    .build()?)
            })
            .await?;
        info!(tx = %id.short(), to = %recipient.short(), %amount, "transfer submitted");
        Ok(id)
    }

    /// Credit new supply; the node key must be a genesis authority
    pub async fn mint_genesis(&self, recipient: NodeId, amount: Amount) -> Result<TxId, ApiError> {
        if !self.policy.is_genesis_authority(&self.keypair.public_key()) {
            return Err(ApiError::NotAuthorized("genesis"));
        }
        let stream = self.node_id;
        self.submit_with(|log, accounts| {
            check_recipient(accounts, &recipient)?;
            Ok(TransactionBuilder::genesis(&self.keypair, recipient, amount)
                .sequence(log.tip(&stream) + 1)
                .lamport(log.max_lamport() + 1)
                .build()?)
        })
        .await
    }

    /// Reward a relay, or send the proof toward a node that may
    pub async fn submit_relay_proof(&self, proof: RelayProof) -> Result<ProofReceipt, ApiError> {
        self.accountant.validate(&proof)?;
        if self.accountant.is_issuer_for(&self.keypair.public_key(), &proof.relayer) {
            let id = self.issue_reward(&proof).await?;
            return Ok(ProofReceipt::Issued(id));
        }
        let event = self.engine.lock().await.forward_proof(proof, now_ms());
        self.route(vec![event]);
        Ok(ProofReceipt::Forwarded)
    }

    async fn issue_reward(&self, proof: &RelayProof) -> Result<TxId, ApiError> {
        let id = self
            .submit_with(|log, _| Ok(self.accountant.issue(&self.keypair, proof, log)?))
            .await?;
        info!(tx = %id.short(), relayer = %proof.relayer.short(), "relay reward issued");
        Ok(id)
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    /// Bring `target`'s balance to `new_balance`
    ///
    /// Recorded as a signed credit or debit of the difference from the
    /// balance this node sees, on the target's own stream.
    pub async fn adjust_balance(
        &self,
        target: NodeId,
        new_balance: Amount,
    ) -> Result<TxId, ApiError> {
        self.require_admin()?;
        let id = self
            .submit_with(|log, accounts| {
                let current = accounts.get_account(&target)?.balance();
                let builder = match new_balance.checked_sub(current) {
                    Some(delta) if !delta.is_zero() => {
                        TransactionBuilder::admin_credit(&self.keypair, target, delta)
                    }
                    Some(_) => return Err(ApiError::Invalid("balance is unchanged".to_string())),
                    None => TransactionBuilder::admin_debit(
                        &self.keypair,
                        target,
                        current.saturating_sub(new_balance),
                    ),
                };
                Ok(builder
                    .sequence(log.tip(&target) + 1)
                    .lamport(log.max_lamport() + 1)
                    .depends_on(admin_deps(log, &target))
                    .build()?)
            })
            .await?;
        info!(tx = %id.short(), target = %target.short(), %new_balance, "balance adjusted");
        Ok(id)
    }

    /// Burn `target`'s balance and tombstone the account
    pub async fn remove_account(&self, target: NodeId) -> Result<TxId, ApiError> {
        self.require_admin()?;
        self.submit_with(|log, _| {
            Ok(TransactionBuilder::admin_remove(&self.keypair, target)
                .sequence(log.tip(&target) + 1)
                .lamport(log.max_lamport() + 1)
                .depends_on(admin_deps(log, &target))
                .build()?)
        })
        .await
    }

    pub async fn ban_account(&self, target: NodeId, banned: bool) -> Result<TxId, ApiError> {
        self.require_admin()?;
        self.submit_with(|log, _| {
            Ok(TransactionBuilder::admin_ban(&self.keypair, target, banned)
                .sequence(log.tip(&target) + 1)
                .lamport(log.max_lamport() + 1)
                .depends_on(admin_deps(log, &target))
                .build()?)
        })
        .await
    }

    fn require_admin(&self) -> Result<(), ApiError> {
        if self.policy.is_admin(&self.keypair.public_key()) {
            Ok(())
        } else {
            Err(ApiError::NotAuthorized("admin"))
        }
    }

    /// Build, verify and commit one local transaction under the engine lock
    async fn submit_with<F>(&self, build: F) -> Result<TxId, ApiError>
    where
        F: FnOnce(&TransactionLog, &AccountStore) -> Result<Transaction, ApiError>,
    {
        let mut engine = self.engine.lock().await;
        let reconciler = engine.reconciler();
        let tx = build(reconciler.log(), reconciler.accounts())?;
        let verified = TransactionValidator::verify(&tx, &self.policy)?;
        let (id, events) = engine.submit_local(verified, now_ms())?;
        drop(engine);
        self.route(events);
        Ok(id)
    }

    // ========================================================================
    // GOSSIP
    // ========================================================================

    /// Process one payload received from the mesh
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<(), ApiError> {
        let msg = Message::from_bytes(payload)?;
        let inbound = Inbound::from_message(msg, &self.policy);
        let events = self.engine.lock().await.handle_inbound(inbound, now_ms());
        self.dispatch(events).await;
        Ok(())
    }

    /// One gossip cycle: expire stale state and queue our digest
    pub async fn tick(&self) {
        let events = self.engine.lock().await.tick(now_ms());
        self.dispatch(events).await;
    }

    /// Flush durable state
    pub async fn flush(&self) -> Result<(), ApiError> {
        self.engine.lock().await.reconciler().flush()?;
        Ok(())
    }

    async fn dispatch(&self, events: Vec<GossipEvent>) {
        for (from, proof) in self.route(events) {
            if !self.accountant.is_issuer_for(&self.keypair.public_key(), &proof.relayer) {
                trace!(from = %from.short(), "relay proof for another issuer");
                continue;
            }
            match self.issue_reward(&proof).await {
                Ok(_) => {}
                Err(ApiError::Coverage(CoverageError::AlreadyRewarded(relayer))) => {
                    trace!(relayer = %relayer.short(), "relay already rewarded");
                }
                Err(e) => debug!(from = %from.short(), error = %e, "relay proof not rewarded"),
            }
        }
    }

    /// Queue sends and publish ledger events; returns proofs left to handle
    fn route(&self, events: Vec<GossipEvent>) -> Vec<(NodeId, RelayProof)> {
        let mut proofs = Vec::new();
        for event in events {
            match event {
                GossipEvent::Send(msg) => self.enqueue(msg),
                GossipEvent::Ledger(event) => self.hub.publish(event),
                GossipEvent::RelayProofReceived { from, proof } => proofs.push((from, proof)),
            }
        }
        proofs
    }

    fn enqueue(&self, msg: Message) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(kind = ?msg.message_type(), "outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => trace!("outbound queue closed"),
        }
    }
}

/// Dependencies of an admin action on `target`
///
/// The latest credits to `target` the admin has seen, so a debit never
/// meets a smaller balance on another node than the one it was sized on.
fn admin_deps(log: &TransactionLog, target: &NodeId) -> BTreeSet<TxId> {
    let mut deps = log.latest_credits(target);
    deps.extend(log.registration(target));
    deps
}

/// Local refusal of credits that the ledger would burn or the target
/// could not spend
fn check_recipient(accounts: &AccountStore, recipient: &NodeId) -> Result<(), ApiError> {
    if accounts.is_removed(recipient) {
        return Err(ApiError::InvalidRecipient("account was removed".to_string()));
    }
    match accounts.get_account(recipient) {
        Ok(account) if account.is_banned() => Err(ApiError::AccountBanned(*recipient)),
        _ => Ok(()),
    }
}
