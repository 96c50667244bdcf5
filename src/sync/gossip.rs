// Gossip Engine - Drives reconciliation from mesh messages
//
// Implements gossip-based log synchronization:
// - Digest: every cycle each node broadcasts its per-stream digest
// - Pull: a node behind (or diverged) on a stream requests the range
// - Push: fresh transactions are announced and forwarded a few hops
//
// The engine is synchronous and transport-agnostic: it consumes decoded
// messages and returns events, one of which is "send this message".

use crate::coverage::RelayProof;
use crate::identity::NodeId;
use crate::ledger::{LedgerPolicy, Transaction, TransactionValidator, TxId, VerifiedTransaction};
use crate::sync::protocol::{
    Message, ProtocolError, RangeRequest, RelayProofAnnouncement, SeqRange, TransactionBatch,
    TxAnnouncement,
};
use crate::sync::{
    LedgerEvent, LogDigest, PeerError, PeerInfo, PeerRegistry, PeerState, ReconcileError,
    ReconciliationEngine,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Configuration for the gossip engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Digest broadcast period
    pub gossip_interval_ms: u64,
    /// Maximum hops for transaction announcements
    pub max_hops: u8,
    /// A peer Syncing longer than this falls back to Unknown
    pub sync_timeout_ms: u64,
    /// Peers silent for this long are forgotten
    pub peer_timeout_ms: u64,
    pub max_peers: usize,
    /// Range requests sent in answer to one digest
    pub max_requests_per_digest: usize,
    /// Batches sent in answer to one range request
    pub max_batches_per_request: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 30_000,
            max_hops: 3,
            sync_timeout_ms: 120_000,
            peer_timeout_ms: 15 * 60 * 1000,
            max_peers: 64,
            max_requests_per_digest: 4,
            max_batches_per_request: 8,
        }
    }
}

impl GossipConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gossip_interval(mut self, ms: u64) -> Self {
        self.gossip_interval_ms = ms;
        self
    }

    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_sync_timeout(mut self, ms: u64) -> Self {
        self.sync_timeout_ms = ms;
        self
    }

    pub fn with_peer_timeout(mut self, ms: u64) -> Self {
        self.peer_timeout_ms = ms;
        self
    }

    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }
}

/// Events produced by the gossip engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipEvent {
    /// Broadcast a message on the mesh
    Send(Message),
    /// The local ledger changed
    Ledger(LedgerEvent),
    /// A relay proof arrived; the holder of an issuer key may reward it
    RelayProofReceived { from: NodeId, proof: RelayProof },
}

/// Statistics about the gossip engine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStats {
    pub messages_processed: u64,
    pub messages_sent: u64,
    pub malformed_messages: u64,
    pub invalid_transactions: u64,
    pub digests_received: u64,
    pub ranges_requested: u64,
    pub ranges_served: u64,
    pub announcements_forwarded: u64,
}

/// A received message with every transaction already verified
///
/// Verification only reads the ledger policy, so it runs before the
/// engine lock is taken; only the merge itself is serialized.
#[derive(Clone, Debug)]
pub enum Inbound {
    Digest(LogDigest),
    RangeRequest(RangeRequest),
    Transactions {
        sender: NodeId,
        verified: Vec<VerifiedTransaction>,
        invalid: usize,
        remaining: Option<SeqRange>,
    },
    Announcement {
        announcement: TxAnnouncement,
        verified: Option<VerifiedTransaction>,
    },
    RelayProof(RelayProofAnnouncement),
}

impl Inbound {
    pub fn from_message(msg: Message, policy: &LedgerPolicy) -> Self {
        match msg {
            Message::Digest(digest) => Inbound::Digest(digest),
            Message::RangeRequest(request) => Inbound::RangeRequest(request),
            Message::TransactionBatch(batch) => {
                let total = batch.transactions.len();
                let verified: Vec<VerifiedTransaction> = batch
                    .transactions
                    .iter()
                    .filter_map(|tx| TransactionValidator::verify(tx, policy).ok())
                    .collect();
                Inbound::Transactions {
                    sender: batch.sender,
                    invalid: total - verified.len(),
                    verified,
                    remaining: batch.remaining,
                }
            }
            Message::TxAnnouncement(announcement) => {
                let verified = match TransactionValidator::verify(&announcement.tx, policy) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        trace!(error = %e, "dropping invalid announcement");
                        None
                    }
                };
                Inbound::Announcement {
                    announcement,
                    verified,
                }
            }
            Message::RelayProof(proof) => Inbound::RelayProof(proof),
        }
    }

    pub fn sender(&self) -> NodeId {
        match self {
            Inbound::Digest(d) => d.origin,
            Inbound::RangeRequest(r) => r.requester,
            Inbound::Transactions { sender, .. } => *sender,
            Inbound::Announcement { announcement, .. } => announcement.relayed_by,
            Inbound::RelayProof(p) => p.sender,
        }
    }
}

/// The gossip engine - orchestrates log synchronization with peers
pub struct GossipEngine {
    node_id: NodeId,
    config: GossipConfig,
    reconciler: ReconciliationEngine,
    peers: PeerRegistry,
    stats: GossipStats,
}

impl GossipEngine {
    pub fn new(node_id: NodeId, reconciler: ReconciliationEngine, config: GossipConfig) -> Self {
        Self {
            peers: PeerRegistry::new(node_id, config.max_peers),
            node_id,
            config,
            reconciler,
            stats: GossipStats::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &ReconciliationEngine {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut ReconciliationEngine {
        &mut self.reconciler
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn stats(&self) -> &GossipStats {
        &self.stats
    }

    pub fn digest(&self, now: u64) -> LogDigest {
        self.reconciler.digest(self.node_id, now)
    }

    // ========================================================================
    // LOCAL SUBMISSION
    // ========================================================================

    /// Commit a local transaction and announce it
    pub fn submit_local(
        &mut self,
        tx: VerifiedTransaction,
        now: u64,
    ) -> Result<(TxId, Vec<GossipEvent>), ReconcileError> {
        let announcement =
            TxAnnouncement::new(tx.transaction().clone(), self.node_id, self.config.max_hops, now);
        let id = self.reconciler.submit_local(tx, now)?;
        let mut events = self.ledger_events();
        events.push(self.send(Message::TxAnnouncement(announcement)));
        Ok((id, events))
    }

    /// Announce an already-logged transaction again
    pub fn announce(&mut self, tx: &Transaction, now: u64) -> GossipEvent {
        let announcement = TxAnnouncement::new(tx.clone(), self.node_id, self.config.max_hops, now);
        self.send(Message::TxAnnouncement(announcement))
    }

    /// Send a relay proof toward whichever node may reward it
    pub fn forward_proof(&mut self, proof: RelayProof, now: u64) -> GossipEvent {
        self.send(Message::RelayProof(RelayProofAnnouncement {
            sender: self.node_id,
            proof,
            timestamp: now,
        }))
    }

    // ========================================================================
    // MESSAGE PROCESSING
    // ========================================================================

    /// Decode and process a mesh payload
    pub fn handle_payload(
        &mut self,
        payload: &[u8],
        now: u64,
    ) -> Result<Vec<GossipEvent>, ProtocolError> {
        match Message::from_bytes(payload) {
            Ok(msg) => Ok(self.handle_message(msg, now)),
            Err(e) => {
                self.stats.malformed_messages += 1;
                Err(e)
            }
        }
    }

    /// Verify and process one message
    pub fn handle_message(&mut self, msg: Message, now: u64) -> Vec<GossipEvent> {
        let inbound = Inbound::from_message(msg, self.reconciler.policy());
        self.handle_inbound(inbound, now)
    }

    /// Process a message whose transactions were verified by the caller
    pub fn handle_inbound(&mut self, inbound: Inbound, now: u64) -> Vec<GossipEvent> {
        let sender = inbound.sender();
        if sender == self.node_id {
            return Vec::new();
        }
        self.stats.messages_processed += 1;
        if let Err(e) = self.peers.observe(sender, now) {
            if e != PeerError::CannotAddSelf {
                trace!(peer = %sender.short(), error = %e, "peer not tracked");
            }
        }

        let mut events = match inbound {
            Inbound::Digest(digest) => self.handle_digest(digest, now),
            Inbound::RangeRequest(request) => self.handle_range_request(request, now),
            Inbound::Transactions {
                sender,
                verified,
                invalid,
                remaining,
            } => {
                self.stats.invalid_transactions += invalid as u64;
                if let Some(peer) = self.peers.get_peer_mut(&sender) {
                    peer.record_transactions(verified.len());
                }
                for tx in verified {
                    self.ingest(tx, now);
                }
                match remaining {
                    Some(range) => {
                        let request = RangeRequest::new(
                            self.node_id,
                            sender,
                            range.stream,
                            range.from_seq,
                            range.to_seq,
                            now,
                        );
                        self.stats.ranges_requested += 1;
                        vec![self.send(Message::RangeRequest(request))]
                    }
                    None => Vec::new(),
                }
            }
            Inbound::Announcement {
                announcement,
                verified,
            } => self.handle_announcement(announcement, verified, now),
            Inbound::RelayProof(proof) => vec![GossipEvent::RelayProofReceived {
                from: proof.sender,
                proof: proof.proof,
            }],
        };

        let mut ledger = self.ledger_events();
        ledger.append(&mut events);
        ledger
    }

    fn handle_digest(&mut self, remote: LogDigest, now: u64) -> Vec<GossipEvent> {
        self.stats.digests_received += 1;
        let peer = remote.origin;
        if let Some(info) = self.peers.get_peer_mut(&peer) {
            info.record_digest(remote.stream_count());
        }

        let ours = self.digest(now);
        if ours.matches(&remote) {
            if self.peer_state(&peer) != Some(PeerState::Converged) {
                debug!(peer = %peer.short(), "converged");
            }
            let _ = self.peers.set_state(&peer, PeerState::Converged, now);
            return Vec::new();
        }
        let _ = self.peers.set_state(&peer, PeerState::Syncing, now);

        let requests: Vec<RangeRequest> = ours
            .diff(&remote)
            .iter()
            .filter_map(|gap| gap.request_range())
            .take(self.config.max_requests_per_digest)
            .map(|(stream, from, to)| RangeRequest::new(self.node_id, peer, stream, from, to, now))
            .collect();

        let mut events = Vec::with_capacity(requests.len());
        for request in requests {
            debug!(
                peer = %peer.short(),
                stream = %request.stream.short(),
                from = request.from_seq,
                to = request.to_seq,
                "requesting range"
            );
            self.stats.ranges_requested += 1;
            if let Some(info) = self.peers.get_peer_mut(&peer) {
                info.record_request();
            }
            events.push(self.send(Message::RangeRequest(request)));
        }
        events
    }

    fn handle_range_request(&mut self, request: RangeRequest, now: u64) -> Vec<GossipEvent> {
        if request.target != self.node_id || request.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        let mut from = request.from_seq;
        let max_batches = self.config.max_batches_per_request.max(1);
        for round in 1..=max_batches {
            let (transactions, has_more) =
                self.reconciler.serve_range(&request.stream, from, request.to_seq);
            let Some(last) = transactions.last() else { break };
            from = last.sender_seq() + 1;
            let mut batch = TransactionBatch::new(self.node_id, transactions, now);
            if has_more && round == max_batches {
                batch = batch.with_remaining(SeqRange {
                    stream: request.stream,
                    from_seq: from,
                    to_seq: request.to_seq,
                });
            }
            events.push(self.send(Message::TransactionBatch(batch)));
            if !has_more {
                break;
            }
        }
        if !events.is_empty() {
            self.stats.ranges_served += 1;
        }
        events
    }

    fn handle_announcement(
        &mut self,
        announcement: TxAnnouncement,
        verified: Option<VerifiedTransaction>,
        now: u64,
    ) -> Vec<GossipEvent> {
        let Some(tx) = verified else {
            self.stats.invalid_transactions += 1;
            return Vec::new();
        };
        if !self.ingest(tx, now) {
            return Vec::new();
        }
        match announcement.forwarded(self.node_id, now) {
            Some(next) => {
                self.stats.announcements_forwarded += 1;
                vec![self.send(Message::TxAnnouncement(next))]
            }
            None => Vec::new(),
        }
    }

    /// Merge one transaction; true if it was new to the log
    fn ingest(&mut self, tx: VerifiedTransaction, now: u64) -> bool {
        let id = tx.id();
        match self.reconciler.ingest(tx, now) {
            Ok(outcome) => outcome.is_new(),
            Err(e) => {
                warn!(tx = %id.short(), error = %e, "failed to merge transaction");
                false
            }
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// One gossip cycle: expire stale state and broadcast our digest
    pub fn tick(&mut self, now: u64) -> Vec<GossipEvent> {
        if let Err(e) = self.reconciler.expire_pending(now) {
            warn!(error = %e, "pending expiry failed");
        }
        for peer in self.peers.expire_stalled(self.config.sync_timeout_ms, now) {
            debug!(peer = %peer.short(), "sync stalled, peer reset to unknown");
        }
        let removed = self.peers.remove_stale_peers(self.config.peer_timeout_ms, now);
        if removed > 0 {
            debug!(removed, "forgot silent peers");
        }

        let mut events = self.ledger_events();
        let digest = self.digest(now);
        events.push(self.send(Message::Digest(digest)));
        events
    }

    pub fn peer_state(&self, peer: &NodeId) -> Option<PeerState> {
        self.peers.get_peer(peer).map(PeerInfo::state)
    }

    fn ledger_events(&mut self) -> Vec<GossipEvent> {
        self.reconciler
            .take_events()
            .into_iter()
            .map(GossipEvent::Ledger)
            .collect()
    }

    fn send(&mut self, msg: Message) -> GossipEvent {
        self.stats.messages_sent += 1;
        GossipEvent::Send(msg)
    }
}
