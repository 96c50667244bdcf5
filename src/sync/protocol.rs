// Protocol - Message types for gossip over the mesh
//
// Defines the wire format for everything nodes exchange:
// - Digest: per-stream summary broadcast every gossip cycle
// - RangeRequest/TransactionBatch: pull-based repair of missing ranges
// - TxAnnouncement: push-based spreading of fresh transactions
// - RelayProof: coverage evidence forwarded to the reward issuer
//
// Every message is prefixed with a one-byte protocol version and carries
// its send time, so repeated gossip of the same content is a new payload
// to the mesh duplicate filter.

use crate::coverage::RelayProof;
use crate::identity::NodeId;
use crate::ledger::Transaction;
use crate::sync::LogDigest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 1;

/// Types of messages in the protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Digest,
    RangeRequest,
    TransactionBatch,
    TxAnnouncement,
    RelayProof,
}

/// Protocol errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty payload")]
    Empty,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed")]
    DeserializationFailed,

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Wrapper for all message types
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Digest(LogDigest),
    RangeRequest(RangeRequest),
    TransactionBatch(TransactionBatch),
    TxAnnouncement(TxAnnouncement),
    RelayProof(RelayProofAnnouncement),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Digest(_) => MessageType::Digest,
            Message::RangeRequest(_) => MessageType::RangeRequest,
            Message::TransactionBatch(_) => MessageType::TransactionBatch,
            Message::TxAnnouncement(_) => MessageType::TxAnnouncement,
            Message::RelayProof(_) => MessageType::RelayProof,
        }
    }

    /// The node that put this message on air
    pub fn sender(&self) -> NodeId {
        match self {
            Message::Digest(d) => d.origin,
            Message::RangeRequest(r) => r.requester,
            Message::TransactionBatch(b) => b.sender,
            Message::TxAnnouncement(a) => a.relayed_by,
            Message::RelayProof(p) => p.sender,
        }
    }

    /// Serialize to a versioned payload
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = vec![PROTOCOL_VERSION];
        let body = postcard::to_allocvec(self)
            .map_err(|e| ProtocolError::SerializationFailed(e.to_string()))?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Deserialize a versioned payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (version, body) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        if *version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(*version));
        }
        postcard::from_bytes(body).map_err(|_| ProtocolError::DeserializationFailed)
    }
}

// ============================================================================
// RANGE REQUEST
// ============================================================================

/// Ask `target` for the decided transactions of `stream` in `from_seq..=to_seq`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub requester: NodeId,
    pub target: NodeId,
    pub stream: NodeId,
    pub from_seq: u64,
    pub to_seq: u64,
    pub timestamp: u64,
}

impl RangeRequest {
    pub fn new(
        requester: NodeId,
        target: NodeId,
        stream: NodeId,
        from_seq: u64,
        to_seq: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            requester,
            target,
            stream,
            from_seq,
            to_seq,
            timestamp,
        }
    }

    /// Number of slots requested
    pub fn len(&self) -> u64 {
        (self.to_seq + 1).saturating_sub(self.from_seq)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TRANSACTION BATCH
// ============================================================================

/// Part of a stream the responder did not send in this round
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub stream: NodeId,
    pub from_seq: u64,
    pub to_seq: u64,
}

/// Transactions sent in answer to a range request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub sender: NodeId,
    pub transactions: Vec<Transaction>,
    /// Set on the last batch of a capped response; the requester asks again
    pub remaining: Option<SeqRange>,
    pub timestamp: u64,
}

impl TransactionBatch {
    pub fn new(sender: NodeId, transactions: Vec<Transaction>, timestamp: u64) -> Self {
        Self {
            sender,
            transactions,
            remaining: None,
            timestamp,
        }
    }

    pub fn with_remaining(mut self, remaining: SeqRange) -> Self {
        self.remaining = Some(remaining);
        self
    }
}

// ============================================================================
// TX ANNOUNCEMENT
// ============================================================================

/// Announcement of a new transaction to the mesh
///
/// Used for rumor spreading: nodes that learn a new transaction from an
/// announcement forward it until `max_hops` is reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAnnouncement {
    pub tx: Transaction,
    pub relayed_by: NodeId,
    pub hop_count: u8,
    pub max_hops: u8,
    pub timestamp: u64,
}

impl TxAnnouncement {
    pub fn new(tx: Transaction, relayed_by: NodeId, max_hops: u8, timestamp: u64) -> Self {
        Self {
            tx,
            relayed_by,
            hop_count: 0,
            max_hops,
            timestamp,
        }
    }

    /// The announcement to send onward, or None once the hop budget is spent
    pub fn forwarded(&self, by: NodeId, timestamp: u64) -> Option<Self> {
        let hop_count = self.hop_count.saturating_add(1);
        if hop_count >= self.max_hops {
            return None;
        }
        Some(Self {
            tx: self.tx.clone(),
            relayed_by: by,
            hop_count,
            max_hops: self.max_hops,
            timestamp,
        })
    }
}

// ============================================================================
// RELAY PROOF
// ============================================================================

/// A relay proof on its way to whichever node may issue the reward
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProofAnnouncement {
    pub sender: NodeId,
    pub proof: RelayProof,
    pub timestamp: u64,
}
