use crate::coverage::{CoverageWindow, WitnessAttestation};
use crate::identity::{NodeId, PublicKey, Signature, Signer};
use crate::ledger::Amount;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Longest display name a Register transaction may carry (bytes)
pub const MAX_MEMO_LEN: usize = 32;

const SIGNING_DOMAIN: &[u8] = b"geohop-tx-v1";

/// Errors from building or decoding transactions
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Self-transfer not allowed: sender and recipient are the same")]
    SelfTransfer,

    #[error("Display name must be 1..={MAX_MEMO_LEN} bytes")]
    InvalidDisplayName,

    #[error("Sequence numbers start at 1")]
    InvalidSequence,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Content address of a transaction (SHA-256 of its signed fields)
///
/// Ordering is byte-lexicographic; the conflict rule relies on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

impl TxId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.short())
    }
}

/// What a transaction does to the account store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Mints the initial supply to the recipient
    Genesis,
    /// Creates the sender's account with a callsign
    Register { display_name: String },
    Transfer,
    /// Credits a relayer for a validated relay proof
    RelayReward,
    /// Credits or debits `amount` on the recipient, floored at zero
    AdminAdjust { credit: bool },
    AdminRemove,
    AdminBan { banned: bool },
}

impl TxKind {
    fn tag(&self) -> u8 {
        match self {
            TxKind::Genesis => 0,
            TxKind::Register { .. } => 1,
            TxKind::Transfer => 2,
            TxKind::RelayReward => 3,
            TxKind::AdminAdjust { .. } => 4,
            TxKind::AdminRemove => 5,
            TxKind::AdminBan { .. } => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxKind::Genesis => "genesis",
            TxKind::Register { .. } => "register",
            TxKind::Transfer => "transfer",
            TxKind::RelayReward => "relay_reward",
            TxKind::AdminAdjust { .. } => "admin_adjust",
            TxKind::AdminRemove => "admin_remove",
            TxKind::AdminBan { .. } => "admin_ban",
        }
    }

    /// Kinds that only a policy authority may sign
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            TxKind::Genesis
                | TxKind::AdminAdjust { .. }
                | TxKind::AdminRemove
                | TxKind::AdminBan { .. }
        )
    }

    /// Admin kinds, which take a slot on the target's stream
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            TxKind::AdminAdjust { .. } | TxKind::AdminRemove | TxKind::AdminBan { .. }
        )
    }

    /// Kinds that add to the issued supply
    pub fn is_issuance(&self) -> bool {
        matches!(self, TxKind::Genesis | TxKind::RelayReward)
    }
}

/// Lifecycle state of a transaction in the local log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Committed,
    Rejected,
}

/// Relay-credit evidence attached to a RelayReward
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardClaim {
    pub packet_hash: [u8; 32],
    pub window: CoverageWindow,
    pub epoch: u64,
    pub attestations: Vec<WitnessAttestation>,
}

/// The immutable, signed part of a transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBody {
    pub(crate) kind: TxKind,
    pub(crate) signer: PublicKey,
    pub(crate) sender: Option<NodeId>,
    pub(crate) recipient: NodeId,
    pub(crate) amount: Amount,
    pub(crate) sender_seq: u64,
    pub(crate) lamport: u64,
    pub(crate) causal_deps: BTreeSet<TxId>,
    pub(crate) reward: Option<RewardClaim>,
}

impl TxBody {
    /// Canonical bytes covered by the signature and the txId
    pub fn to_signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(SIGNING_DOMAIN);

        bytes.push(self.kind.tag());
        match &self.kind {
            TxKind::Register { display_name } => {
                bytes.extend_from_slice(&(display_name.len() as u32).to_le_bytes());
                bytes.extend_from_slice(display_name.as_bytes());
            }
            TxKind::AdminAdjust { credit } => bytes.push(*credit as u8),
            TxKind::AdminBan { banned } => bytes.push(*banned as u8),
            _ => {}
        }

        bytes.extend_from_slice(self.signer.as_bytes());
        match &self.sender {
            Some(sender) => {
                bytes.push(1);
                bytes.extend_from_slice(sender.as_bytes());
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(self.recipient.as_bytes());
        bytes.extend_from_slice(&self.amount.micro().to_le_bytes());
        bytes.extend_from_slice(&self.sender_seq.to_le_bytes());
        bytes.extend_from_slice(&self.lamport.to_le_bytes());

        bytes.extend_from_slice(&(self.causal_deps.len() as u32).to_le_bytes());
        for dep in &self.causal_deps {
            bytes.extend_from_slice(dep.as_bytes());
        }

        match &self.reward {
            Some(claim) => {
                bytes.push(1);
                bytes.extend_from_slice(&claim.packet_hash);
                bytes.extend_from_slice(&claim.window.start_ms.to_le_bytes());
                bytes.extend_from_slice(&claim.window.end_ms.to_le_bytes());
                bytes.extend_from_slice(&claim.epoch.to_le_bytes());
                bytes.extend_from_slice(&(claim.attestations.len() as u32).to_le_bytes());
                for attestation in &claim.attestations {
                    attestation.write_canonical(&mut bytes);
                }
            }
            None => bytes.push(0),
        }

        bytes
    }

    pub fn id(&self) -> TxId {
        TxId(Sha256::digest(self.to_signing_bytes()).into())
    }
}

/// A signed ledger transaction
///
/// Everything except the local status is immutable once signed. The id is a
/// content hash, so re-delivery of the same transaction is recognisable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    body: TxBody,
    signature: Signature,
}

impl Transaction {
    pub(crate) fn from_parts(body: TxBody, signature: Signature) -> Self {
        Self { body, signature }
    }

    pub fn body(&self) -> &TxBody {
        &self.body
    }

    pub fn id(&self) -> TxId {
        self.body.id()
    }

    pub fn kind(&self) -> &TxKind {
        &self.body.kind
    }

    pub fn signer(&self) -> &PublicKey {
        &self.body.signer
    }

    /// The sequence stream this transaction belongs to
    ///
    /// The signer's own stream, except for admin kinds, which are ordered
    /// on the target's stream against the target's own debits.
    pub fn stream(&self) -> NodeId {
        if self.body.kind.is_admin() {
            self.body.recipient
        } else {
            NodeId::from_public_key(&self.body.signer)
        }
    }

    pub fn sender(&self) -> Option<NodeId> {
        self.body.sender
    }

    pub fn recipient(&self) -> NodeId {
        self.body.recipient
    }

    pub fn amount(&self) -> Amount {
        self.body.amount
    }

    pub fn sender_seq(&self) -> u64 {
        self.body.sender_seq
    }

    pub fn lamport(&self) -> u64 {
        self.body.lamport
    }

    pub fn causal_deps(&self) -> &BTreeSet<TxId> {
        &self.body.causal_deps
    }

    pub fn reward(&self) -> Option<&RewardClaim> {
        self.body.reward.as_ref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// True if this transaction names `node` as sender or recipient
    pub fn involves(&self, node: &NodeId) -> bool {
        self.body.sender.as_ref() == Some(node) || &self.body.recipient == node
    }

    pub fn verify_signature(&self) -> bool {
        Signer::verify(&self.body.signer, &self.body.to_signing_bytes(), &self.signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        postcard::to_allocvec(self).map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        postcard::from_bytes(bytes).map_err(|e| TransactionError::Deserialization(e.to_string()))
    }

    /// URL-safe base64 export, suitable for QR payloads
    pub fn to_base64(&self) -> Result<String, TransactionError> {
        Ok(URL_SAFE_NO_PAD.encode(self.to_bytes()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, TransactionError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| TransactionError::Deserialization(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> Result<String, TransactionError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, TransactionError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| TransactionError::Deserialization(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}
