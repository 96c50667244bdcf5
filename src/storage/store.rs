// Storage contract and the checksummed record codec shared by backends

use crate::identity::NodeId;
use crate::ledger::{Account, RejectReason, Transaction, TxId, TxStatus};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const CHECKSUM_LEN: usize = 4;

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Checksum mismatch or undecodable record; fatal at startup
    #[error("Corrupted record in {tree} at key {key}")]
    Corrupted { tree: &'static str, key: String },

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// A transaction record as persisted, with its local status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx: Transaction,
    pub status: TxStatus,
    pub reject_reason: Option<RejectReason>,
    /// Position in the local commit order, for committed records
    pub commit_index: Option<u64>,
    pub received_at: u64,
}

impl StoredTransaction {
    pub fn id(&self) -> TxId {
        self.tx.id()
    }
}

/// Durable collaborator for the account store and transaction log
///
/// Account records are keyed by node id, transaction records by txId, with
/// a secondary (stream, seq) index.
pub trait LedgerStorage: Send {
    fn put_transaction(&mut self, record: &StoredTransaction) -> Result<(), StoreError>;

    fn remove_transaction(&mut self, id: &TxId) -> Result<(), StoreError>;

    fn load_transactions(&self) -> Result<Vec<StoredTransaction>, StoreError>;

    /// Ids stored for `stream` with seq >= `from_seq`, in seq order
    fn stream_index(&self, stream: &NodeId, from_seq: u64) -> Result<Vec<TxId>, StoreError>;

    fn put_account(&mut self, account: &Account) -> Result<(), StoreError>;

    fn remove_account(&mut self, node_id: &NodeId) -> Result<(), StoreError>;

    fn load_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Replace every account record in one pass
    fn replace_accounts(&mut self, accounts: &[Account]) -> Result<(), StoreError> {
        for existing in self.load_accounts()? {
            self.remove_account(existing.node_id())?;
        }
        for account in accounts {
            self.put_account(account)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Encode `value` as `sha256(payload)[..4] || postcard(payload)`
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let payload =
        postcard::to_allocvec(value).map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
    let checksum = Sha256::digest(&payload);
    let mut bytes = Vec::with_capacity(CHECKSUM_LEN + payload.len());
    bytes.extend_from_slice(&checksum[..CHECKSUM_LEN]);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a record written by [`encode_record`], verifying its checksum
pub fn decode_record<T: DeserializeOwned>(
    tree: &'static str,
    key: &[u8],
    bytes: &[u8],
) -> Result<T, StoreError> {
    let corrupted = || StoreError::Corrupted {
        tree,
        key: hex::encode(key),
    };
    if bytes.len() < CHECKSUM_LEN {
        return Err(corrupted());
    }
    let (checksum, payload) = bytes.split_at(CHECKSUM_LEN);
    if Sha256::digest(payload)[..CHECKSUM_LEN] != *checksum {
        return Err(corrupted());
    }
    postcard::from_bytes(payload).map_err(|_| corrupted())
}
