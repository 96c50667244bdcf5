// SledStore - crash-safe ledger storage on sled
//
// Trees:
// - accounts:     node id -> Account
// - transactions: txId -> StoredTransaction
// - stream_index: stream || seq (BE) || txId -> ()
// - meta:         node keypair and other singletons

use crate::identity::{Keypair, NodeId};
use crate::ledger::{Account, TxId};
use crate::storage::{decode_record, encode_record, LedgerStorage, StoreError, StoredTransaction};
use std::path::Path;

const ACCOUNTS_TREE: &str = "accounts";
const TRANSACTIONS_TREE: &str = "transactions";
const STREAM_INDEX_TREE: &str = "stream_index";
const META_TREE: &str = "meta";

mod keys {
    pub const NODE_KEYPAIR: &[u8] = b"identity:keypair";
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    pub account_count: usize,
    pub transaction_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// Persistent ledger store
///
/// Every value carries a checksum; a mismatch on load surfaces as
/// [`StoreError::Corrupted`].
#[derive(Clone, Debug)]
pub struct SledStore {
    db: sled::Db,
    accounts: sled::Tree,
    transactions: sled::Tree,
    stream_index: sled::Tree,
    meta: sled::Tree,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        let accounts = db.open_tree(ACCOUNTS_TREE)?;
        let transactions = db.open_tree(TRANSACTIONS_TREE)?;
        let stream_index = db.open_tree(STREAM_INDEX_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self {
            db,
            accounts,
            transactions,
            stream_index,
            meta,
        })
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            account_count: self.accounts.len(),
            transaction_count: self.transactions.len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    pub fn save_keypair(&self, keypair: &Keypair) -> Result<(), StoreError> {
        self.meta.insert(keys::NODE_KEYPAIR, encode_record(&keypair.to_bytes())?)?;
        Ok(())
    }

    pub fn load_keypair(&self) -> Result<Option<Keypair>, StoreError> {
        let Some(bytes) = self.meta.get(keys::NODE_KEYPAIR)? else {
            return Ok(None);
        };
        let secret: Vec<u8> = decode_record(META_TREE, keys::NODE_KEYPAIR, &bytes)?;
        let keypair = Keypair::from_bytes(&secret).map_err(|_| StoreError::Corrupted {
            tree: META_TREE,
            key: hex::encode(keys::NODE_KEYPAIR),
        })?;
        Ok(Some(keypair))
    }

    // ========================================================================
    // RAW ACCESS
    // ========================================================================

    /// Overwrite a raw value; repair and diagnostics tooling only
    pub fn put_raw(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.open_tree(tree)?.insert(key, value)?;
        Ok(())
    }

    fn index_key(stream: &NodeId, seq: u64, id: &TxId) -> Vec<u8> {
        let mut key = Vec::with_capacity(72);
        key.extend_from_slice(stream.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key.extend_from_slice(id.as_bytes());
        key
    }
}

impl LedgerStorage for SledStore {
    fn put_transaction(&mut self, record: &StoredTransaction) -> Result<(), StoreError> {
        let id = record.id();
        let index_key = Self::index_key(&record.tx.stream(), record.tx.sender_seq(), &id);
        self.transactions.insert(id.as_bytes(), encode_record(record)?)?;
        self.stream_index.insert(index_key, &b""[..])?;
        Ok(())
    }

    fn remove_transaction(&mut self, id: &TxId) -> Result<(), StoreError> {
        if let Some(bytes) = self.transactions.remove(id.as_bytes())? {
            let record: StoredTransaction =
                decode_record(TRANSACTIONS_TREE, id.as_bytes(), &bytes)?;
            self.stream_index
                .remove(Self::index_key(&record.tx.stream(), record.tx.sender_seq(), id))?;
        }
        Ok(())
    }

    fn load_transactions(&self) -> Result<Vec<StoredTransaction>, StoreError> {
        let mut records = Vec::with_capacity(self.transactions.len());
        for item in self.transactions.iter() {
            let (key, value) = item?;
            records.push(decode_record(TRANSACTIONS_TREE, &key, &value)?);
        }
        Ok(records)
    }

    fn stream_index(&self, stream: &NodeId, from_seq: u64) -> Result<Vec<TxId>, StoreError> {
        let mut start = stream.as_bytes().to_vec();
        start.extend_from_slice(&from_seq.to_be_bytes());

        let mut ids = Vec::new();
        for item in self.stream_index.range(start..) {
            let (key, _) = item?;
            if !key.starts_with(stream.as_bytes()) {
                break;
            }
            let id: [u8; 32] = key[40..].try_into().map_err(|_| StoreError::Corrupted {
                tree: STREAM_INDEX_TREE,
                key: hex::encode(&key),
            })?;
            ids.push(TxId::from_bytes(id));
        }
        Ok(ids)
    }

    fn put_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.accounts
            .insert(account.node_id().as_bytes(), encode_record(account)?)?;
        Ok(())
    }

    fn remove_account(&mut self, node_id: &NodeId) -> Result<(), StoreError> {
        self.accounts.remove(node_id.as_bytes())?;
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut accounts = Vec::with_capacity(self.accounts.len());
        for item in self.accounts.iter() {
            let (key, value) = item?;
            accounts.push(decode_record(ACCOUNTS_TREE, &key, &value)?);
        }
        Ok(accounts)
    }

    fn replace_accounts(&mut self, accounts: &[Account]) -> Result<(), StoreError> {
        self.accounts.clear()?;
        for account in accounts {
            self.put_account(account)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }
}
