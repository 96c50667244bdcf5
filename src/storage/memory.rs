use crate::identity::NodeId;
use crate::ledger::{Account, TxId};
use crate::storage::{LedgerStorage, StoreError, StoredTransaction};
use std::collections::{BTreeMap, BTreeSet};

/// Volatile storage for tests and simulations
#[derive(Debug, Default)]
pub struct MemoryStore {
    transactions: BTreeMap<TxId, StoredTransaction>,
    index: BTreeSet<(NodeId, u64, TxId)>,
    accounts: BTreeMap<NodeId, Account>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

impl LedgerStorage for MemoryStore {
    fn put_transaction(&mut self, record: &StoredTransaction) -> Result<(), StoreError> {
        let id = record.id();
        self.index.insert((record.tx.stream(), record.tx.sender_seq(), id));
        self.transactions.insert(id, record.clone());
        Ok(())
    }

    fn remove_transaction(&mut self, id: &TxId) -> Result<(), StoreError> {
        if let Some(record) = self.transactions.remove(id) {
            self.index.remove(&(record.tx.stream(), record.tx.sender_seq(), *id));
        }
        Ok(())
    }

    fn load_transactions(&self) -> Result<Vec<StoredTransaction>, StoreError> {
        Ok(self.transactions.values().cloned().collect())
    }

    fn stream_index(&self, stream: &NodeId, from_seq: u64) -> Result<Vec<TxId>, StoreError> {
        let start = (*stream, from_seq, TxId::from_bytes([0; 32]));
        let end = (*stream, u64::MAX, TxId::from_bytes([0xff; 32]));
        Ok(self.index.range(start..=end).map(|(_, _, id)| *id).collect())
    }

    fn put_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.accounts.insert(*account.node_id(), account.clone());
        Ok(())
    }

    fn remove_account(&mut self, node_id: &NodeId) -> Result<(), StoreError> {
        self.accounts.remove(node_id);
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.accounts.values().cloned().collect())
    }

    fn replace_accounts(&mut self, accounts: &[Account]) -> Result<(), StoreError> {
        self.accounts = accounts.iter().map(|a| (*a.node_id(), a.clone())).collect();
        Ok(())
    }
}
