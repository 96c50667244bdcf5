// Storage module - PERSISTENCE
// Durable account and transaction records behind the LedgerStorage trait,
// with an in-memory backend and a sled backend

mod memory;
mod sled_store;
mod store;

pub use memory::MemoryStore;
pub use sled_store::{SledStore, StorageStats};
pub use store::{decode_record, encode_record, LedgerStorage, StoreError, StoredTransaction};
