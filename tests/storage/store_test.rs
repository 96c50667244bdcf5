// Store Tests
// Tests for the ledger storage backends and the checksummed record codec

use geohop::identity::{Keypair, NodeId};
use geohop::ledger::{Account, AccountStore, Amount, Transaction, TransactionBuilder, TxStatus};
use geohop::storage::{
    decode_record, encode_record, LedgerStorage, MemoryStore, SledStore, StoreError,
    StoredTransaction,
};
use tempfile::TempDir;

// ============================================================================
// HELPERS
// ============================================================================

fn node(kp: &Keypair) -> NodeId {
    NodeId::from_public_key(&kp.public_key())
}

fn record(from: &Keypair, seq: u64, status: TxStatus) -> StoredTransaction {
    let tx = TransactionBuilder::transfer(from, node(&Keypair::generate()), Amount::from_hop(1))
        .sequence(seq)
        .lamport(seq)
        .build()
        .unwrap();
    StoredTransaction {
        tx,
        status,
        reject_reason: None,
        commit_index: (status == TxStatus::Committed).then_some(seq - 1),
        received_at: 1_000 + seq,
    }
}

fn funded_accounts(n: usize) -> Vec<Account> {
    let authority = Keypair::generate();
    let mut store = AccountStore::new();
    for seq in 1..=n as u64 {
        let to = node(&Keypair::generate());
        let tx: Transaction = TransactionBuilder::genesis(&authority, to, Amount::from_hop(seq))
            .sequence(seq)
            .build()
            .unwrap();
        store.apply_transaction(&tx).unwrap();
    }
    store.accounts().cloned().collect()
}

/// Shared contract checks run against every backend
fn exercise_backend(store: &mut dyn LedgerStorage) {
    let alice = Keypair::generate();
    let records: Vec<StoredTransaction> = (1..=3)
        .map(|seq| record(&alice, seq, TxStatus::Committed))
        .collect();
    for r in &records {
        store.put_transaction(r).unwrap();
    }
    store.put_transaction(&record(&Keypair::generate(), 1, TxStatus::Pending)).unwrap();

    let mut loaded = store.load_transactions().unwrap();
    assert_eq!(loaded.len(), 4);
    loaded.retain(|r| r.tx.stream() == node(&alice));
    loaded.sort_by_key(|r| r.tx.sender_seq());
    assert_eq!(loaded, records);

    let ids = store.stream_index(&node(&alice), 2).unwrap();
    assert_eq!(ids, vec![records[1].id(), records[2].id()]);

    store.remove_transaction(&records[2].id()).unwrap();
    assert_eq!(store.stream_index(&node(&alice), 1).unwrap().len(), 2);
    // Removing an absent record is a no-op
    store.remove_transaction(&records[2].id()).unwrap();

    let accounts = funded_accounts(3);
    for account in &accounts {
        store.put_account(account).unwrap();
    }
    assert_eq!(store.load_accounts().unwrap().len(), 3);

    store.remove_account(accounts[0].node_id()).unwrap();
    assert_eq!(store.load_accounts().unwrap().len(), 2);

    let replacement = funded_accounts(1);
    store.replace_accounts(&replacement).unwrap();
    assert_eq!(store.load_accounts().unwrap(), replacement);
    store.flush().unwrap();
}

// ============================================================================
// BACKENDS
// ============================================================================

#[test]
fn test_memory_store_contract() {
    let mut store = MemoryStore::new();
    exercise_backend(&mut store);
    assert_eq!(store.transaction_count(), 3);
}

#[test]
fn test_sled_store_contract() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = SledStore::open(temp_dir.path()).unwrap();
    exercise_backend(&mut store);

    let stats = store.stats();
    assert_eq!(stats.transaction_count, 3);
    assert_eq!(stats.account_count, 1);
}

#[test]
fn test_sled_store_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let alice = Keypair::generate();
    let keypair = Keypair::generate();
    let stored = record(&alice, 1, TxStatus::Committed);
    let accounts = funded_accounts(2);

    {
        let mut store = SledStore::open(temp_dir.path()).unwrap();
        assert!(store.load_keypair().unwrap().is_none());
        store.save_keypair(&keypair).unwrap();
        store.put_transaction(&stored).unwrap();
        store.replace_accounts(&accounts).unwrap();
        store.flush().unwrap();
    }

    let store = SledStore::open(temp_dir.path()).unwrap();
    let restored = store.load_keypair().unwrap().unwrap();
    assert_eq!(restored.public_key(), keypair.public_key());
    assert_eq!(store.load_transactions().unwrap(), vec![stored]);

    let mut loaded = store.load_accounts().unwrap();
    let mut expected = accounts;
    loaded.sort_by_key(|a| *a.node_id());
    expected.sort_by_key(|a| *a.node_id());
    assert_eq!(loaded, expected);
}

// ============================================================================
// CORRUPTION
// ============================================================================

#[test]
fn test_corrupted_record_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = SledStore::open(temp_dir.path()).unwrap();
    let stored = record(&Keypair::generate(), 1, TxStatus::Pending);
    store.put_transaction(&stored).unwrap();

    let mut bytes = encode_record(&stored).unwrap();
    if let Some(last) = bytes.last_mut() {
        *last ^= 0xff;
    }
    store.put_raw("transactions", stored.id().as_bytes(), &bytes).unwrap();

    match store.load_transactions() {
        Err(StoreError::Corrupted { tree, key }) => {
            assert_eq!(tree, "transactions");
            assert_eq!(key, hex::encode(stored.id().as_bytes()));
        }
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn test_record_codec_checks_checksum() {
    let value = (7u64, String::from("hop"));
    let bytes = encode_record(&value).unwrap();
    let decoded: (u64, String) = decode_record("meta", b"k", &bytes).unwrap();
    assert_eq!(decoded, value);

    assert!(matches!(
        decode_record::<(u64, String)>("meta", b"k", &bytes[..2]),
        Err(StoreError::Corrupted { tree: "meta", .. })
    ));

    let mut flipped = bytes.clone();
    flipped[0] ^= 0x01;
    assert!(decode_record::<(u64, String)>("meta", b"k", &flipped).is_err());
}
