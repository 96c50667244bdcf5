// Transaction Log Tests
// Slot decisions, status transitions and the query surface of the log

use geohop::identity::{Keypair, NodeId};
use geohop::ledger::{
    Amount, LedgerPolicy, LogError, RejectReason, TransactionBuilder, TransactionLog,
    TransactionValidator, TxId, TxStatus, VerifiedTransaction,
};

fn node(kp: &Keypair) -> NodeId {
    NodeId::from_public_key(&kp.public_key())
}

fn pay(from: &Keypair, to: NodeId, hop: u64, seq: u64, lamport: u64) -> VerifiedTransaction {
    let tx = TransactionBuilder::transfer(from, to, Amount::from_hop(hop))
        .sequence(seq)
        .lamport(lamport)
        .build()
        .unwrap();
    TransactionValidator::verify(&tx, &LedgerPolicy::new()).unwrap()
}

fn append(log: &mut TransactionLog, tx: VerifiedTransaction) -> TxId {
    let id = tx.id();
    log.append(tx, 0).unwrap();
    id
}

// ============================================================================
// APPEND AND DECIDE
// ============================================================================

#[test]
fn test_duplicate_append_refused() {
    let alice = Keypair::generate();
    let bob = node(&Keypair::generate());
    let mut log = TransactionLog::new();

    let id = append(&mut log, pay(&alice, bob, 1, 1, 1));
    assert_eq!(
        log.append(pay(&alice, bob, 1, 1, 1), 5).unwrap_err(),
        LogError::DuplicateTxId(id)
    );
    assert_eq!(log.len(), 1);
    assert_eq!(log.status(&id), Some(TxStatus::Pending));
}

#[test]
fn test_non_deciding_rejection_leaves_slot_open() {
    let alice = Keypair::generate();
    let bob = node(&Keypair::generate());
    let mut log = TransactionLog::new();
    let first = append(&mut log, pay(&alice, bob, 1, 1, 1));
    let second = append(&mut log, pay(&alice, bob, 2, 1, 1));

    let mut candidates = vec![first, second];
    candidates.sort();
    assert_eq!(log.slot_candidates(&node(&alice), 1), candidates);

    log.mark_rejected(&first, RejectReason::Conflict { winner: second }, false)
        .unwrap();
    assert_eq!(log.tip(&node(&alice)), 0);
    assert_eq!(log.decider(&node(&alice), 1), None);

    log.mark_committed(&second).unwrap();
    assert_eq!(log.decider(&node(&alice), 1), Some(second));
    assert_eq!(log.commit_order(), &[second]);
}

#[test]
fn test_deciding_rejection_advances_tip() {
    let alice = Keypair::generate();
    let bob = node(&Keypair::generate());
    let mut log = TransactionLog::new();
    let id = append(&mut log, pay(&alice, bob, 1, 1, 1));

    log.mark_rejected(&id, RejectReason::DependencyRejected { dep: id }, true)
        .unwrap();
    assert_eq!(log.tip(&node(&alice)), 1);
    assert!(log.commit_order().is_empty());
    assert!(log.range(&node(&alice), 1).iter().any(|tx| tx.id() == id));
}

#[test]
fn test_invalid_transitions() {
    let alice = Keypair::generate();
    let mut log = TransactionLog::new();
    let id = append(&mut log, pay(&alice, node(&Keypair::generate()), 1, 1, 1));
    log.mark_committed(&id).unwrap();

    assert_eq!(
        log.mark_committed(&id).unwrap_err(),
        LogError::InvalidTransition {
            id,
            from: TxStatus::Committed,
            to: TxStatus::Committed,
        }
    );
    assert!(matches!(
        log.mark_status(&id, TxStatus::Pending, None),
        Err(LogError::InvalidTransition { .. })
    ));

    let unknown = pay(&alice, node(&Keypair::generate()), 9, 9, 9).id();
    assert_eq!(log.mark_committed(&unknown).unwrap_err(), LogError::UnknownTx(unknown));
}

// ============================================================================
// QUERIES
// ============================================================================

#[test]
fn test_tip_and_highest_seq_with_gap() {
    let alice = Keypair::generate();
    let bob = node(&Keypair::generate());
    let stream = node(&alice);
    let mut log = TransactionLog::new();

    let one = append(&mut log, pay(&alice, bob, 1, 1, 1));
    append(&mut log, pay(&alice, bob, 1, 3, 3));
    log.mark_committed(&one).unwrap();

    assert_eq!(log.tip(&stream), 1);
    assert_eq!(log.highest_seq(&stream), 3);
    assert_eq!(log.pending_count(), 1);
    assert!(log.pending_streams().contains(&stream));
    assert!(log.streams().contains(&stream));
}

#[test]
fn test_range_between_returns_decided_in_order() {
    let alice = Keypair::generate();
    let bob = node(&Keypair::generate());
    let stream = node(&alice);
    let mut log = TransactionLog::new();

    let ids: Vec<TxId> = (1..=4)
        .map(|seq| append(&mut log, pay(&alice, bob, 1, seq, seq)))
        .collect();
    for id in &ids {
        log.mark_committed(id).unwrap();
    }

    let middle: Vec<TxId> = log.range_between(&stream, 2, 3).iter().map(|tx| tx.id()).collect();
    assert_eq!(middle, ids[1..3].to_vec());
    assert!(log.range_between(&stream, 3, 2).is_empty());
    assert_eq!(log.decided_ids(&stream).count(), 4);
}

#[test]
fn test_history_uses_lamport_order() {
    let alice = Keypair::generate();
    let carol = Keypair::generate();
    let bob = node(&Keypair::generate());
    let mut log = TransactionLog::new();

    let late = append(&mut log, pay(&alice, bob, 1, 1, 20));
    let early = append(&mut log, pay(&carol, bob, 1, 1, 5));
    log.mark_committed(&late).unwrap();
    log.mark_committed(&early).unwrap();

    let history: Vec<TxId> = log.history(&bob).iter().map(|tx| tx.id()).collect();
    assert_eq!(history, vec![early, late]);
    assert_eq!(log.max_lamport(), 20);
}

#[test]
fn test_latest_credits_per_stream() {
    let alice = Keypair::generate();
    let carol = Keypair::generate();
    let bob = node(&Keypair::generate());
    let mut log = TransactionLog::new();

    let a1 = append(&mut log, pay(&alice, bob, 1, 1, 1));
    let a2 = append(&mut log, pay(&alice, bob, 1, 2, 2));
    let c1 = append(&mut log, pay(&carol, bob, 1, 1, 3));
    for id in [a1, a2, c1] {
        log.mark_committed(&id).unwrap();
    }

    let credits = log.latest_credits(&bob);
    assert_eq!(credits.len(), 2);
    assert!(credits.contains(&a2));
    assert!(credits.contains(&c1));
    assert!(log.latest_credits(&node(&alice)).is_empty());
}

#[test]
fn test_registration_lookup() {
    let alice = Keypair::generate();
    let tx = TransactionBuilder::register(&alice, "ALICE")
        .sequence(1)
        .build()
        .unwrap();
    let mut log = TransactionLog::new();
    let id = append(&mut log, TransactionValidator::verify(&tx, &LedgerPolicy::new()).unwrap());

    assert_eq!(log.registration(&node(&alice)), None);
    log.mark_committed(&id).unwrap();
    assert_eq!(log.registration(&node(&alice)), Some(id));
}

// ============================================================================
// EXPIRY AND REPLAY
// ============================================================================

#[test]
fn test_remove_pending_forgets_candidate() {
    let alice = Keypair::generate();
    let mut log = TransactionLog::new();
    let id = append(&mut log, pay(&alice, node(&Keypair::generate()), 1, 2, 2));

    let tx = log.remove_pending(&id).unwrap();
    assert_eq!(tx.id(), id);
    assert!(!log.contains(&id));
    assert!(log.slot_candidates(&node(&alice), 2).is_empty());
    assert_eq!(log.highest_seq(&node(&alice)), 0);
}

#[test]
fn test_reopen_for_replay_keeps_conflict_losses() {
    let alice = Keypair::generate();
    let bob = node(&Keypair::generate());
    let mut log = TransactionLog::new();
    let mut siblings = [
        append(&mut log, pay(&alice, bob, 1, 1, 1)),
        append(&mut log, pay(&alice, bob, 2, 1, 1)),
    ];
    siblings.sort();
    let [small, large] = siblings;
    let next = append(&mut log, pay(&alice, bob, 3, 2, 2));

    log.mark_committed(&large).unwrap();
    log.mark_committed(&next).unwrap();

    let previous = log.reopen_for_replay(Some((large, small)));
    assert_eq!(previous, vec![large, next]);
    assert_eq!(log.status(&large), Some(TxStatus::Rejected));
    assert!(log
        .get(&large)
        .and_then(|e| e.reject_reason())
        .is_some_and(RejectReason::is_conflict));
    assert_eq!(log.status(&small), Some(TxStatus::Pending));
    assert_eq!(log.status(&next), Some(TxStatus::Pending));
    assert_eq!(log.tip(&node(&alice)), 0);
    assert!(log.commit_order().is_empty());
}
