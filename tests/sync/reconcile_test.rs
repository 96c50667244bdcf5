// Reconciliation Tests
// Slot decisions, conflict resolution and fork repair of the local ledger

use geohop::identity::{Keypair, NodeId};
use geohop::ledger::{
    Amount, LedgerPolicy, RejectReason, Transaction, TransactionBuilder, TransactionValidator,
    TxStatus, VerifiedTransaction,
};
use geohop::storage::{MemoryStore, SledStore};
use geohop::sync::{
    IngestOutcome, LedgerEvent, ReconcileConfig, ReconcileError, ReconciliationEngine,
};

// ============================================================================
// HELPERS
// ============================================================================

fn node(kp: &Keypair) -> NodeId {
    NodeId::from_public_key(&kp.public_key())
}

fn verify(tx: &Transaction, policy: &LedgerPolicy) -> VerifiedTransaction {
    TransactionValidator::verify(tx, policy).unwrap()
}

fn engine(policy: &LedgerPolicy) -> ReconciliationEngine {
    engine_with(policy, ReconcileConfig::new())
}

fn engine_with(policy: &LedgerPolicy, config: ReconcileConfig) -> ReconciliationEngine {
    ReconciliationEngine::new(policy.clone(), Box::new(MemoryStore::new()), config).unwrap()
}

struct Fixture {
    policy: LedgerPolicy,
    authority: Keypair,
    alice: Keypair,
    genesis: Transaction,
}

/// Alice holds 10 HOP minted by the genesis authority
fn funded() -> Fixture {
    let authority = Keypair::generate();
    let alice = Keypair::generate();
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let genesis = TransactionBuilder::genesis(&authority, node(&alice), Amount::from_hop(10))
        .sequence(1)
        .lamport(1)
        .build()
        .unwrap();
    Fixture {
        policy,
        authority,
        alice,
        genesis,
    }
}

fn transfer(from: &Keypair, to: NodeId, hop: u64, seq: u64, deps: &[&Transaction]) -> Transaction {
    TransactionBuilder::transfer(from, to, Amount::from_hop(hop))
        .sequence(seq)
        .lamport(seq + 1)
        .depends_on(deps.iter().map(|tx| tx.id()))
        .build()
        .unwrap()
}

// ============================================================================
// COMMITS
// ============================================================================

#[test]
fn test_transfer_moves_funds() {
    let f = funded();
    let bob = node(&Keypair::generate());
    let mut engine = engine(&f.policy);

    let pay = transfer(&f.alice, bob, 4, 1, &[&f.genesis]);
    assert_eq!(engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap(), IngestOutcome::Accepted);
    assert_eq!(engine.ingest(verify(&pay, &f.policy), 0).unwrap(), IngestOutcome::Accepted);

    assert_eq!(engine.log().status(&pay.id()), Some(TxStatus::Committed));
    assert_eq!(engine.accounts().balance(&node(&f.alice)), Amount::from_hop(6));
    assert_eq!(engine.accounts().balance(&bob), Amount::from_hop(4));
    assert_eq!(engine.accounts().issued_supply(), Amount::from_hop(10));
    assert!(engine.accounts().is_conserved());
}

#[test]
fn test_duplicate_ingest_is_idempotent() {
    let f = funded();
    let mut engine = engine(&f.policy);

    engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap();
    assert_eq!(
        engine.ingest(verify(&f.genesis, &f.policy), 5).unwrap(),
        IngestOutcome::Duplicate
    );

    assert_eq!(engine.log().len(), 1);
    assert_eq!(engine.accounts().balance(&node(&f.alice)), Amount::from_hop(10));
    assert_eq!(engine.stats().duplicates, 1);
    assert_eq!(engine.stats().committed, 1);
}

#[test]
fn test_dependency_waits_for_its_credit() {
    let f = funded();
    let bob = node(&Keypair::generate());
    let mut engine = engine(&f.policy);

    let pay = transfer(&f.alice, bob, 4, 1, &[&f.genesis]);
    engine.ingest(verify(&pay, &f.policy), 0).unwrap();
    assert_eq!(engine.log().status(&pay.id()), Some(TxStatus::Pending));

    engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap();
    assert_eq!(engine.log().status(&pay.id()), Some(TxStatus::Committed));
    assert_eq!(engine.accounts().balance(&bob), Amount::from_hop(4));
}

#[test]
fn test_sequence_gap_held_until_filled() {
    let f = funded();
    let bob = node(&Keypair::generate());
    let mut engine = engine(&f.policy);
    engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap();

    let first = transfer(&f.alice, bob, 4, 1, &[&f.genesis]);
    let second = transfer(&f.alice, bob, 1, 2, &[&f.genesis]);

    engine.ingest(verify(&second, &f.policy), 0).unwrap();
    assert_eq!(engine.log().status(&second.id()), Some(TxStatus::Pending));
    assert_eq!(engine.log().tip(&node(&f.alice)), 0);

    engine.ingest(verify(&first, &f.policy), 0).unwrap();
    assert_eq!(engine.log().status(&first.id()), Some(TxStatus::Committed));
    assert_eq!(engine.log().status(&second.id()), Some(TxStatus::Committed));
    assert_eq!(engine.log().tip(&node(&f.alice)), 2);
    assert_eq!(engine.accounts().balance(&node(&f.alice)), Amount::from_hop(5));
}

#[test]
fn test_rejected_decider_burns_the_slot() {
    let f = funded();
    let bob = node(&Keypair::generate());
    let mut engine = engine(&f.policy);
    engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap();

    let too_much = transfer(&f.alice, bob, 20, 1, &[&f.genesis]);
    let next = transfer(&f.alice, bob, 5, 2, &[&f.genesis]);
    engine.ingest(verify(&too_much, &f.policy), 0).unwrap();
    engine.ingest(verify(&next, &f.policy), 0).unwrap();

    assert_eq!(
        engine.log().get(&too_much.id()).and_then(|e| e.reject_reason().cloned()),
        Some(RejectReason::InsufficientFunds {
            available: Amount::from_hop(10),
            required: Amount::from_hop(20),
        })
    );
    assert_eq!(engine.log().decider(&node(&f.alice), 1), Some(too_much.id()));
    assert_eq!(engine.log().status(&next.id()), Some(TxStatus::Committed));
    assert_eq!(engine.accounts().balance(&bob), Amount::from_hop(5));
}

// ============================================================================
// CONFLICTS
// ============================================================================

#[test]
fn test_conflict_resolution_is_order_independent() {
    let f = funded();
    let bob = node(&Keypair::generate());
    let carol = node(&Keypair::generate());
    let x = transfer(&f.alice, bob, 10, 1, &[&f.genesis]);
    let y = transfer(&f.alice, carol, 10, 1, &[&f.genesis]);
    let (winner, loser) = if x.id() < y.id() { (&x, &y) } else { (&y, &x) };

    let mut first = engine(&f.policy);
    let mut second = engine(&f.policy);
    for tx in [&f.genesis, &x, &y] {
        first.ingest(verify(tx, &f.policy), 0).unwrap();
    }
    for tx in [&f.genesis, &y, &x] {
        second.ingest(verify(tx, &f.policy), 0).unwrap();
    }

    for engine in [&first, &second] {
        assert_eq!(engine.log().status(&winner.id()), Some(TxStatus::Committed));
        assert_eq!(
            engine.log().get(&loser.id()).and_then(|e| e.reject_reason().cloned()),
            Some(RejectReason::Conflict { winner: winner.id() })
        );
        assert_eq!(engine.accounts().balance(&winner.recipient()), Amount::from_hop(10));
        assert_eq!(engine.accounts().balance(&loser.recipient()), Amount::ZERO);
        assert!(engine.accounts().is_conserved());
    }
    assert!(first.digest(bob, 0).matches(&second.digest(carol, 0)));
}

#[test]
fn test_late_smaller_sibling_supersedes_and_cascades() {
    let f = funded();
    let bob = Keypair::generate();
    let dave = node(&Keypair::generate());
    let x = transfer(&f.alice, node(&bob), 10, 1, &[&f.genesis]);
    let y = loop {
        let candidate = transfer(&f.alice, node(&Keypair::generate()), 10, 1, &[&f.genesis]);
        if candidate.id() < x.id() {
            break candidate;
        }
    };
    let carol = y.recipient();
    let spend = transfer(&bob, dave, 5, 1, &[&x]);

    let mut engine = engine(&f.policy);
    for tx in [&f.genesis, &x, &spend] {
        engine.ingest(verify(tx, &f.policy), 0).unwrap();
    }
    assert_eq!(engine.accounts().balance(&dave), Amount::from_hop(5));
    engine.take_events();

    assert_eq!(
        engine.ingest(verify(&y, &f.policy), 10).unwrap(),
        IngestOutcome::Superseded { loser: x.id() }
    );

    assert_eq!(engine.log().status(&y.id()), Some(TxStatus::Committed));
    assert_eq!(
        engine.log().get(&x.id()).and_then(|e| e.reject_reason().cloned()),
        Some(RejectReason::Conflict { winner: y.id() })
    );
    assert_eq!(
        engine.log().get(&spend.id()).and_then(|e| e.reject_reason().cloned()),
        Some(RejectReason::DependencyRejected { dep: x.id() })
    );
    assert_eq!(engine.accounts().balance(&carol), Amount::from_hop(10));
    assert_eq!(engine.accounts().balance(&node(&bob)), Amount::ZERO);
    assert_eq!(engine.accounts().balance(&dave), Amount::ZERO);
    assert!(engine.accounts().is_conserved());
    assert_eq!(engine.stats().superseded, 1);

    let changes: Vec<_> = engine
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            LedgerEvent::BalanceChanged(change) => Some((change.node_id, change.old, change.new)),
            _ => None,
        })
        .collect();
    assert!(changes.contains(&(carol, Amount::ZERO, Amount::from_hop(10))));
    assert!(changes.contains(&(dave, Amount::from_hop(5), Amount::ZERO)));
    assert!(!changes.iter().any(|(id, _, _)| *id == node(&f.alice)));
}

#[test]
fn test_late_larger_sibling_loses() {
    let f = funded();
    let x = transfer(&f.alice, node(&Keypair::generate()), 10, 1, &[&f.genesis]);
    let y = loop {
        let candidate = transfer(&f.alice, node(&Keypair::generate()), 10, 1, &[&f.genesis]);
        if candidate.id() > x.id() {
            break candidate;
        }
    };

    let mut engine = engine(&f.policy);
    engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap();
    engine.ingest(verify(&x, &f.policy), 0).unwrap();
    assert_eq!(
        engine.ingest(verify(&y, &f.policy), 0).unwrap(),
        IngestOutcome::LostConflict { winner: x.id() }
    );
    assert_eq!(engine.log().status(&y.id()), Some(TxStatus::Rejected));
    assert_eq!(engine.stats().superseded, 0);
}

// ============================================================================
// LOCAL SUBMISSION
// ============================================================================

#[test]
fn test_submit_local_refuses_gap() {
    let f = funded();
    let mut engine = engine(&f.policy);
    let genesis = TransactionBuilder::genesis(&f.authority, node(&f.alice), Amount::from_hop(1))
        .sequence(2)
        .build()
        .unwrap();

    let err = engine.submit_local(verify(&genesis, &f.policy), 0).unwrap_err();
    assert!(matches!(err, ReconcileError::OutOfSequence { expected: 1, got: 2 }));
    assert!(engine.log().is_empty());
}

#[test]
fn test_submit_local_refuses_overdraft_without_appending() {
    let f = funded();
    let mut engine = engine(&f.policy);
    engine.submit_local(verify(&f.genesis, &f.policy), 0).unwrap();

    let too_much = transfer(&f.alice, node(&Keypair::generate()), 11, 1, &[&f.genesis]);
    let err = engine.submit_local(verify(&too_much, &f.policy), 0).unwrap_err();
    assert!(matches!(err, ReconcileError::Account(_)));
    assert!(!engine.log().contains(&too_much.id()));
    assert_eq!(engine.log().tip(&node(&f.alice)), 0);
}

#[test]
fn test_submit_local_requires_committed_dependencies() {
    let f = funded();
    let mut engine = engine(&f.policy);

    let pay = transfer(&f.alice, node(&Keypair::generate()), 1, 1, &[&f.genesis]);
    let err = engine.submit_local(verify(&pay, &f.policy), 0).unwrap_err();
    assert!(matches!(err, ReconcileError::MissingDependency(dep) if dep == f.genesis.id()));
}

// ============================================================================
// ADMIN ORDERING
// ============================================================================

/// Feed each delivery order to a fresh engine
fn deliver(policy: &LedgerPolicy, orders: &[Vec<&Transaction>]) -> Vec<ReconciliationEngine> {
    orders
        .iter()
        .map(|order| {
            let mut engine = engine(policy);
            for tx in order {
                engine.ingest(verify(tx, policy), 0).unwrap();
            }
            engine
        })
        .collect()
}

fn assert_converged(engines: &[ReconciliationEngine], nodes: &[NodeId]) {
    let (first, rest) = engines.split_first().unwrap();
    for other in rest {
        for n in nodes {
            assert_eq!(first.accounts().balance(n), other.accounts().balance(n));
            assert_eq!(first.accounts().is_removed(n), other.accounts().is_removed(n));
        }
        assert_eq!(first.accounts().issued_supply(), other.accounts().issued_supply());
        assert!(first.digest(nodes[0], 0).matches(&other.digest(nodes[0], 0)));
    }
    for engine in engines {
        assert!(engine.accounts().is_conserved());
    }
}

#[test]
fn test_admin_credit_and_incoming_transfer_converge() {
    let f = funded();
    let policy = f.policy.clone().with_admin(f.authority.public_key());
    let carol = Keypair::generate();
    let alice = node(&f.alice);
    let carol_mint = TransactionBuilder::genesis(&f.authority, node(&carol), Amount::from_hop(4))
        .sequence(2)
        .lamport(2)
        .build()
        .unwrap();
    // The admin saw 10 HOP and tops alice up to 40 while carol pays her 4
    let credit = TransactionBuilder::admin_credit(&f.authority, alice, Amount::from_hop(30))
        .sequence(1)
        .lamport(3)
        .depends_on([f.genesis.id()])
        .build()
        .unwrap();
    let pay = transfer(&carol, alice, 4, 1, &[&carol_mint]);

    let engines = deliver(
        &policy,
        &[
            vec![&f.genesis, &carol_mint, &credit, &pay],
            vec![&f.genesis, &carol_mint, &pay, &credit],
        ],
    );
    assert_converged(&engines, &[alice, node(&carol)]);
    assert_eq!(engines[0].accounts().balance(&alice), Amount::from_hop(44));
    assert_eq!(engines[0].accounts().issued_supply(), Amount::from_hop(44));
}

#[test]
fn test_admin_debit_and_own_transfer_converge() {
    let f = funded();
    let policy = f.policy.clone().with_admin(f.authority.public_key());
    let alice = node(&f.alice);
    let bob = node(&Keypair::generate());
    // Both claim alice's first slot, so only one of them may commit
    let debit = TransactionBuilder::admin_debit(&f.authority, alice, Amount::from_hop(8))
        .sequence(1)
        .lamport(2)
        .depends_on([f.genesis.id()])
        .build()
        .unwrap();
    let pay = transfer(&f.alice, bob, 5, 1, &[&f.genesis]);

    let engines = deliver(
        &policy,
        &[
            vec![&f.genesis, &debit, &pay],
            vec![&f.genesis, &pay, &debit],
        ],
    );
    assert_converged(&engines, &[alice, bob]);
    let winner = debit.id().min(pay.id());
    for engine in &engines {
        assert_eq!(engine.log().decider(&alice, 1), Some(winner));
        assert_eq!(engine.log().status(&winner), Some(TxStatus::Committed));
    }
}

#[test]
fn test_remove_and_incoming_transfer_converge() {
    let f = funded();
    let policy = f.policy.clone().with_admin(f.authority.public_key());
    let carol = Keypair::generate();
    let alice = node(&f.alice);
    let carol_mint = TransactionBuilder::genesis(&f.authority, node(&carol), Amount::from_hop(6))
        .sequence(2)
        .lamport(2)
        .build()
        .unwrap();
    let remove = TransactionBuilder::admin_remove(&f.authority, alice)
        .sequence(1)
        .lamport(3)
        .depends_on([f.genesis.id()])
        .build()
        .unwrap();
    let pay = transfer(&carol, alice, 4, 1, &[&carol_mint]);

    let engines = deliver(
        &policy,
        &[
            vec![&f.genesis, &carol_mint, &remove, &pay],
            vec![&f.genesis, &carol_mint, &pay, &remove],
        ],
    );
    assert_converged(&engines, &[alice, node(&carol)]);
    for engine in &engines {
        assert_eq!(engine.log().status(&pay.id()), Some(TxStatus::Committed));
        assert!(engine.accounts().is_removed(&alice));
        assert_eq!(engine.accounts().balance(&node(&carol)), Amount::from_hop(2));
        assert_eq!(engine.accounts().issued_supply(), Amount::from_hop(2));
    }
}

// ============================================================================
// BUFFERING AND EXPIRY
// ============================================================================

#[test]
fn test_pending_buffer_is_bounded() {
    let f = funded();
    let config = ReconcileConfig::new().with_max_pending(1);
    let mut engine = engine_with(&f.policy, config);
    let bob = node(&Keypair::generate());

    engine
        .ingest(verify(&transfer(&f.alice, bob, 1, 2, &[]), &f.policy), 0)
        .unwrap();
    let err = engine
        .ingest(verify(&transfer(&f.alice, bob, 1, 3, &[]), &f.policy), 0)
        .unwrap_err();
    assert!(matches!(err, ReconcileError::PendingFull(1)));
    assert_eq!(engine.stats().dropped, 1);
}

#[test]
fn test_full_buffer_still_admits_gap_filler() {
    let f = funded();
    let config = ReconcileConfig::new().with_max_pending(2);
    let mut engine = engine_with(&f.policy, config);
    let bob = node(&Keypair::generate());
    engine.ingest(verify(&f.genesis, &f.policy), 0).unwrap();

    let later = [
        transfer(&f.alice, bob, 1, 2, &[]),
        transfer(&f.alice, bob, 1, 3, &[]),
    ];
    for tx in &later {
        engine.ingest(verify(tx, &f.policy), 0).unwrap();
    }
    assert_eq!(engine.log().pending_count(), 2);

    // The missing seq 1 is decidable on arrival and unblocks the rest
    let filler = transfer(&f.alice, bob, 1, 1, &[&f.genesis]);
    assert_eq!(engine.ingest(verify(&filler, &f.policy), 0).unwrap(), IngestOutcome::Accepted);
    assert_eq!(engine.log().pending_count(), 0);
    assert_eq!(engine.log().tip(&node(&f.alice)), 3);
    assert_eq!(engine.accounts().balance(&bob), Amount::from_hop(3));
    assert_eq!(engine.stats().dropped, 0);

    // A filler whose dependency is missing is still refused
    let stray = Keypair::generate();
    let unseen = transfer(&Keypair::generate(), node(&stray), 1, 1, &[]);
    let blocked = transfer(&stray, bob, 1, 1, &[&unseen]);
    engine.ingest(verify(&transfer(&stray, bob, 1, 2, &[]), &f.policy), 0).unwrap();
    engine.ingest(verify(&transfer(&stray, bob, 1, 3, &[]), &f.policy), 0).unwrap();
    assert!(matches!(
        engine.ingest(verify(&blocked, &f.policy), 0),
        Err(ReconcileError::PendingFull(2))
    ));
}

#[test]
fn test_expired_gap_lets_stream_wait_for_resend() {
    let f = funded();
    let config = ReconcileConfig::new().with_pending_timeout(1_000);
    let mut engine = engine_with(&f.policy, config);
    let orphan = transfer(&f.alice, node(&Keypair::generate()), 1, 1, &[&f.genesis]);

    engine.ingest(verify(&orphan, &f.policy), 0).unwrap();
    assert_eq!(engine.expire_pending(2_000).unwrap(), vec![orphan.id()]);
    assert_eq!(engine.log().pending_count(), 0);

    // The same transaction is accepted again once its credit arrives.
    engine.ingest(verify(&f.genesis, &f.policy), 2_100).unwrap();
    assert_eq!(
        engine.ingest(verify(&orphan, &f.policy), 2_200).unwrap(),
        IngestOutcome::Accepted
    );
    assert_eq!(engine.log().status(&orphan.id()), Some(TxStatus::Committed));
}

// ============================================================================
// SERVING AND PERSISTENCE
// ============================================================================

#[test]
fn test_serve_range_is_batched() {
    let f = funded();
    let config = ReconcileConfig::new().with_max_batch(2);
    let mut engine = engine_with(&f.policy, config);
    for seq in 1..=5 {
        let mint = TransactionBuilder::genesis(&f.authority, node(&f.alice), Amount::from_hop(1))
            .sequence(seq)
            .build()
            .unwrap();
        engine.ingest(verify(&mint, &f.policy), 0).unwrap();
    }
    let stream = node(&f.authority);

    let (batch, more) = engine.serve_range(&stream, 1, 5);
    assert_eq!(batch.iter().map(|tx| tx.sender_seq()).collect::<Vec<_>>(), vec![1, 2]);
    assert!(more);

    let (batch, more) = engine.serve_range(&stream, 5, 5);
    assert_eq!(batch.len(), 1);
    assert!(!more);

    let (batch, _) = engine.serve_range(&stream, 6, 9);
    assert!(batch.is_empty());
}

#[test]
fn test_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let f = funded();
    let bob = node(&Keypair::generate());
    let pay = transfer(&f.alice, bob, 4, 1, &[&f.genesis]);
    let gap = transfer(&f.alice, bob, 1, 3, &[&f.genesis]);

    {
        let store = SledStore::open(dir.path()).unwrap();
        let mut engine =
            ReconciliationEngine::new(f.policy.clone(), Box::new(store), ReconcileConfig::new())
                .unwrap();
        for tx in [&f.genesis, &pay, &gap] {
            engine.ingest(verify(tx, &f.policy), 0).unwrap();
        }
        engine.flush().unwrap();
    }

    let store = SledStore::open(dir.path()).unwrap();
    let config = ReconcileConfig::new();
    let engine = ReconciliationEngine::new(f.policy.clone(), Box::new(store), config).unwrap();
    assert_eq!(engine.accounts().balance(&node(&f.alice)), Amount::from_hop(6));
    assert_eq!(engine.accounts().balance(&bob), Amount::from_hop(4));
    assert_eq!(engine.log().status(&pay.id()), Some(TxStatus::Committed));
    assert_eq!(engine.log().status(&gap.id()), Some(TxStatus::Pending));
    assert_eq!(engine.log().commit_order(), &[f.genesis.id(), pay.id()]);
}
