// Gossip Tests
// Tests for digest exchange, range repair and announcement spreading

use geohop::coverage::{CoverageWindow, RelayProof};
use geohop::identity::{Keypair, NodeId};
use geohop::ledger::{
    Amount, LedgerPolicy, Transaction, TransactionBuilder, TransactionValidator, TxStatus,
};
use geohop::storage::MemoryStore;
use geohop::sync::{
    GossipConfig, GossipEngine, GossipEvent, Message, PeerState, ProtocolError, RangeRequest,
    ReconcileConfig, ReconciliationEngine,
};

// ============================================================================
// HELPERS
// ============================================================================

fn node(kp: &Keypair) -> NodeId {
    NodeId::from_public_key(&kp.public_key())
}

fn engine_with(
    kp: &Keypair,
    policy: &LedgerPolicy,
    reconcile: ReconcileConfig,
    gossip: GossipConfig,
) -> GossipEngine {
    let reconciler =
        ReconciliationEngine::new(policy.clone(), Box::new(MemoryStore::new()), reconcile).unwrap();
    GossipEngine::new(node(kp), reconciler, gossip)
}

fn engine(kp: &Keypair, policy: &LedgerPolicy) -> GossipEngine {
    engine_with(kp, policy, ReconcileConfig::new(), GossipConfig::new())
}

fn sends(events: Vec<GossipEvent>) -> Vec<Message> {
    events
        .into_iter()
        .filter_map(|e| match e {
            GossipEvent::Send(msg) => Some(msg),
            _ => None,
        })
        .collect()
}

/// Deliver broadcasts back and forth over the wire codec until both go quiet
fn pump(
    a: &mut GossipEngine,
    b: &mut GossipEngine,
    mut to_a: Vec<Message>,
    mut to_b: Vec<Message>,
    now: u64,
) {
    for _ in 0..64 {
        if to_a.is_empty() && to_b.is_empty() {
            return;
        }
        let mut next_a = Vec::new();
        let mut next_b = Vec::new();
        for msg in to_b.drain(..) {
            let bytes = msg.to_bytes().unwrap();
            next_a.extend(sends(b.handle_payload(&bytes, now).unwrap()));
        }
        for msg in to_a.drain(..) {
            let bytes = msg.to_bytes().unwrap();
            next_b.extend(sends(a.handle_payload(&bytes, now).unwrap()));
        }
        to_a = next_a;
        to_b = next_b;
    }
    panic!("gossip did not settle");
}

/// One digest round in each direction
fn exchange_digests(a: &mut GossipEngine, b: &mut GossipEngine, now: u64) {
    let to_b = sends(a.tick(now));
    let to_a = sends(b.tick(now));
    pump(a, b, to_a, to_b, now);
}

fn mint(authority: &Keypair, to: NodeId, hop: u64, seq: u64) -> Transaction {
    TransactionBuilder::genesis(authority, to, Amount::from_hop(hop))
        .sequence(seq)
        .lamport(seq)
        .build()
        .unwrap()
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_gossip_config_builders() {
    let config = GossipConfig::new()
        .with_gossip_interval(5_000)
        .with_max_hops(2)
        .with_sync_timeout(1_000)
        .with_peer_timeout(60_000)
        .with_max_peers(8);

    assert_eq!(config.gossip_interval_ms, 5_000);
    assert_eq!(config.max_hops, 2);
    assert_eq!(config.sync_timeout_ms, 1_000);
    assert_eq!(config.peer_timeout_ms, 60_000);
    assert_eq!(config.max_peers, 8);
}

#[test]
fn test_tick_broadcasts_digest() {
    let kp = Keypair::generate();
    let mut engine = engine(&kp, &LedgerPolicy::new());

    let messages = sends(engine.tick(1_000));
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        Message::Digest(digest) => {
            assert_eq!(digest.origin, node(&kp));
            assert_eq!(digest.timestamp, 1_000);
            assert_eq!(digest.stream_count(), 0);
        }
        other => panic!("expected digest, got {:?}", other.message_type()),
    }
}

// ============================================================================
// DIGEST REPAIR
// ============================================================================

#[test]
fn test_digest_pull_converges_missed_transactions() {
    let authority = Keypair::generate();
    let peer = Keypair::generate();
    let alice = node(&Keypair::generate());
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let mut a = engine(&authority, &policy);
    let mut b = engine(&peer, &policy);

    // Announcements are lost; only the digest cycle can repair b.
    for seq in 1..=3 {
        let tx = TransactionValidator::verify(&mint(&authority, alice, 5, seq), &policy).unwrap();
        a.submit_local(tx, 100).unwrap();
    }
    assert_eq!(b.reconciler().accounts().balance(&alice), Amount::ZERO);

    exchange_digests(&mut a, &mut b, 1_000);
    assert_eq!(b.reconciler().accounts().balance(&alice), Amount::from_hop(15));

    exchange_digests(&mut a, &mut b, 2_000);
    assert!(a.digest(2_000).matches(&b.digest(2_000)));
    assert_eq!(a.peer_state(&node(&peer)), Some(PeerState::Converged));
    assert_eq!(b.peer_state(&node(&authority)), Some(PeerState::Converged));
    assert!(b.stats().ranges_requested >= 1);
    assert!(a.stats().ranges_served >= 1);
}

#[test]
fn test_long_range_continues_past_batch_limit() {
    let authority = Keypair::generate();
    let peer = Keypair::generate();
    let alice = node(&Keypair::generate());
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let mut gossip = GossipConfig::new();
    gossip.max_batches_per_request = 1;
    let reconcile = ReconcileConfig::new().with_max_batch(2);
    let mut a = engine_with(&authority, &policy, reconcile.clone(), gossip.clone());
    let mut b = engine_with(&peer, &policy, reconcile, gossip);

    for seq in 1..=7 {
        let tx = TransactionValidator::verify(&mint(&authority, alice, 1, seq), &policy).unwrap();
        a.submit_local(tx, 100).unwrap();
    }

    exchange_digests(&mut a, &mut b, 1_000);
    assert_eq!(b.reconciler().log().tip(&node(&authority)), 7);
    assert_eq!(b.reconciler().accounts().balance(&alice), Amount::from_hop(7));
    assert!(b.stats().ranges_requested >= 4);
}

#[test]
fn test_diverged_fork_resolves_to_smallest_id() {
    let authority = Keypair::generate();
    let alice = Keypair::generate();
    let (ka, kb) = (Keypair::generate(), Keypair::generate());
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let mut a = engine(&ka, &policy);
    let mut b = engine(&kb, &policy);

    let genesis = mint(&authority, node(&alice), 10, 1);
    let double_spend = |to: NodeId| {
        TransactionBuilder::transfer(&alice, to, Amount::from_hop(10))
            .sequence(1)
            .lamport(2)
            .depends_on([genesis.id()])
            .build()
            .unwrap()
    };
    let x = double_spend(node(&Keypair::generate()));
    let y = double_spend(node(&Keypair::generate()));
    let winner = x.id().min(y.id());

    for (engine, spend) in [(&mut a, &x), (&mut b, &y)] {
        let r = engine.reconciler_mut();
        r.ingest(TransactionValidator::verify(&genesis, &policy).unwrap(), 0).unwrap();
        r.ingest(TransactionValidator::verify(spend, &policy).unwrap(), 0).unwrap();
    }
    assert!(!a.digest(0).matches(&b.digest(0)));

    exchange_digests(&mut a, &mut b, 1_000);

    for engine in [&a, &b] {
        let log = engine.reconciler().log();
        assert_eq!(log.decider(&node(&alice), 1), Some(winner));
        assert_eq!(log.status(&winner), Some(TxStatus::Committed));
        assert!(engine.reconciler().accounts().is_conserved());
    }
    assert!(a.digest(2_000).matches(&b.digest(2_000)));
}

#[test]
fn test_untargeted_range_request_is_ignored() {
    let kp = Keypair::generate();
    let authority = Keypair::generate();
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let mut engine = engine(&kp, &policy);
    engine
        .reconciler_mut()
        .ingest(
            TransactionValidator::verify(&mint(&authority, node(&kp), 1, 1), &policy).unwrap(),
            0,
        )
        .unwrap();

    let requester = node(&Keypair::generate());
    let elsewhere = node(&Keypair::generate());
    let request = RangeRequest::new(requester, elsewhere, node(&authority), 1, 1, 10);
    assert!(sends(engine.handle_message(Message::RangeRequest(request), 10)).is_empty());

    let request = RangeRequest::new(requester, node(&kp), node(&authority), 1, 1, 20);
    let replies = sends(engine.handle_message(Message::RangeRequest(request), 20));
    assert!(matches!(
        &replies[..],
        [Message::TransactionBatch(batch)] if batch.transactions.len() == 1
    ));
    assert_eq!(engine.stats().ranges_served, 1);
}

// ============================================================================
// ANNOUNCEMENTS
// ============================================================================

#[test]
fn test_announcement_spreads_and_is_forwarded_once() {
    let authority = Keypair::generate();
    let peer = Keypair::generate();
    let alice = node(&Keypair::generate());
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let mut a = engine(&authority, &policy);
    let mut b = engine(&peer, &policy);

    let tx = TransactionValidator::verify(&mint(&authority, alice, 3, 1), &policy).unwrap();
    let (_, events) = a.submit_local(tx, 100).unwrap();
    let announcements = sends(events);
    assert_eq!(announcements.len(), 1);

    let forwarded = sends(b.handle_message(announcements[0].clone(), 110));
    assert_eq!(forwarded.len(), 1);
    assert_eq!(b.reconciler().accounts().balance(&alice), Amount::from_hop(3));

    // A second copy of the same announcement is a duplicate.
    assert!(sends(b.handle_message(announcements[0].clone(), 120)).is_empty());
    assert_eq!(b.stats().announcements_forwarded, 1);

    // The origin ignores the echo.
    assert!(sends(a.handle_message(forwarded[0].clone(), 130)).is_empty());
}

#[test]
fn test_invalid_announcement_is_counted() {
    let rogue = Keypair::generate();
    let authority = Keypair::generate();
    let policy = LedgerPolicy::new().with_genesis_authority(authority.public_key());
    let rogue_policy = LedgerPolicy::new().with_genesis_authority(rogue.public_key());
    let mut sender = engine(&rogue, &rogue_policy);
    let mut receiver = engine(&Keypair::generate(), &policy);

    let forged = TransactionValidator::verify(
        &mint(&rogue, node(&rogue), 1_000, 1),
        &LedgerPolicy::new().with_genesis_authority(rogue.public_key()),
    )
    .unwrap();
    let (_, events) = sender.submit_local(forged, 0).unwrap();
    for msg in sends(events) {
        assert!(sends(receiver.handle_message(msg, 0)).is_empty());
    }
    assert_eq!(receiver.stats().invalid_transactions, 1);
    assert!(receiver.reconciler().log().is_empty());
}

// ============================================================================
// MALFORMED INPUT AND RELAY PROOFS
// ============================================================================

#[test]
fn test_malformed_payloads_are_counted() {
    let mut engine = engine(&Keypair::generate(), &LedgerPolicy::new());

    assert_eq!(engine.handle_payload(&[], 0).unwrap_err(), ProtocolError::Empty);
    assert_eq!(
        engine.handle_payload(&[99, 1, 2], 0).unwrap_err(),
        ProtocolError::UnsupportedVersion(99)
    );
    assert_eq!(
        engine.handle_payload(&[geohop::sync::PROTOCOL_VERSION, 0xFF, 0xFF], 0).unwrap_err(),
        ProtocolError::DeserializationFailed
    );
    assert_eq!(engine.stats().malformed_messages, 3);
}

#[test]
fn test_relay_proof_is_surfaced() {
    let relayer = Keypair::generate();
    let mut sender = engine(&relayer, &LedgerPolicy::new());
    let mut receiver = engine(&Keypair::generate(), &LedgerPolicy::new());

    let proof = RelayProof::new(node(&relayer), [7u8; 32], CoverageWindow::new(1_000, 2_000));
    let GossipEvent::Send(msg) = sender.forward_proof(proof.clone(), 5) else {
        panic!("forward_proof must produce a send");
    };
    let events = receiver.handle_payload(&msg.to_bytes().unwrap(), 6).unwrap();
    assert_eq!(
        events,
        vec![GossipEvent::RelayProofReceived {
            from: node(&relayer),
            proof,
        }]
    );
}
