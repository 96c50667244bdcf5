// Fragment Tests
// Splitting payloads into frames, reassembly and the seen-cache

use geohop::transport::{
    Fragment, Fragmenter, PayloadId, Reassembler, SeenCache, TransportError, FRAGMENT_HEADER_LEN,
    MAX_FRAGMENTS,
};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// SPLITTING
// ============================================================================

#[test]
fn test_split_respects_frame_size() {
    let fragmenter = Fragmenter::new(64).unwrap();
    let data = payload(500);
    let fragments = fragmenter.split(&data).unwrap();

    assert_eq!(fragmenter.chunk_size(), 64 - FRAGMENT_HEADER_LEN);
    assert_eq!(fragments.len(), 500usize.div_ceil(fragmenter.chunk_size()));
    for (i, fragment) in fragments.iter().enumerate() {
        assert_eq!(fragment.index() as usize, i);
        assert_eq!(fragment.count() as usize, fragments.len());
        assert_eq!(fragment.payload_id(), PayloadId::of(&data));
        assert!(fragment.encode().len() <= 64);
    }
}

#[test]
fn test_empty_payload_is_one_fragment() {
    let fragments = Fragmenter::new(32).unwrap().split(&[]).unwrap();
    assert_eq!(fragments.len(), 1);
    assert!(fragments[0].chunk().is_empty());

    let mut reassembler = Reassembler::new(1_000, 4);
    assert_eq!(reassembler.accept(fragments[0].clone(), 0), Some(Vec::new()));
}

#[test]
fn test_oversized_payload_refused() {
    let fragmenter = Fragmenter::new(32).unwrap();
    assert_eq!(fragmenter.max_payload(), (32 - FRAGMENT_HEADER_LEN) * MAX_FRAGMENTS);

    let result = fragmenter.split(&payload(fragmenter.max_payload() + 1));
    assert_eq!(
        result.unwrap_err(),
        TransportError::PayloadTooLarge {
            size: fragmenter.max_payload() + 1,
            max: fragmenter.max_payload(),
        }
    );
}

#[test]
fn test_decode_rejects_malformed_frames() {
    assert!(matches!(Fragment::decode(&[0x47, 1, 0]), Err(TransportError::MalformedFrame(_))));

    let fragment = Fragmenter::new(32).unwrap().split(b"hello").unwrap().remove(0);
    let mut bytes = fragment.encode();
    assert_eq!(Fragment::decode(&bytes).unwrap(), fragment);

    bytes[0] = 0x00;
    assert!(Fragment::decode(&bytes).is_err());

    let mut bad_index = fragment.encode();
    bad_index[10] = 3;
    bad_index[11] = 3;
    assert!(Fragment::decode(&bad_index).is_err());
}

// ============================================================================
// REASSEMBLY
// ============================================================================

#[test]
fn test_reassembles_out_of_order_with_duplicates() {
    let data = payload(300);
    let mut fragments = Fragmenter::new(40).unwrap().split(&data).unwrap();
    fragments.reverse();
    let duplicate = fragments[0].clone();

    let mut reassembler = Reassembler::new(1_000, 4);
    let last = fragments.pop().unwrap();
    for fragment in fragments {
        assert!(reassembler.accept(fragment, 10).is_none());
    }
    assert!(reassembler.accept(duplicate, 11).is_none());
    assert_eq!(reassembler.pending(), 1);

    assert_eq!(reassembler.accept(last, 12), Some(data));
    assert_eq!(reassembler.pending(), 0);
    assert_eq!(reassembler.dropped(), 0);
}

#[test]
fn test_interleaved_payloads() {
    let fragmenter = Fragmenter::new(24).unwrap();
    let a = payload(50);
    let b: Vec<u8> = payload(40).into_iter().rev().collect();
    let fa = fragmenter.split(&a).unwrap();
    let fb = fragmenter.split(&b).unwrap();

    let mut reassembler = Reassembler::new(1_000, 4);
    let mut done = Vec::new();
    for (x, y) in fa.iter().zip(fb.iter()) {
        done.extend(reassembler.accept(x.clone(), 0));
        done.extend(reassembler.accept(y.clone(), 0));
    }
    for rest in fa.iter().skip(fb.len()) {
        done.extend(reassembler.accept(rest.clone(), 0));
    }
    assert_eq!(done.len(), 2);
    assert!(done.contains(&a));
    assert!(done.contains(&b));
}

#[test]
fn test_partials_expire() {
    let fragments = Fragmenter::new(24).unwrap().split(&payload(100)).unwrap();
    let mut reassembler = Reassembler::new(500, 4);
    reassembler.accept(fragments[0].clone(), 1_000);

    assert_eq!(reassembler.expire(1_400), 0);
    assert_eq!(reassembler.expire(1_501), 1);
    assert_eq!(reassembler.pending(), 0);
    assert_eq!(reassembler.dropped(), 1);

    // The late remainder alone no longer completes the payload
    for fragment in fragments.into_iter().skip(1) {
        assert!(reassembler.accept(fragment, 1_600).is_none());
    }
}

#[test]
fn test_partial_limit_evicts_oldest() {
    let fragmenter = Fragmenter::new(24).unwrap();
    let mut reassembler = Reassembler::new(10_000, 2);
    let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 40]).collect();
    let split: Vec<Vec<Fragment>> = payloads.iter().map(|p| fragmenter.split(p).unwrap()).collect();

    for (t, fragments) in split.iter().enumerate() {
        reassembler.accept(fragments[0].clone(), t as u64);
    }
    assert_eq!(reassembler.pending(), 2);
    assert_eq!(reassembler.dropped(), 1);

    // The newest payload survived eviction
    let mut out = None;
    for fragment in split[2].iter().skip(1) {
        out = reassembler.accept(fragment.clone(), 5);
    }
    assert_eq!(out.as_ref(), Some(&payloads[2]));
}

// ============================================================================
// SEEN CACHE
// ============================================================================

#[test]
fn test_seen_cache_evicts_oldest() {
    let mut cache = SeenCache::new(3);
    assert!(cache.insert(1));
    assert!(cache.insert(2));
    assert!(!cache.insert(1));
    assert!(cache.insert(3));
    assert!(cache.insert(4));

    assert_eq!(cache.len(), 3);
    assert_eq!(cache.capacity(), 3);
    assert!(!cache.contains(&1));
    assert!(cache.contains(&4));
    // Evicted keys count as new again
    assert!(cache.insert(1));
}
