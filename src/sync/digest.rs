// Digest - Compact per-stream summary of a transaction log
//
// For every stream the digest carries the highest decided sequence and a
// rolling hash over the decided txIds in sequence order:
//   h(0) = 0, h(n) = sha256(h(n-1) || txId(n))[..8]
// Equal max_seq with different hashes means the two logs decided some slot
// differently (a fork), which needs a full-range exchange to repair.

use crate::identity::NodeId;
use crate::ledger::TransactionLog;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const ROLLING_HASH_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub max_seq: u64,
    pub rolling_hash: [u8; ROLLING_HASH_LEN],
}

/// What to do about one stream after comparing digests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestGap {
    /// The peer knows slots we lack
    Behind { stream: NodeId, from_seq: u64, to_seq: u64 },
    /// Same length, different decisions; ask for the whole stream
    Diverged { stream: NodeId, to_seq: u64 },
    /// The peer lacks slots we have; it will ask us
    Ahead { stream: NodeId },
}

impl DigestGap {
    pub fn stream(&self) -> NodeId {
        match self {
            DigestGap::Behind { stream, .. }
            | DigestGap::Diverged { stream, .. }
            | DigestGap::Ahead { stream } => *stream,
        }
    }

    /// Range to request from the peer, if any
    pub fn request_range(&self) -> Option<(NodeId, u64, u64)> {
        match *self {
            DigestGap::Behind { stream, from_seq, to_seq } => Some((stream, from_seq, to_seq)),
            DigestGap::Diverged { stream, to_seq } => Some((stream, 1, to_seq)),
            DigestGap::Ahead { .. } => None,
        }
    }
}

/// Per-stream log summary exchanged every gossip cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDigest {
    pub origin: NodeId,
    pub streams: BTreeMap<NodeId, StreamSummary>,
    pub timestamp: u64,
}

impl LogDigest {
    /// Summarize the decided slots of `log`
    pub fn compute(origin: NodeId, log: &TransactionLog, timestamp: u64) -> Self {
        let streams = log
            .streams()
            .into_iter()
            .map(|stream| {
                let rolling_hash = log
                    .decided_ids(&stream)
                    .fold([0u8; ROLLING_HASH_LEN], |hash, id| roll(&hash, id.as_bytes()));
                let max_seq = log.tip(&stream);
                (stream, StreamSummary { max_seq, rolling_hash })
            })
            .collect();
        Self {
            origin,
            streams,
            timestamp,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// True if both digests describe the same decided history
    pub fn matches(&self, other: &LogDigest) -> bool {
        self.streams == other.streams
    }

    /// Compare our digest (`self`) with a peer's
    pub fn diff(&self, remote: &LogDigest) -> Vec<DigestGap> {
        let mut gaps = Vec::new();
        for (stream, theirs) in &remote.streams {
            match self.streams.get(stream) {
                None => gaps.push(DigestGap::Behind {
                    stream: *stream,
                    from_seq: 1,
                    to_seq: theirs.max_seq,
                }),
                Some(ours) if theirs.max_seq > ours.max_seq => gaps.push(DigestGap::Behind {
                    stream: *stream,
                    from_seq: ours.max_seq + 1,
                    to_seq: theirs.max_seq,
                }),
                Some(ours) if theirs.max_seq < ours.max_seq => {
                    gaps.push(DigestGap::Ahead { stream: *stream })
                }
                Some(ours) if ours.rolling_hash != theirs.rolling_hash => {
                    gaps.push(DigestGap::Diverged {
                        stream: *stream,
                        to_seq: ours.max_seq,
                    })
                }
                Some(_) => {}
            }
        }
        for stream in self.streams.keys() {
            if !remote.streams.contains_key(stream) {
                gaps.push(DigestGap::Ahead { stream: *stream });
            }
        }
        gaps
    }
}

fn roll(prev: &[u8; ROLLING_HASH_LEN], id: &[u8; 32]) -> [u8; ROLLING_HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(id);
    let hash = hasher.finalize();
    let mut out = [0u8; ROLLING_HASH_LEN];
    out.copy_from_slice(&hash[..ROLLING_HASH_LEN]);
    out
}
