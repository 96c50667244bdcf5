// Peer Management - Track peers heard on the mesh and their sync state
//
// A peer is Unknown until its first digest arrives, Syncing while its
// digest differs from ours, and Converged once the digests match. A peer
// stuck in Syncing past the stall timeout falls back to Unknown without
// affecting any other peer.

use crate::identity::NodeId;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Peer-related errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeerError {
    #[error("Cannot add self as a peer")]
    CannotAddSelf,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Peer table full ({0} peers)")]
    TableFull(usize),
}

/// Pairwise sync state with a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// Heard from, no digest compared yet
    Unknown,
    /// Digests differ; ranges are being exchanged
    Syncing,
    /// Last digest comparison matched
    Converged,
}

/// Statistics about a peer registry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub total_peers: usize,
    pub unknown_peers: usize,
    pub syncing_peers: usize,
    pub converged_peers: usize,
}

/// Information about a known peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    node_id: NodeId,
    state: PeerState,
    /// Last time we heard from this peer (unix timestamp ms)
    last_seen: u64,
    /// When the current Syncing episode began
    syncing_since: Option<u64>,
    /// Streams listed in the peer's last digest
    last_digest_streams: usize,
    requests_sent: u64,
    transactions_received: u64,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, now: u64) -> Self {
        Self {
            node_id,
            state: PeerState::Unknown,
            last_seen: now,
            syncing_since: None,
            last_digest_streams: 0,
            requests_sent: 0,
            transactions_received: 0,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Set the state; entering Syncing starts the stall clock
    pub fn set_state(&mut self, state: PeerState, now: u64) {
        match state {
            PeerState::Syncing if self.state != PeerState::Syncing => {
                self.syncing_since = Some(now)
            }
            PeerState::Syncing => {}
            _ => self.syncing_since = None,
        }
        self.state = state;
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn touch(&mut self, now: u64) {
        self.last_seen = self.last_seen.max(now);
    }

    pub fn syncing_since(&self) -> Option<u64> {
        self.syncing_since
    }

    pub fn last_digest_streams(&self) -> usize {
        self.last_digest_streams
    }

    pub fn record_digest(&mut self, streams: usize) {
        self.last_digest_streams = streams;
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn record_request(&mut self) {
        self.requests_sent += 1;
    }

    pub fn transactions_received(&self) -> u64 {
        self.transactions_received
    }

    pub fn record_transactions(&mut self, count: usize) {
        self.transactions_received += count as u64;
    }

    /// Not heard from in `timeout_ms`
    pub fn is_stale(&self, timeout_ms: u64, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > timeout_ms
    }

    /// Syncing for longer than `timeout_ms`
    pub fn is_stalled(&self, timeout_ms: u64, now: u64) -> bool {
        self.syncing_since
            .is_some_and(|since| now.saturating_sub(since) > timeout_ms)
    }
}

/// Registry of known peers
#[derive(Clone, Debug)]
pub struct PeerRegistry {
    my_node_id: NodeId,
    peers: HashMap<NodeId, PeerInfo>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(my_node_id: NodeId, max_peers: usize) -> Self {
        Self {
            my_node_id,
            peers: HashMap::new(),
            max_peers: max_peers.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Record that `node_id` was heard, adding it if new
    pub fn observe(&mut self, node_id: NodeId, now: u64) -> Result<&mut PeerInfo, PeerError> {
        if node_id == self.my_node_id {
            return Err(PeerError::CannotAddSelf);
        }
        if !self.peers.contains_key(&node_id) && self.peers.len() >= self.max_peers {
            return Err(PeerError::TableFull(self.max_peers));
        }
        let peer = self
            .peers
            .entry(node_id)
            .or_insert_with(|| PeerInfo::new(node_id, now));
        peer.touch(now);
        Ok(peer)
    }

    pub fn set_state(
        &mut self,
        node_id: &NodeId,
        state: PeerState,
        now: u64,
    ) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(node_id).ok_or(PeerError::PeerNotFound)?;
        peer.set_state(state, now);
        Ok(())
    }

    pub fn remove_peer(&mut self, node_id: &NodeId) {
        self.peers.remove(node_id);
    }

    pub fn get_peer(&self, node_id: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(node_id)
    }

    pub fn get_peer_mut(&mut self, node_id: &NodeId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(node_id)
    }

    /// All peers ordered by node id
    pub fn all_peers(&self) -> Vec<&PeerInfo> {
        let mut peers: Vec<&PeerInfo> = self.peers.values().collect();
        peers.sort_by_key(|p| p.node_id);
        peers
    }

    pub fn select_random_peers(&self, count: usize) -> Vec<&PeerInfo> {
        let mut rng = rand::thread_rng();
        let mut peers: Vec<&PeerInfo> = self.peers.values().collect();
        peers.shuffle(&mut rng);
        peers.truncate(count);
        peers
    }

    pub fn peers_by_state(&self, state: PeerState) -> Vec<&PeerInfo> {
        self.peers.values().filter(|p| p.state == state).collect()
    }

    /// Reset peers stuck in Syncing back to Unknown; returns their ids
    pub fn expire_stalled(&mut self, timeout_ms: u64, now: u64) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.is_stalled(timeout_ms, now) {
                peer.set_state(PeerState::Unknown, now);
                expired.push(peer.node_id);
            }
        }
        expired
    }

    /// Forget peers not heard from in `timeout_ms`
    pub fn remove_stale_peers(&mut self, timeout_ms: u64, now: u64) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, p| !p.is_stale(timeout_ms, now));
        before - self.peers.len()
    }

    pub fn stats(&self) -> PeerStats {
        let mut stats = PeerStats {
            total_peers: self.peers.len(),
            ..PeerStats::default()
        };
        for peer in self.peers.values() {
            match peer.state {
                PeerState::Unknown => stats.unknown_peers += 1,
                PeerState::Syncing => stats.syncing_peers += 1,
                PeerState::Converged => stats.converged_peers += 1,
            }
        }
        stats
    }
}
