// Mesh adapter: best-effort multicast of opaque payloads over a Transport

use crate::clock::now_ms;
use crate::transport::dedup::SeenCache;
use crate::transport::fragment::{Fragment, Fragmenter, PayloadId, Reassembler};
use crate::transport::{PeerAddress, Transport, TransportError, TransportEvent, TransportStats};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Callback invoked with every newly reassembled payload
pub type ReceiveHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Configuration for the mesh adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshAdapterConfig {
    /// Capacity of the recently-seen payload cache
    pub seen_capacity: usize,
    pub reassembly_timeout_ms: u64,
    /// Bound on concurrently reassembling payloads
    pub max_partials: usize,
    /// Frames held for retry while the link is unavailable
    pub outbox_capacity: usize,
}

impl Default for MeshAdapterConfig {
    fn default() -> Self {
        Self {
            seen_capacity: 1024,
            reassembly_timeout_ms: 30_000,
            max_partials: 64,
            outbox_capacity: 256,
        }
    }
}

impl MeshAdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.seen_capacity = capacity;
        self
    }

    pub fn with_reassembly_timeout(mut self, ms: u64) -> Self {
        self.reassembly_timeout_ms = ms;
        self
    }

    pub fn with_max_partials(mut self, max: usize) -> Self {
        self.max_partials = max;
        self
    }

    pub fn with_outbox_capacity(mut self, frames: usize) -> Self {
        self.outbox_capacity = frames;
        self
    }
}

/// What happened to a broadcast payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Every fragment went on air
    Sent { fragments: usize },
    /// Some or all fragments wait in the outbox for the next cycle
    Queued { fragments: usize },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshStats {
    pub payloads_sent: u64,
    pub payloads_received: u64,
    pub duplicates_suppressed: u64,
    pub frames_queued: u64,
    /// Frames evicted from a full outbox
    pub frames_dropped: u64,
    pub malformed_frames: u64,
}

/// Fragmentation, reassembly and duplicate suppression over any [`Transport`]
///
/// Payload semantics are opaque here. A payload is identified by its content
/// hash; one already sent or received is never delivered upward again.
pub struct MeshAdapter<T: Transport> {
    transport: T,
    config: MeshAdapterConfig,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    seen: SeenCache<PayloadId>,
    handlers: Vec<ReceiveHandler>,
    outbox: VecDeque<Vec<u8>>,
    stats: MeshStats,
}

impl<T: Transport> MeshAdapter<T> {
    pub fn new(transport: T, config: MeshAdapterConfig) -> Result<Self, TransportError> {
        let fragmenter = Fragmenter::new(transport.max_frame_size())?;
        Ok(Self {
            reassembler: Reassembler::new(config.reassembly_timeout_ms, config.max_partials),
            seen: SeenCache::new(config.seen_capacity),
            fragmenter,
            transport,
            config,
            handlers: Vec::new(),
            outbox: VecDeque::new(),
            stats: MeshStats::default(),
        })
    }

    pub async fn start(&mut self) -> Result<(), TransportError> {
        self.transport.start().await
    }

    pub async fn stop(&mut self) -> Result<(), TransportError> {
        self.transport.stop().await
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Largest payload accepted by [`MeshAdapter::broadcast`]
    pub fn max_payload(&self) -> usize {
        self.fragmenter.max_payload()
    }

    /// Register a handler for reassembled payloads
    pub fn on_receive<F>(&mut self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Fragment and broadcast `payload`
    ///
    /// With no reachable neighbour, or on a retryable link error, the
    /// remaining frames are queued and flushed by [`MeshAdapter::flush_outbox`].
    pub async fn broadcast(&mut self, payload: &[u8]) -> Result<BroadcastOutcome, TransportError> {
        if !self.transport.state().is_running() {
            return Err(TransportError::NotRunning);
        }
        let fragments = self.fragmenter.split(payload)?;
        let count = fragments.len();
        self.seen.insert(PayloadId::of(payload));
        self.stats.payloads_sent += 1;
        let queued_before = self.stats.frames_queued;

        let mut frames = fragments.iter().map(Fragment::encode);
        if self.transport.link_available() {
            while let Some(frame) = frames.next() {
                match self.transport.broadcast(&frame).await {
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(error = %e, "link busy, queueing remaining fragments");
                        self.enqueue(frame);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for frame in frames {
            self.enqueue(frame);
        }
        if self.stats.frames_queued == queued_before {
            Ok(BroadcastOutcome::Sent { fragments: count })
        } else {
            Ok(BroadcastOutcome::Queued { fragments: count })
        }
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        if self.outbox.len() >= self.config.outbox_capacity {
            self.outbox.pop_front();
            self.stats.frames_dropped += 1;
        }
        self.outbox.push_back(frame);
        self.stats.frames_queued += 1;
    }

    /// Retry queued frames; returns how many went on air
    pub async fn flush_outbox(&mut self) -> usize {
        if !self.transport.state().is_running() || !self.transport.link_available() {
            return 0;
        }
        let mut sent = 0;
        while let Some(frame) = self.outbox.pop_front() {
            match self.transport.broadcast(&frame).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    if e.is_retryable() {
                        self.outbox.push_front(frame);
                    } else {
                        warn!(error = %e, "dropping queued frame");
                    }
                    break;
                }
            }
        }
        sent
    }

    pub fn queued_frames(&self) -> usize {
        self.outbox.len()
    }

    /// Drain the transport and return newly completed payloads
    pub async fn poll(&mut self) -> Vec<Vec<u8>> {
        let now = now_ms();
        let mut payloads = Vec::new();

        for event in self.transport.poll_events().await {
            match event {
                TransportEvent::FrameReceived { from, data, .. } => {
                    let fragment = match Fragment::decode(&data) {
                        Ok(fragment) => fragment,
                        Err(e) => {
                            trace!(%from, error = %e, "ignoring frame");
                            self.stats.malformed_frames += 1;
                            continue;
                        }
                    };
                    if self.seen.contains(&fragment.payload_id()) {
                        self.stats.duplicates_suppressed += 1;
                        continue;
                    }
                    if let Some(payload) = self.reassembler.accept(fragment, now) {
                        if !self.seen.insert(PayloadId::of(&payload)) {
                            self.stats.duplicates_suppressed += 1;
                            continue;
                        }
                        self.stats.payloads_received += 1;
                        for handler in &self.handlers {
                            handler(&payload);
                        }
                        payloads.push(payload);
                    }
                }
                TransportEvent::PeerHeard { address } => debug!(%address, "peer heard"),
                TransportEvent::Error { error } => warn!(%error, "transport error"),
            }
        }

        self.reassembler.expire(now);
        payloads
    }

    /// Read-only neighbour list for topology views
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.transport.reachable_peers()
    }

    pub fn stats(&self) -> MeshStats {
        self.stats.clone()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }
}
