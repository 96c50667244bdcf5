// Node Runtime - Background loop between a ledger node and the mesh
//
// Each pass polls the mesh for completed payloads, feeds them to the node,
// broadcasts whatever the node queued, and retries frames left in the mesh
// outbox. A separate timer drives the gossip cycle.

use crate::api::LedgerNode;
use crate::sync::Message;
use crate::transport::{BroadcastOutcome, MeshAdapter, MeshStats, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How often the mesh is polled for frames
    pub poll_interval_ms: u64,
    /// Digest broadcast period
    pub gossip_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            gossip_interval_ms: 30_000,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_gossip_interval(mut self, ms: u64) -> Self {
        self.gossip_interval_ms = ms;
        self
    }
}

/// What one runtime pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub payloads_received: usize,
    pub messages_sent: usize,
    pub frames_flushed: usize,
}

impl StepReport {
    pub fn is_idle(&self) -> bool {
        self.payloads_received == 0 && self.messages_sent == 0 && self.frames_flushed == 0
    }
}

/// Stops a running [`NodeRuntime`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Drives one [`LedgerNode`] over one mesh adapter
pub struct NodeRuntime<T: Transport> {
    node: Arc<LedgerNode>,
    mesh: MeshAdapter<T>,
    outbound: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
    config: RuntimeConfig,
}

impl<T: Transport> NodeRuntime<T> {
    pub fn new(
        node: Arc<LedgerNode>,
        mesh: MeshAdapter<T>,
        outbound: mpsc::Receiver<Message>,
        config: RuntimeConfig,
    ) -> (Self, ShutdownHandle) {
        let (tx, shutdown) = watch::channel(false);
        (
            Self {
                node,
                mesh,
                outbound,
                shutdown,
                config,
            },
            ShutdownHandle { tx: Arc::new(tx) },
        )
    }

    pub fn node(&self) -> &Arc<LedgerNode> {
        &self.node
    }

    pub fn mesh(&self) -> &MeshAdapter<T> {
        &self.mesh
    }

    pub fn mesh_stats(&self) -> MeshStats {
        self.mesh.stats()
    }

    pub async fn start(&mut self) -> Result<(), TransportError> {
        self.mesh.start().await
    }

    /// Run until the shutdown handle fires, then flush and stop the mesh
    pub async fn run(mut self) -> Result<(), TransportError> {
        if !self.mesh.transport().state().is_running() {
            self.mesh.start().await?;
        }
        info!(node = %self.node.node_id().short(), "runtime started");

        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gossip = interval(Duration::from_millis(self.config.gossip_interval_ms.max(1)));
        gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = gossip.tick() => {
                    self.node.tick().await;
                    self.send_queued().await;
                }
                _ = poll.tick() => {
                    self.step().await;
                }
                Some(msg) = self.outbound.recv() => {
                    self.send(msg).await;
                }
            }
        }

        if let Err(e) = self.node.flush().await {
            warn!(error = %e, "final flush failed");
        }
        self.mesh.stop().await?;
        info!(node = %self.node.node_id().short(), "runtime stopped");
        Ok(())
    }

    /// One pass: receive, process, broadcast
    pub async fn step(&mut self) -> StepReport {
        let payloads = self.mesh.poll().await;
        let payloads_received = payloads.len();
        for payload in payloads {
            if let Err(e) = self.node.handle_payload(&payload).await {
                trace!(error = %e, "dropping payload");
            }
        }
        let messages_sent = self.send_queued().await;
        let frames_flushed = self.mesh.flush_outbox().await;
        StepReport {
            payloads_received,
            messages_sent,
            frames_flushed,
        }
    }

    /// Run the gossip cycle now and broadcast its digest
    pub async fn gossip(&mut self) -> usize {
        self.node.tick().await;
        self.send_queued().await
    }

    async fn send_queued(&mut self) -> usize {
        let mut sent = 0;
        while let Ok(msg) = self.outbound.try_recv() {
            if self.send(msg).await {
                sent += 1;
            }
        }
        sent
    }

    async fn send(&mut self, msg: Message) -> bool {
        let kind = msg.message_type();
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(?kind, error = %e, "failed to encode message");
                return false;
            }
        };
        match self.mesh.broadcast(&bytes).await {
            Ok(BroadcastOutcome::Sent { fragments }) => {
                trace!(?kind, fragments, "broadcast");
                true
            }
            Ok(BroadcastOutcome::Queued { fragments }) => {
                debug!(?kind, fragments, "no link, frames queued");
                true
            }
            Err(e) => {
                warn!(?kind, error = %e, "broadcast failed");
                false
            }
        }
    }
}
