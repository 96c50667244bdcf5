// Subscriptions - Push notifications of ledger changes
//
// Every ledger event is published on one broadcast channel. Subscribers
// either take the raw event stream or a per-account view of balance changes.

use crate::identity::NodeId;
use crate::ledger::BalanceChange;
use crate::sync::LedgerEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Fan-out point for ledger events
#[derive(Debug, Clone)]
pub struct SubscriptionHub {
    tx: broadcast::Sender<LedgerEvent>,
}

impl SubscriptionHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish one event; events with no listener are dropped
    pub fn publish(&self, event: LedgerEvent) {
        if self.tx.send(event).is_err() {
            trace!("ledger event had no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Every ledger event from now on
    pub fn subscribe_all(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }

    /// Balance changes of one account
    pub fn subscribe(&self, node_id: NodeId) -> BalanceSubscription {
        BalanceSubscription {
            node_id,
            rx: self.tx.subscribe(),
        }
    }

    /// Run `handler` on a background task for every balance change of `node_id`
    ///
    /// The task ends when the hub is dropped or the handle is aborted.
    pub fn on_balance_change<F>(&self, node_id: NodeId, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(BalanceChange) + Send + 'static,
    {
        let mut subscription = self.subscribe(node_id);
        tokio::spawn(async move {
            while let Some(change) = subscription.recv().await {
                handler(change);
            }
        })
    }
}

/// Receiver of balance changes for a single account
#[derive(Debug)]
pub struct BalanceSubscription {
    node_id: NodeId,
    rx: broadcast::Receiver<LedgerEvent>,
}

impl BalanceSubscription {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Next balance change, or None once the hub is gone
    ///
    /// A lagging subscriber skips the events it missed; the current balance
    /// can always be re-read from the node.
    pub async fn recv(&mut self) -> Option<BalanceChange> {
        loop {
            match self.rx.recv().await {
                Ok(LedgerEvent::BalanceChanged(change)) if change.node_id == self.node_id => {
                    return Some(change);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(node = %self.node_id.short(), missed, "balance subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next change already queued, without waiting
    pub fn try_recv(&mut self) -> Option<BalanceChange> {
        loop {
            match self.rx.try_recv() {
                Ok(LedgerEvent::BalanceChanged(change)) if change.node_id == self.node_id => {
                    return Some(change);
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
