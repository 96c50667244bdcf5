// API module - THE FRONT DOOR
// Ledger node facade for wallets and admin tools, balance subscriptions,
// and the runtime that connects a node to the mesh

mod node;
mod runtime;
mod subscription;

pub use node::{ApiError, LedgerNode, LedgerNodeConfig, NodeStats, PeerSnapshot, ProofReceipt};
pub use runtime::{NodeRuntime, RuntimeConfig, ShutdownHandle, StepReport};
pub use subscription::{BalanceSubscription, SubscriptionHub};
