// GeoHop - Ledger and mesh-gossip core
//
// A wallet ledger that settles over LoRa mesh radio with no central server:
// - identity: ed25519 keys and node ids
// - ledger: transactions, the account store and the transaction log
// - storage: durable records behind a backend trait
// - transport: fragmentation and duplicate suppression over a radio link
// - sync: digests, range repair and deterministic conflict resolution
// - coverage: relay proofs and the reward schedule
// - api: the node facade, subscriptions and the background runtime

pub mod api;
pub mod clock;
pub mod config;
pub mod coverage;
pub mod identity;
pub mod ledger;
pub mod storage;
pub mod sync;
pub mod transport;

pub use api::{ApiError, LedgerNode, LedgerNodeConfig, NodeRuntime};
pub use config::{ConfigError, NodeConfig};
pub use identity::{Keypair, NodeId};
pub use ledger::{Amount, Transaction, TxId};
