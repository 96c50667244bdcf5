// Sync module - HOW NODES AGREE
// Wire protocol, log digests, peer tracking, slot reconciliation and the
// gossip engine that ties them to the mesh

mod digest;
mod gossip;
mod peer;
mod protocol;
mod reconcile;

pub use digest::{DigestGap, LogDigest, StreamSummary, ROLLING_HASH_LEN};
pub use gossip::{GossipConfig, GossipEngine, GossipEvent, GossipStats, Inbound};
pub use peer::{PeerError, PeerInfo, PeerRegistry, PeerState, PeerStats};
pub use protocol::{
    Message, MessageType, ProtocolError, RangeRequest, RelayProofAnnouncement, SeqRange,
    TransactionBatch, TxAnnouncement, PROTOCOL_VERSION,
};
pub use reconcile::{
    IngestOutcome, LedgerEvent, ReconcileConfig, ReconcileError, ReconcileStats,
    ReconciliationEngine,
};
