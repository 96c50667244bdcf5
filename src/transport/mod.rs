// Transport module - THE WIRE (abstract)
// Broadcast transport trait, LoRa link, simulated radio medium, and the mesh
// adapter that fragments, reassembles and de-duplicates payloads

mod dedup;
mod fragment;
mod lora;
mod medium;
mod mesh;
mod traits;

pub use traits::{
    // Core trait
    Transport,
    // Configuration
    TransportConfig,
    // Address types
    PeerAddress,
    // Events and errors
    TransportEvent, TransportError, TransportState,
    // Statistics
    TransportStats,
};

pub use dedup::SeenCache;
pub use fragment::{
    Fragment, Fragmenter, PayloadId, Reassembler, FRAGMENT_HEADER_LEN, MAX_FRAGMENTS,
};

pub use lora::{
    LoraTransport, LoraTransportConfig,
    LoraModulation, LoraSpreadingFactor, LoraBandwidth, LoraCodingRate,
    LoraMeshHeader, LoraRadio, RadioPacket, MESH_HEADER_LEN,
};

pub use medium::{RadioMedium, SimulatedRadio};
pub use mesh::{BroadcastOutcome, MeshAdapter, MeshAdapterConfig, MeshStats, ReceiveHandler};
