// Transport Traits and Core Types
// Defines the abstract broadcast Transport trait and the types shared by the
// radio implementations and the mesh adapter

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Base configuration for all transport types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame the link carries, header included
    pub mtu: usize,
    /// How long a heard peer counts as reachable, in seconds
    pub peer_timeout_secs: u32,
    /// Bound on frames buffered between polls
    pub receive_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mtu: 200,
            peer_timeout_secs: 300,
            receive_buffer: 256,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_peer_timeout(mut self, secs: u32) -> Self {
        self.peer_timeout_secs = secs;
        self
    }

    pub fn with_receive_buffer(mut self, frames: usize) -> Self {
        self.receive_buffer = frames;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.mtu < 32 {
            return Err(TransportError::InvalidConfig("mtu must be at least 32 bytes".to_string()));
        }
        if self.receive_buffer == 0 {
            return Err(TransportError::InvalidConfig("receive_buffer cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// PEER ADDRESS
// ============================================================================

/// Link-layer address of a radio neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerAddress {
    /// LoRa device number (Meshtastic-style 32-bit node number)
    Lora { device_id: u32 },
}

impl PeerAddress {
    pub const BROADCAST_DEVICE: u32 = 0xFFFF_FFFF;

    pub fn lora(device_id: u32) -> Self {
        Self::Lora { device_id }
    }

    pub fn lora_broadcast() -> Self {
        Self::Lora {
            device_id: Self::BROADCAST_DEVICE,
        }
    }

    pub fn device_id(&self) -> u32 {
        match self {
            Self::Lora { device_id } => *device_id,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.device_id() == Self::BROADCAST_DEVICE
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lora { device_id } => write!(f, "lora://!{:08x}", device_id),
        }
    }
}

// ============================================================================
// TRANSPORT STATE
// ============================================================================

/// State of the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl TransportState {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: &TransportState) -> bool {
        matches!(
            (self, target),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Error(_))
                | (Self::Running, Self::Stopping)
                | (Self::Running, Self::Error(_))
                | (Self::Stopping, Self::Stopped)
                | (Self::Error(_), Self::Stopped)
                | (Self::Error(_), Self::Starting)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events emitted by the transport layer
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame arrived from a neighbour
    FrameReceived {
        from: PeerAddress,
        data: Vec<u8>,
        rssi: Option<i16>,
        snr: Option<f32>,
    },

    /// A neighbour was heard for the first time (or again after timing out)
    PeerHeard { address: PeerAddress },

    /// Error occurred
    Error { error: TransportError },
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport not running")]
    NotRunning,

    #[error("Transport already running")]
    AlreadyRunning,

    #[error("Invalid state")]
    InvalidState,

    #[error("Hardware unavailable")]
    HardwareUnavailable,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// No neighbour in radio range; the payload was queued
    #[error("Transport unavailable: no reachable peers")]
    Unavailable,

    #[error("LoRa CRC mismatch")]
    LoraCrcMismatch,

    #[error("LoRa channel busy")]
    LoraChannelBusy,

    #[error("Duty cycle exceeded, retry in {wait_ms} ms")]
    DutyCycleExceeded { wait_ms: u64 },
}

impl TransportError {
    /// Check if the operation can be retried on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SendFailed(_)
                | Self::Unavailable
                | Self::LoraChannelBusy
                | Self::DutyCycleExceeded { .. }
        )
    }
}

// ============================================================================
// TRANSPORT STATISTICS
// ============================================================================

/// Statistics for transport operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Frames discarded as malformed, echoed or over budget
    pub frames_dropped: u64,
    pub errors: u64,
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Abstract broadcast transport
///
/// Frames are opaque and at most [`Transport::max_frame_size`] bytes. There
/// is no addressing or acknowledgement: every frame goes to whoever is in
/// range.
#[async_trait]
pub trait Transport: Send {
    async fn start(&mut self) -> Result<(), TransportError>;

    async fn stop(&mut self) -> Result<(), TransportError>;

    /// Broadcast one frame; returns the number of bytes put on air
    async fn broadcast(&mut self, frame: &[u8]) -> Result<usize, TransportError>;

    /// Drain received frames and link events (non-blocking)
    async fn poll_events(&mut self) -> Vec<TransportEvent>;

    fn state(&self) -> &TransportState;

    fn local_address(&self) -> Option<PeerAddress>;

    fn max_frame_size(&self) -> usize;

    /// Neighbours heard within the peer timeout
    fn reachable_peers(&self) -> Vec<PeerAddress>;

    /// False when the link knows nobody can hear a broadcast right now
    fn link_available(&self) -> bool {
        true
    }

    fn stats(&self) -> TransportStats;
}
