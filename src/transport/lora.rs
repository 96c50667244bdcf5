// LoRa Transport Implementation
// Broadcast-only LoRa link with managed flooding, over a pluggable radio driver

use crate::clock::now_ms;
use crate::transport::dedup::SeenCache;
use crate::transport::{
    PeerAddress, Transport, TransportConfig, TransportError, TransportEvent, TransportState,
    TransportStats,
};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

// ============================================================================
// LORA MODULATION PARAMETERS
// ============================================================================

/// LoRa Spreading Factor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoraSpreadingFactor {
    #[default]
    SF7,
    SF8,
    SF9,
    SF10,
    SF11,
    SF12,
}

impl LoraSpreadingFactor {
    pub fn to_value(&self) -> u8 {
        match self {
            Self::SF7 => 7,
            Self::SF8 => 8,
            Self::SF9 => 9,
            Self::SF10 => 10,
            Self::SF11 => 11,
            Self::SF12 => 12,
        }
    }
}

/// LoRa Bandwidth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoraBandwidth {
    #[default]
    BW125, // 125 kHz
    BW250, // 250 kHz
    BW500, // 500 kHz
}

impl LoraBandwidth {
    pub fn to_hz(&self) -> u32 {
        match self {
            Self::BW125 => 125_000,
            Self::BW250 => 250_000,
            Self::BW500 => 500_000,
        }
    }
}

/// LoRa Coding Rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoraCodingRate {
    #[default]
    CR4_5, // 4/5
    CR4_6, // 4/6
    CR4_7, // 4/7
    CR4_8, // 4/8
}

impl LoraCodingRate {
    pub fn to_value(&self) -> u8 {
        match self {
            Self::CR4_5 => 5,
            Self::CR4_6 => 6,
            Self::CR4_7 => 7,
            Self::CR4_8 => 8,
        }
    }
}

/// LoRa Modulation parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraModulation {
    spreading_factor: LoraSpreadingFactor,
    bandwidth: LoraBandwidth,
    coding_rate: LoraCodingRate,
}

impl LoraModulation {
    pub fn new(
        spreading_factor: LoraSpreadingFactor,
        bandwidth: LoraBandwidth,
        coding_rate: LoraCodingRate,
    ) -> Self {
        Self {
            spreading_factor,
            bandwidth,
            coding_rate,
        }
    }

    pub fn spreading_factor(&self) -> LoraSpreadingFactor {
        self.spreading_factor
    }

    pub fn bandwidth(&self) -> LoraBandwidth {
        self.bandwidth
    }

    pub fn coding_rate(&self) -> LoraCodingRate {
        self.coding_rate
    }

    /// Data rate in bits per second: SF * (BW / 2^SF) * (4 / CR)
    pub fn data_rate_bps(&self) -> u32 {
        let sf = self.spreading_factor.to_value() as u32;
        let bw = self.bandwidth.to_hz();
        let cr = self.coding_rate.to_value() as u32;
        (sf * bw * 4) / ((1 << sf) * cr)
    }

    /// Approximate time on air for a packet of `payload_bytes`
    pub fn time_on_air_ms(&self, payload_bytes: usize) -> u32 {
        let sf = self.spreading_factor.to_value() as f64;
        let bw = self.bandwidth.to_hz() as f64;
        let cr = self.coding_rate.to_value() as f64;

        let symbol_duration = (2.0_f64.powf(sf)) / bw * 1000.0;
        let preamble_time = (8.0 + 4.25) * symbol_duration;

        let payload_bits = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0;
        let payload_symbols = 8.0 + (payload_bits / (4.0 * sf)).ceil().max(0.0) * cr;
        let payload_time = payload_symbols * symbol_duration;

        (preamble_time + payload_time) as u32
    }

    /// Largest packet the radio accepts at this spreading factor
    pub fn max_payload_size(&self) -> usize {
        match self.spreading_factor {
            LoraSpreadingFactor::SF7 | LoraSpreadingFactor::SF8 => 255,
            LoraSpreadingFactor::SF9 | LoraSpreadingFactor::SF10 => 222,
            LoraSpreadingFactor::SF11 => 109,
            LoraSpreadingFactor::SF12 => 51,
        }
    }
}

// ============================================================================
// LORA MESH HEADER
// ============================================================================

pub const MESH_HEADER_LEN: usize = 10;

const FLAG_BROADCAST: u8 = 0x01;
const FLAG_RELAYED: u8 = 0x02;

/// Flooding header prepended to every LoRa packet
///
/// `source` and `packet_id` identify the packet across rebroadcasts;
/// `hop_limit` is decremented by every relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraMeshHeader {
    source: u32,
    packet_id: u32,
    flags: u8,
    hop_limit: u8,
}

impl LoraMeshHeader {
    pub fn broadcast(source: u32, packet_id: u32, hop_limit: u8) -> Self {
        Self {
            source,
            packet_id,
            flags: FLAG_BROADCAST,
            hop_limit,
        }
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn packet_id(&self) -> u32 {
        self.packet_id
    }

    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    pub fn is_relayed(&self) -> bool {
        self.flags & FLAG_RELAYED != 0
    }

    /// Header for the next relay, or None when the hop budget is spent
    pub fn relayed(&self) -> Option<Self> {
        if self.hop_limit <= 1 {
            return None;
        }
        Some(Self {
            flags: self.flags | FLAG_RELAYED,
            hop_limit: self.hop_limit - 1,
            ..*self
        })
    }

    pub fn to_bytes(&self) -> [u8; MESH_HEADER_LEN] {
        let mut bytes = [0u8; MESH_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.source.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.packet_id.to_be_bytes());
        bytes[8] = self.flags;
        bytes[9] = self.hop_limit;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < MESH_HEADER_LEN {
            return Err(TransportError::MalformedFrame("mesh header too short".to_string()));
        }
        Ok(Self {
            source: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            packet_id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            flags: bytes[8],
            hop_limit: bytes[9],
        })
    }
}

// ============================================================================
// RADIO DRIVER
// ============================================================================

/// A packet as delivered by the radio, with signal quality
#[derive(Debug, Clone)]
pub struct RadioPacket {
    pub data: Vec<u8>,
    pub rssi: i16,
    pub snr: f32,
}

/// Hardware seam under [`LoraTransport`]
///
/// A real driver talks SPI to an SX127x/SX126x; the simulated medium in
/// this crate implements it in memory.
#[async_trait]
pub trait LoraRadio: Send {
    async fn transmit(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Next buffered packet, or None if nothing arrived (non-blocking)
    async fn receive(&mut self) -> Option<RadioPacket>;

    /// Number of radios currently in range, when the driver can tell
    fn in_range(&self) -> Option<usize> {
        None
    }
}

// ============================================================================
// LORA TRANSPORT CONFIG
// ============================================================================

/// Configuration for LoRa transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraTransportConfig {
    pub base: TransportConfig,
    /// Radio frequency in Hz
    pub frequency: u32,
    /// Local device number
    pub device_id: u32,
    pub spreading_factor: LoraSpreadingFactor,
    pub bandwidth: LoraBandwidth,
    pub coding_rate: LoraCodingRate,
    /// Transmit power in dBm
    pub tx_power_dbm: i8,
    /// Duty cycle percentage (regulatory); 100 disables the limit
    pub duty_cycle_percent: f32,
    /// Hops a packet may travel; 1 disables rebroadcast
    pub hop_limit: u8,
    /// Capacity of the (source, packet id) cache used for flood suppression
    pub seen_capacity: usize,
}

impl Default for LoraTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            frequency: 915_000_000, // US ISM band
            device_id: 0x0000_0001,
            spreading_factor: LoraSpreadingFactor::SF7,
            bandwidth: LoraBandwidth::BW125,
            coding_rate: LoraCodingRate::CR4_5,
            tx_power_dbm: 14,
            duty_cycle_percent: 100.0,
            hop_limit: 3,
            seen_capacity: 512,
        }
    }
}

impl LoraTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// EU868 preset: 1% duty cycle
    pub fn eu868() -> Self {
        Self {
            frequency: 868_100_000,
            duty_cycle_percent: 1.0,
            ..Self::default()
        }
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_frequency(mut self, freq: u32) -> Self {
        self.frequency = freq;
        self
    }

    pub fn with_device_id(mut self, id: u32) -> Self {
        self.device_id = id;
        self
    }

    pub fn with_spreading_factor(mut self, sf: LoraSpreadingFactor) -> Self {
        self.spreading_factor = sf;
        self
    }

    pub fn with_bandwidth(mut self, bw: LoraBandwidth) -> Self {
        self.bandwidth = bw;
        self
    }

    pub fn with_coding_rate(mut self, cr: LoraCodingRate) -> Self {
        self.coding_rate = cr;
        self
    }

    pub fn with_tx_power(mut self, power: i8) -> Self {
        self.tx_power_dbm = power.clamp(2, 20);
        self
    }

    pub fn with_duty_cycle_percent(mut self, percent: f32) -> Self {
        self.duty_cycle_percent = percent;
        self
    }

    pub fn with_hop_limit(mut self, hops: u8) -> Self {
        self.hop_limit = hops.max(1);
        self
    }

    pub fn modulation(&self) -> LoraModulation {
        LoraModulation::new(self.spreading_factor, self.bandwidth, self.coding_rate)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        self.base.validate()?;
        if !(0.0..=100.0).contains(&self.duty_cycle_percent) || self.duty_cycle_percent == 0.0 {
            return Err(TransportError::InvalidConfig(
                "duty_cycle_percent must be in (0, 100]".to_string(),
            ));
        }
        if self.device_id == PeerAddress::BROADCAST_DEVICE {
            return Err(TransportError::InvalidConfig(
                "device_id is the broadcast address".to_string(),
            ));
        }
        if self.seen_capacity == 0 {
            return Err(TransportError::InvalidConfig("seen_capacity cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// LORA TRANSPORT
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct HeardPeer {
    last_heard_ms: u64,
    rssi: i16,
}

/// LoRa transport implementation
pub struct LoraTransport<R: LoraRadio> {
    config: LoraTransportConfig,
    radio: R,
    state: TransportState,
    heard: HashMap<u32, HeardPeer>,
    seen: SeenCache<(u32, u32)>,
    stats: TransportStats,
    last_rssi: Option<i16>,
    last_snr: Option<f32>,
    /// Earliest time the duty cycle allows the next transmission
    next_tx_allowed_ms: u64,
}

impl<R: LoraRadio> LoraTransport<R> {
    pub fn new(config: LoraTransportConfig, radio: R) -> Self {
        let seen = SeenCache::new(config.seen_capacity.max(1));
        Self {
            config,
            radio,
            state: TransportState::Stopped,
            heard: HashMap::new(),
            seen,
            stats: TransportStats::default(),
            last_rssi: None,
            last_snr: None,
            next_tx_allowed_ms: 0,
        }
    }

    pub fn config(&self) -> &LoraTransportConfig {
        &self.config
    }

    /// Time until next transmit is allowed (duty cycle)
    pub fn time_until_transmit_ms(&self) -> u64 {
        self.next_tx_allowed_ms.saturating_sub(now_ms())
    }

    pub fn can_transmit(&self) -> bool {
        self.time_until_transmit_ms() == 0
    }

    pub fn last_rssi(&self) -> Option<i16> {
        self.last_rssi
    }

    pub fn last_snr(&self) -> Option<f32> {
        self.last_snr
    }

    async fn transmit(
        &mut self,
        header: LoraMeshHeader,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let wait_ms = self.time_until_transmit_ms();
        if wait_ms > 0 {
            return Err(TransportError::DutyCycleExceeded { wait_ms });
        }

        let mut packet = Vec::with_capacity(MESH_HEADER_LEN + data.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(data);

        if let Err(e) = self.radio.transmit(&packet).await {
            self.stats.errors += 1;
            return Err(e);
        }

        let air_ms = u64::from(self.config.modulation().time_on_air_ms(packet.len()));
        let duty = f64::from(self.config.duty_cycle_percent);
        let off_ms = (air_ms as f64 * (100.0 / duty - 1.0)) as u64;
        self.next_tx_allowed_ms = now_ms() + off_ms;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += packet.len() as u64;
        Ok(packet.len())
    }

    fn record_heard(&mut self, source: u32, rssi: i16, now: u64, events: &mut Vec<TransportEvent>) {
        let timeout_ms = u64::from(self.config.base.peer_timeout_secs) * 1000;
        let fresh = self
            .heard
            .get(&source)
            .map_or(true, |p| now.saturating_sub(p.last_heard_ms) > timeout_ms);
        self.heard.insert(
            source,
            HeardPeer {
                last_heard_ms: now,
                rssi,
            },
        );
        if fresh {
            events.push(TransportEvent::PeerHeard {
                address: PeerAddress::lora(source),
            });
        }
    }

    /// Signal strength of the last packet heard from `address`
    pub fn peer_rssi(&self, address: &PeerAddress) -> Option<i16> {
        self.heard.get(&address.device_id()).map(|p| p.rssi)
    }
}

#[async_trait]
impl<R: LoraRadio> Transport for LoraTransport<R> {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.state.is_running() {
            return Err(TransportError::AlreadyRunning);
        }
        self.config.validate()?;
        self.state = TransportState::Starting;
        self.state = TransportState::Running;
        debug!(address = %PeerAddress::lora(self.config.device_id), "LoRa transport started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if !self.state.is_running() && !matches!(self.state, TransportState::Stopped) {
            return Err(TransportError::NotRunning);
        }
        self.state = TransportState::Stopping;
        self.heard.clear();
        self.state = TransportState::Stopped;
        Ok(())
    }

    async fn broadcast(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        if !self.state.is_running() {
            return Err(TransportError::NotRunning);
        }
        let max = self.max_frame_size();
        if frame.len() > max {
            return Err(TransportError::PayloadTooLarge { size: frame.len(), max });
        }

        let packet_id: u32 = rand::thread_rng().gen();
        let header =
            LoraMeshHeader::broadcast(self.config.device_id, packet_id, self.config.hop_limit);
        self.seen.insert((self.config.device_id, packet_id));
        self.transmit(header, frame).await
    }

    async fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if !self.state.is_running() {
            return events;
        }

        let now = now_ms();
        let mut relays = Vec::new();
        for _ in 0..self.config.base.receive_buffer {
            let Some(packet) = self.radio.receive().await else {
                break;
            };
            let header = match LoraMeshHeader::from_bytes(&packet.data) {
                Ok(header) => header,
                Err(_) => {
                    self.stats.frames_dropped += 1;
                    continue;
                }
            };
            if header.source() == self.config.device_id
                || !self.seen.insert((header.source(), header.packet_id()))
            {
                self.stats.frames_dropped += 1;
                continue;
            }

            self.last_rssi = Some(packet.rssi);
            self.last_snr = Some(packet.snr);
            self.stats.frames_received += 1;
            self.stats.bytes_received += packet.data.len() as u64;
            self.record_heard(header.source(), packet.rssi, now, &mut events);

            let data = packet.data[MESH_HEADER_LEN..].to_vec();
            if let Some(next) = header.relayed() {
                relays.push((next, data.clone()));
            }
            events.push(TransportEvent::FrameReceived {
                from: PeerAddress::lora(header.source()),
                data,
                rssi: Some(packet.rssi),
                snr: Some(packet.snr),
            });
        }

        for (header, data) in relays {
            match self.transmit(header, &data).await {
                Ok(_) => {
                    trace!(source = header.source(), hops_left = header.hop_limit(), "rebroadcast")
                }
                Err(e) => {
                    trace!(error = %e, "rebroadcast skipped");
                    self.stats.frames_dropped += 1;
                }
            }
        }
        events
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn local_address(&self) -> Option<PeerAddress> {
        self.state
            .is_running()
            .then(|| PeerAddress::lora(self.config.device_id))
    }

    fn max_frame_size(&self) -> usize {
        self.config
            .base
            .mtu
            .min(self.config.modulation().max_payload_size())
            .saturating_sub(MESH_HEADER_LEN)
    }

    fn reachable_peers(&self) -> Vec<PeerAddress> {
        let now = now_ms();
        let timeout_ms = u64::from(self.config.base.peer_timeout_secs) * 1000;
        let mut peers: Vec<PeerAddress> = self
            .heard
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_heard_ms) <= timeout_ms)
            .map(|(id, _)| PeerAddress::lora(*id))
            .collect();
        peers.sort();
        peers
    }

    fn link_available(&self) -> bool {
        self.radio.in_range().map_or(true, |n| n > 0)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
