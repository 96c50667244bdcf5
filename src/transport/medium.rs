// In-memory radio medium for simulations and tests
//
// Every attached radio hears every other radio unless the pair is
// partitioned or the packet is lost to the configured loss rate.

use crate::transport::lora::{LoraRadio, RadioPacket};
use crate::transport::TransportError;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const MAILBOX_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct MediumState {
    mailboxes: HashMap<u32, VecDeque<RadioPacket>>,
    /// Unordered pairs that cannot hear each other
    blocked: BTreeSet<(u32, u32)>,
    loss_percent: u8,
    delivered: u64,
    lost: u64,
}

impl MediumState {
    fn can_hear(&self, a: u32, b: u32) -> bool {
        a != b && !self.blocked.contains(&pair(a, b))
    }
}

fn pair(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared broadcast medium
#[derive(Debug, Clone, Default)]
pub struct RadioMedium {
    state: Arc<Mutex<MediumState>>,
}

impl RadioMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        // A poisoned medium only means a test thread panicked mid-delivery.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a radio with the given device number
    pub fn attach(&self, device_id: u32) -> SimulatedRadio {
        self.lock().mailboxes.entry(device_id).or_default();
        SimulatedRadio {
            device_id,
            medium: self.clone(),
        }
    }

    pub fn detach(&self, device_id: u32) {
        self.lock().mailboxes.remove(&device_id);
    }

    /// Percentage of deliveries silently dropped
    pub fn set_loss_percent(&self, percent: u8) {
        self.lock().loss_percent = percent.min(100);
    }

    /// Stop `a` and `b` from hearing each other
    pub fn partition(&self, a: u32, b: u32) {
        self.lock().blocked.insert(pair(a, b));
    }

    pub fn heal(&self, a: u32, b: u32) {
        self.lock().blocked.remove(&pair(a, b));
    }

    /// Cut `device` off from every other radio
    pub fn isolate(&self, device: u32) {
        let mut state = self.lock();
        let others: Vec<u32> = state.mailboxes.keys().copied().filter(|d| *d != device).collect();
        for other in others {
            state.blocked.insert(pair(device, other));
        }
    }

    pub fn heal_all(&self) {
        self.lock().blocked.clear();
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn lost(&self) -> u64 {
        self.lock().lost
    }
}

/// A radio attached to a [`RadioMedium`]
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    device_id: u32,
    medium: RadioMedium,
}

impl SimulatedRadio {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

#[async_trait]
impl LoraRadio for SimulatedRadio {
    async fn transmit(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let mut state = self.medium.lock();
        if !state.mailboxes.contains_key(&self.device_id) {
            return Err(TransportError::HardwareUnavailable);
        }
        let listeners: Vec<u32> = state
            .mailboxes
            .keys()
            .copied()
            .filter(|d| state.can_hear(self.device_id, *d))
            .collect();
        let loss = state.loss_percent;
        let mut rng = rand::thread_rng();
        for listener in listeners {
            if loss > 0 && rng.gen_range(0..100) < loss {
                state.lost += 1;
                continue;
            }
            if let Some(mailbox) = state.mailboxes.get_mut(&listener) {
                if mailbox.len() >= MAILBOX_CAPACITY {
                    mailbox.pop_front();
                }
                mailbox.push_back(RadioPacket {
                    data: packet.to_vec(),
                    rssi: -80,
                    snr: 9.5,
                });
                state.delivered += 1;
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Option<RadioPacket> {
        self.medium
            .lock()
            .mailboxes
            .get_mut(&self.device_id)
            .and_then(VecDeque::pop_front)
    }

    fn in_range(&self) -> Option<usize> {
        let state = self.medium.lock();
        Some(
            state
                .mailboxes
                .keys()
                .filter(|d| state.can_hear(self.device_id, **d))
                .count(),
        )
    }
}
