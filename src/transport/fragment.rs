// Application-level fragmentation for payloads larger than one radio frame
//
// Frame layout (12-byte header):
//   [0]      magic 0x47
//   [1]      version
//   [2..10]  payload id: first 8 bytes of sha256(payload)
//   [10]     fragment index
//   [11]     fragment count
//   [12..]   chunk

use crate::transport::TransportError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

pub const FRAGMENT_HEADER_LEN: usize = 12;
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

const FRAGMENT_MAGIC: u8 = 0x47;
const FRAGMENT_VERSION: u8 = 1;

/// Content-derived id of a whole payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId([u8; 8]);

impl PayloadId {
    pub fn of(payload: &[u8]) -> Self {
        let hash = Sha256::digest(payload);
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash[..8]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadId({})", hex::encode(self.0))
    }
}

/// One frame-sized piece of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    payload_id: PayloadId,
    index: u8,
    count: u8,
    chunk: Vec<u8>,
}

impl Fragment {
    pub fn payload_id(&self) -> PayloadId {
        self.payload_id
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn chunk(&self) -> &[u8] {
        &self.chunk
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.chunk.len());
        bytes.push(FRAGMENT_MAGIC);
        bytes.push(FRAGMENT_VERSION);
        bytes.extend_from_slice(self.payload_id.as_bytes());
        bytes.push(self.index);
        bytes.push(self.count);
        bytes.extend_from_slice(&self.chunk);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(TransportError::MalformedFrame("fragment header too short".to_string()));
        }
        if bytes[0] != FRAGMENT_MAGIC || bytes[1] != FRAGMENT_VERSION {
            return Err(TransportError::MalformedFrame("not a fragment".to_string()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[2..10]);
        let (index, count) = (bytes[10], bytes[11]);
        if count == 0 || index >= count {
            return Err(TransportError::MalformedFrame(format!("fragment {index}/{count}")));
        }
        Ok(Self {
            payload_id: PayloadId(id),
            index,
            count,
            chunk: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Splits payloads into frames no larger than the link MTU
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    frame_size: usize,
}

impl Fragmenter {
    pub fn new(frame_size: usize) -> Result<Self, TransportError> {
        if frame_size <= FRAGMENT_HEADER_LEN {
            return Err(TransportError::InvalidConfig(format!(
                "frame size {frame_size} leaves no room for data"
            )));
        }
        Ok(Self { frame_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.frame_size - FRAGMENT_HEADER_LEN
    }

    /// Largest payload that fits in [`MAX_FRAGMENTS`] frames
    pub fn max_payload(&self) -> usize {
        self.chunk_size() * MAX_FRAGMENTS
    }

    pub fn split(&self, payload: &[u8]) -> Result<Vec<Fragment>, TransportError> {
        if payload.len() > self.max_payload() {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload(),
            });
        }
        let payload_id = PayloadId::of(payload);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(self.chunk_size()).collect()
        };
        let count = chunks.len() as u8;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Fragment {
                payload_id,
                index: index as u8,
                count,
                chunk: chunk.to_vec(),
            })
            .collect())
    }
}

#[derive(Debug)]
struct Partial {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen_ms: u64,
}

/// Collects fragments until a payload is complete
///
/// Partial payloads are dropped after `timeout_ms`, and at most
/// `max_partials` are held at once (oldest evicted).
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<PayloadId, Partial>,
    timeout_ms: u64,
    max_partials: usize,
    dropped: u64,
}

impl Reassembler {
    pub fn new(timeout_ms: u64, max_partials: usize) -> Self {
        Self {
            partials: HashMap::new(),
            timeout_ms,
            max_partials: max_partials.max(1),
            dropped: 0,
        }
    }

    /// Add a fragment; returns the payload once all fragments are in and
    /// the content hash matches the id
    pub fn accept(&mut self, fragment: Fragment, now_ms: u64) -> Option<Vec<u8>> {
        let id = fragment.payload_id;
        if fragment.count == 1 {
            return self.verify(id, fragment.chunk);
        }

        if !self.partials.contains_key(&id) && self.partials.len() >= self.max_partials {
            self.evict_oldest();
        }
        let partial = self.partials.entry(id).or_insert_with(|| Partial {
            chunks: vec![None; fragment.count as usize],
            received: 0,
            first_seen_ms: now_ms,
        });
        if partial.chunks.len() != fragment.count as usize {
            debug!(payload = ?id, "fragment count mismatch, dropping partial");
            self.partials.remove(&id);
            self.dropped += 1;
            return None;
        }
        let slot = &mut partial.chunks[fragment.index as usize];
        if slot.is_none() {
            *slot = Some(fragment.chunk);
            partial.received += 1;
        }
        if partial.received < partial.chunks.len() {
            return None;
        }

        let partial = self.partials.remove(&id)?;
        let payload: Vec<u8> = partial.chunks.into_iter().flatten().flatten().collect();
        self.verify(id, payload)
    }

    fn verify(&mut self, id: PayloadId, payload: Vec<u8>) -> Option<Vec<u8>> {
        if PayloadId::of(&payload) != id {
            self.dropped += 1;
            return None;
        }
        Some(payload)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, p)| p.first_seen_ms)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.partials.remove(&id);
            self.dropped += 1;
        }
    }

    /// Drop partials older than the timeout; returns how many were dropped
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let before = self.partials.len();
        let timeout = self.timeout_ms;
        self.partials
            .retain(|_, p| now_ms.saturating_sub(p.first_seen_ms) <= timeout);
        let expired = before - self.partials.len();
        self.dropped += expired as u64;
        expired
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Partials discarded (timeout, eviction or hash mismatch)
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
