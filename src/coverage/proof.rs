// Proof - Relay evidence submitted for Proof-of-Coverage credit
//
// A relay proof says "node R forwarded the packet with hash H during window W"
// and carries signed attestations from witnesses that heard it.

use crate::identity::{Keypair, NodeId, PublicKey, Signature, Signer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

const ATTESTATION_DOMAIN: &[u8] = b"geohop-witness-v1";

// ============================================================================
// COVERAGE WINDOW
// ============================================================================

/// Time range (wall-clock millis, inclusive) in which a relay was observed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverageWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl CoverageWindow {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, ms: u64) -> bool {
        self.start_ms <= ms && ms <= self.end_ms
    }

    /// Zero for an inverted window
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn is_ordered(&self) -> bool {
        self.start_ms <= self.end_ms
    }
}

// ============================================================================
// WITNESS ATTESTATION
// ============================================================================

/// A witness's signed statement that it heard `relayer` forward a packet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessAttestation {
    witness: PublicKey,
    observed_at_ms: u64,
    signature: Signature,
}

impl WitnessAttestation {
    fn signing_bytes(packet_hash: &[u8; 32], relayer: &NodeId, observed_at_ms: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ATTESTATION_DOMAIN.len() + 72);
        bytes.extend_from_slice(ATTESTATION_DOMAIN);
        bytes.extend_from_slice(packet_hash);
        bytes.extend_from_slice(relayer.as_bytes());
        bytes.extend_from_slice(&observed_at_ms.to_le_bytes());
        bytes
    }

    /// Attest as `witness` that `relayer` forwarded `packet_hash`
    pub fn sign(
        witness: &Keypair,
        packet_hash: &[u8; 32],
        relayer: &NodeId,
        observed_at_ms: u64,
    ) -> Self {
        let message = Self::signing_bytes(packet_hash, relayer, observed_at_ms);
        Self {
            witness: witness.public_key(),
            observed_at_ms,
            signature: Signer::sign(witness, &message),
        }
    }

    pub fn witness(&self) -> &PublicKey {
        &self.witness
    }

    pub fn witness_id(&self) -> NodeId {
        NodeId::from_public_key(&self.witness)
    }

    pub fn observed_at_ms(&self) -> u64 {
        self.observed_at_ms
    }

    pub fn verify(&self, packet_hash: &[u8; 32], relayer: &NodeId) -> bool {
        let message = Self::signing_bytes(packet_hash, relayer, self.observed_at_ms);
        Signer::verify(&self.witness, &message, &self.signature)
    }

    /// Append the fixed-width canonical encoding (used inside txIds)
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.witness.as_bytes());
        out.extend_from_slice(&self.observed_at_ms.to_le_bytes());
        out.extend_from_slice(self.signature.as_bytes());
    }
}

/// Number of distinct witnesses with a valid attestation inside `window`
///
/// The relayer's own attestation never counts.
pub fn count_valid_witnesses(
    relayer: &NodeId,
    packet_hash: &[u8; 32],
    window: &CoverageWindow,
    attestations: &[WitnessAttestation],
) -> usize {
    let mut witnesses = BTreeSet::new();
    for attestation in attestations {
        let witness = attestation.witness_id();
        if &witness == relayer || witnesses.contains(&witness) {
            continue;
        }
        if window.contains(attestation.observed_at_ms) && attestation.verify(packet_hash, relayer) {
            witnesses.insert(witness);
        }
    }
    witnesses.len()
}

// ============================================================================
// RELAY PROOF
// ============================================================================

/// Input to coverage accounting; not ledger state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProof {
    pub relayer: NodeId,
    pub packet_hash: [u8; 32],
    pub window: CoverageWindow,
    pub attestations: Vec<WitnessAttestation>,
}

impl RelayProof {
    pub fn new(relayer: NodeId, packet_hash: [u8; 32], window: CoverageWindow) -> Self {
        Self {
            relayer,
            packet_hash,
            window,
            attestations: Vec::new(),
        }
    }

    pub fn with_attestation(mut self, attestation: WitnessAttestation) -> Self {
        self.attestations.push(attestation);
        self
    }

    /// Distinct nodes that attested, valid or not
    pub fn witnesses(&self) -> BTreeSet<NodeId> {
        self.attestations.iter().map(WitnessAttestation::witness_id).collect()
    }

    pub fn valid_witnesses(&self) -> usize {
        count_valid_witnesses(&self.relayer, &self.packet_hash, &self.window, &self.attestations)
    }

    /// Hash of the relayed packet a node observed, as used in proofs
    pub fn packet_hash_of(packet: &[u8]) -> [u8; 32] {
        Sha256::digest(packet).into()
    }
}
