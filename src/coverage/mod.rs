// Coverage module - PROOF OF RELAY
// Witness attestations, relay proofs, the reward schedule and the accountant
// that turns proofs into RelayReward transactions

mod accountant;
mod proof;
mod schedule;

pub use accountant::{CoverageAccountant, CoverageError};
pub use proof::{count_valid_witnesses, CoverageWindow, RelayProof, WitnessAttestation};
pub use schedule::{CoverageConfig, RewardSchedule};
