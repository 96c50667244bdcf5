// Identity module - WHO IS SPEAKING
// Ed25519 keypairs, signatures, and the public-key-derived NodeId

mod keypair;
mod node_id;
mod signer;

pub use keypair::{Keypair, KeypairError, PublicKey, SecretKey};
pub use node_id::{NodeId, NodeIdError};
pub use signer::{Signature, SignatureError, Signer};
