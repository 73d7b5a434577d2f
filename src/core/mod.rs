// Core data structures: hashes, keys, transactions and blocks

mod types;
mod hash;
pub mod serialize;
pub mod crypto;
pub mod merkle;
mod transaction;
mod block;

pub use types::*;
pub use hash::*;
pub use serialize::Serializable;
pub use crypto::{Address, CryptoError, KeyPair, PublicKey, Signature, derive_address};
pub use merkle::MerkleProof;
pub use transaction::*;
pub use block::*;
