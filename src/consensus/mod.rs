// Consensus rules: proof of work, difficulty and validation

pub mod pow;
pub mod difficulty;
pub mod validation;

pub use pow::{CancelToken, MiningResult, ProofOfWork, SearchOutcome, Target};
pub use validation::{BlockError, ConsensusError, ValidationError};
