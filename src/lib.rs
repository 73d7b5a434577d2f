// powchain - minimal peer-to-peer proof-of-work blockchain node

pub mod config;
pub mod core;
pub mod consensus;
pub mod chain;
pub mod mining;
pub mod storage;
pub mod network;
pub mod wallet;
pub mod cli;

// Re-exports for convenience
pub use core::{Address, Block, BlockHeader, Hash256, KeyPair, Transaction};
pub use consensus::{BlockError, ConsensusError, Target, ValidationError};
pub use chain::{AcceptResult, BlockId, ChainBuilder, ChainHandle};
pub use storage::{BlockchainDB, ChainStore, PersistenceError};
pub use network::{Message, Node, PeerInfo, Protocol};
pub use config::{ConsensusParams, NodeConfig};
