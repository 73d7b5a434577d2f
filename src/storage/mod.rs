// Storage layer for accepted blocks

mod blockchain_db;

pub use blockchain_db::BlockchainDB;

use crate::core::{Block, Hash256};
use std::fmt;
use std::sync::Arc;

/// Failure to read or write durable state. The node stops on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceError(pub String);

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Persistence error: {}", self.0)
    }
}

impl std::error::Error for PersistenceError {}

impl From<String> for PersistenceError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Canonical hashes from `from_height` up to the new tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUpdate {
    pub from_height: u64,
    pub hashes: Vec<Hash256>,
}

impl CanonicalUpdate {
    pub fn tip(&self) -> Option<&Hash256> {
        self.hashes.last()
    }

    pub fn tip_height(&self) -> u64 {
        self.from_height + self.hashes.len() as u64 - 1
    }
}

/// Everything read back on startup
#[derive(Debug, Default)]
pub struct StoredChain {
    /// Every stored block, in no particular order
    pub blocks: Vec<Block>,
    /// Canonical hashes in height order
    pub canonical: Vec<Hash256>,
    pub tip: Option<Hash256>,
}

/// Durable record of accepted blocks
pub trait ChainStore: Send + Sync {
    fn load(&self) -> Result<StoredChain, PersistenceError>;

    /// Record newly accepted blocks and, when the tip moved, the rewritten
    /// part of the canonical index. Returns once the write is durable.
    fn on_accept(&self, blocks: &[Arc<Block>], canonical: Option<&CanonicalUpdate>) -> Result<(), PersistenceError>;
}
