// Block production: transaction selection and nonce search

mod strategy;
mod miner;

pub use strategy::{FeePriority, Fifo, MiningStrategy, StrategyKind};
pub use miner::{Miner, MinerConfig, MinerHandle, MinerState};
