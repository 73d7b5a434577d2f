// Node and consensus configuration

use crate::core::{Address, Block};
use crate::mining::StrategyKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Reward of the first `REWARD_HALF_LIFE` blocks
pub const GENESIS_REWARD: u64 = 1000;
/// Blocks between reward halvings
pub const REWARD_HALF_LIFE: u64 = 10_000;
/// 2017-03-03 10:35:26 UTC
pub const GENESIS_TIMESTAMP: u64 = 1_488_537_326;

/// Blocks between difficulty changes
pub const DIFFICULTY_BLOCK_INTERVAL: u64 = 5;
/// Intended time for one block, in seconds (60s per interval)
pub const DIFFICULTY_TARGET_SPACING: u64 = 12;
/// Easiest compact target; also the genesis target
pub const POW_LIMIT_BITS: u32 = 0x207fffff;

/// How far a block timestamp may run ahead of local time
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;
pub const MAX_BLOCK_TRANSACTIONS: usize = 1000;

pub const MAX_ORPHANS: usize = 100;
pub const BLOCK_REQUEST_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Failed backfill requests before the dependent orphans are dropped
pub const BLOCK_REQUEST_RETRY_COUNT: u32 = 3;
pub const ORPHAN_TTL: Duration = Duration::from_secs(3 * 60);

pub const MAX_POOL_SIZE: usize = 5000;

pub const PROTOCOL_VERSION: u32 = 1;
pub const NETWORK_MAGIC: [u8; 4] = *b"PWC1";
pub const MAX_PEERS: usize = 10;
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_BLOCKS_PER_RESPONSE: usize = 500;
/// Misbehavior score at which a peer is disconnected
pub const BAN_THRESHOLD: u32 = 100;
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Parameters every node on a network must agree on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    pub genesis_bits: u32,
    pub pow_limit_bits: u32,
    /// Blocks between retargets; 0 disables retargeting
    pub retarget_interval: u64,
    pub target_spacing: u64,
    pub genesis_reward: u64,
    pub reward_half_life: u64,
}

impl ConsensusParams {
    pub fn mainnet() -> Self {
        Self {
            genesis_bits: POW_LIMIT_BITS,
            pow_limit_bits: POW_LIMIT_BITS,
            retarget_interval: DIFFICULTY_BLOCK_INTERVAL,
            target_spacing: DIFFICULTY_TARGET_SPACING,
            genesis_reward: GENESIS_REWARD,
            reward_half_life: REWARD_HALF_LIFE,
        }
    }

    /// Fixed easiest difficulty, for tests and local networks
    pub fn regtest() -> Self {
        Self {
            retarget_interval: 0,
            ..Self::mainnet()
        }
    }

    /// Coinbase reward for a block at `height`
    pub fn block_reward(&self, height: u64) -> u64 {
        let halvings = height / self.reward_half_life.max(1);
        if halvings >= 64 {
            return 0;
        }
        self.genesis_reward >> halvings
    }

    pub fn genesis_block(&self) -> Block {
        Block::genesis(self.genesis_bits, GENESIS_TIMESTAMP)
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

/// Runtime configuration of a miner node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,
    /// Mining is disabled when no reward address is set
    pub reward_address: Option<Address>,
    /// In-memory store when unset
    pub persist_path: Option<PathBuf>,
    pub strategy: StrategyKind,
    pub mining_threads: usize,
    pub params: ConsensusParams,
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            bootstrap_peers: Vec::new(),
            reward_address: None,
            persist_path: None,
            strategy: StrategyKind::FeePriority,
            mining_threads: 1,
            params: ConsensusParams::mainnet(),
        }
    }
}
