// Background miner
//
// Builds a template on the canonical tip, searches nonces in batches on a
// rayon pool and hands solved blocks to the node. A tip change between
// batches abandons the template; its partial work is never submitted.

use crate::chain::{BlockId, ChainHandle, TipInfo};
use crate::consensus::{CancelToken, ProofOfWork, SearchOutcome, Target};
use crate::core::{Address, Block};
use crate::mining::MiningStrategy;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Searching,
    Found,
    Interrupted,
}

impl MinerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MinerState::Searching,
            2 => MinerState::Found,
            3 => MinerState::Interrupted,
            _ => MinerState::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub threads: usize,
    /// Nonces searched between tip checks
    pub batch_size: u64,
    /// Nonces tried before the template is rebuilt
    pub nonces_per_template: u64,
    pub max_transactions: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            batch_size: 50_000,
            nonces_per_template: 5_000_000,
            max_transactions: crate::config::MAX_BLOCK_TRANSACTIONS,
        }
    }
}

pub struct Miner {
    chain: ChainHandle,
    strategy: Box<dyn MiningStrategy>,
    reward_address: Address,
    config: MinerConfig,
    found_tx: mpsc::UnboundedSender<Block>,
    state: Arc<AtomicU8>,
    cancel: CancelToken,
}

/// Control side of a running miner
pub struct MinerHandle {
    state: Arc<AtomicU8>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl MinerHandle {
    pub fn state(&self) -> MinerState {
        MinerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Cancel the search and wait for the mining thread to exit
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Mining thread panicked");
            }
        }
    }
}

impl Drop for MinerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Miner {
    pub fn new(
        chain: ChainHandle,
        strategy: Box<dyn MiningStrategy>,
        reward_address: Address,
        config: MinerConfig,
        found_tx: mpsc::UnboundedSender<Block>,
    ) -> Self {
        Self {
            chain,
            strategy,
            reward_address,
            config,
            found_tx,
            state: Arc::new(AtomicU8::new(MinerState::Idle as u8)),
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> MinerState {
        MinerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: MinerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Start mining on a dedicated thread
    pub fn spawn(self) -> Result<MinerHandle, String> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let thread = std::thread::Builder::new()
            .name("miner".into())
            .spawn(move || self.run())
            .map_err(|e| format!("Failed to start mining thread: {}", e))?;
        Ok(MinerHandle {
            state,
            cancel,
            thread: Some(thread),
        })
    }

    fn run(self) {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads.max(1))
            .thread_name(|i| format!("miner-{}", i))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                log::error!("Failed to build mining pool: {}", e);
                return;
            }
        };

        log::info!(
            "Mining to {} with {} threads ({} strategy)",
            self.reward_address,
            self.config.threads.max(1),
            self.strategy.name()
        );

        let mut tips = self.chain.subscribe();
        while !self.cancel.is_cancelled() {
            self.set_state(MinerState::Idle);
            tips.mark_unchanged();
            let template = self.chain.build_template(
                self.strategy.as_ref(),
                self.reward_address,
                self.config.max_transactions,
            );

            if let Some(block) = self.mine_template(template, &pool, &mut tips) {
                if self.found_tx.send(block).is_err() {
                    log::info!("Node stopped, miner exiting");
                    break;
                }
            }
        }
        log::info!("Miner stopped");
    }

    /// Whether a tip change since the last check should abandon the current template
    fn tip_moved(&self, tips: &mut watch::Receiver<TipInfo>) -> bool {
        match tips.has_changed() {
            Ok(false) => false,
            Ok(true) => {
                let tip = tips.borrow_and_update().hash;
                self.chain
                    .get_block(BlockId::Hash(tip))
                    .is_none_or(|block| self.strategy.on_new_tip(&block))
            }
            // Chain handle gone
            Err(_) => true,
        }
    }

    /// Search one template. Returns the solved block if the tip did not move.
    fn mine_template(
        &self,
        mut template: Block,
        pool: &rayon::ThreadPool,
        tips: &mut watch::Receiver<TipInfo>,
    ) -> Option<Block> {
        let Some(target) = Target::from_bits(template.header.bits) else {
            log::error!("Template with invalid bits {:#010x}", template.header.bits);
            return None;
        };
        let pow = ProofOfWork::new(target);
        self.set_state(MinerState::Searching);

        let budget = self.config.nonces_per_template;
        let batch = self.config.batch_size.max(1);
        let mut start = 0u64;

        while start < budget {
            if self.tip_moved(tips) {
                self.set_state(MinerState::Interrupted);
                log::debug!("Tip changed, abandoning template at height {}", template.height());
                return None;
            }

            let end = start.saturating_add(batch).min(budget);
            let result = pow.search_parallel(&template, start..end, pool, &self.cancel);
            match result.outcome {
                SearchOutcome::Found { nonce, hash } => {
                    if self.tip_moved(tips) {
                        self.set_state(MinerState::Interrupted);
                        log::debug!("Tip changed, discarding solved block {}", hash.short());
                        return None;
                    }
                    template.header.nonce = nonce;
                    self.set_state(MinerState::Found);
                    log::info!(
                        "Mined block {} at height {} ({:.0} H/s)",
                        hash.short(),
                        template.height(),
                        result.hash_rate()
                    );
                    return Some(template);
                }
                SearchOutcome::Cancelled => return None,
                SearchOutcome::Exhausted => start = end,
            }
        }

        log::debug!("Nonce budget exhausted at height {}, rebuilding template", template.height());
        None
    }
}
