// Shared handle to the chain state
//
// One write lock covers the block tree, the ledger and the pending pool.
// Durable writes happen after the lock is released but in acceptance order:
// each accepted submission draws a turn while it holds the lock and writes
// when its turn comes up. A submission only reports success once its blocks
// are on disk.

use crate::chain::builder::unix_time;
use crate::chain::{AcceptResult, ChainBuilder, Mempool, Submission, TxRejection};
use crate::config::ConsensusParams;
use crate::core::{Address, Block, Hash256, Transaction};
use crate::mining::MiningStrategy;
use crate::storage::{BlockchainDB, CanonicalUpdate, ChainStore, PersistenceError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::watch;

/// Everything guarded by the chain lock
pub struct ChainState {
    pub builder: ChainBuilder,
    pub mempool: Mempool,
}

/// Canonical tip as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Hash(Hash256),
    Height(u64),
}

/// Orders store writes without holding the chain lock
#[derive(Default)]
struct PersistQueue {
    issued: AtomicU64,
    /// Turn that may write now
    serving: Mutex<u64>,
    turn_done: Condvar,
}

impl PersistQueue {
    /// Draw the next turn; callers hold the chain write lock
    fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    fn wait_for(&self, turn: u64) -> PersistTurn<'_> {
        let mut serving = self.serving.lock().unwrap_or_else(PoisonError::into_inner);
        while *serving != turn {
            serving = self.turn_done.wait(serving).unwrap_or_else(PoisonError::into_inner);
        }
        PersistTurn { queue: self, turn }
    }
}

/// Passes the turn on when dropped, also when the write failed
struct PersistTurn<'a> {
    queue: &'a PersistQueue,
    turn: u64,
}

impl Drop for PersistTurn<'_> {
    fn drop(&mut self) {
        let mut serving = self.queue.serving.lock().unwrap_or_else(PoisonError::into_inner);
        *serving = self.turn + 1;
        self.queue.turn_done.notify_all();
    }
}

struct Shared {
    state: RwLock<ChainState>,
    store: Arc<dyn ChainStore>,
    persist: PersistQueue,
    tip_tx: watch::Sender<TipInfo>,
}

#[derive(Clone)]
pub struct ChainHandle {
    shared: Arc<Shared>,
}

impl ChainHandle {
    /// Rebuild the chain from `store`, re-validating every stored block
    pub fn open(params: ConsensusParams, store: Arc<dyn ChainStore>) -> Result<Self, PersistenceError> {
        let stored = store.load()?;
        let mut builder = ChainBuilder::new(params);

        // Canonical blocks first so that equal-work ties restore the stored tip
        let canonical: HashSet<Hash256> = stored.canonical.iter().copied().collect();
        let mut blocks = stored.blocks;
        blocks.sort_by_key(|b| (b.height(), !canonical.contains(&b.hash())));

        let mut restored = 0;
        for block in blocks {
            let hash = block.hash();
            match builder.submit_block(block).result {
                AcceptResult::Accepted | AcceptResult::AcceptedFork => restored += 1,
                AcceptResult::AlreadyKnown => {}
                other => log::warn!("Stored block {} not restored: {:?}", hash.short(), other),
            }
        }

        if let Some(tip) = stored.tip {
            if tip != builder.tip_hash() {
                log::warn!("Stored tip {} differs from rebuilt tip {}", tip.short(), builder.tip_hash().short());
            }
        }
        log::info!("Restored {} blocks, tip height {}", restored, builder.tip_height());

        Ok(Self::with_builder(builder, store))
    }

    /// Fresh chain on a temporary store
    pub fn in_memory(params: ConsensusParams) -> Result<Self, PersistenceError> {
        let store = BlockchainDB::memory()?;
        Self::open(params, Arc::new(store))
    }

    fn with_builder(builder: ChainBuilder, store: Arc<dyn ChainStore>) -> Self {
        let tip = TipInfo {
            hash: builder.tip_hash(),
            height: builder.tip_height(),
        };
        let (tip_tx, _) = watch::channel(tip);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(ChainState {
                    builder,
                    mempool: Mempool::new(),
                }),
                store,
                persist: PersistQueue::default(),
                tip_tx,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChainState> {
        self.shared.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.shared.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a consistent snapshot of the chain state
    pub fn read<R>(&self, f: impl FnOnce(&ChainState) -> R) -> R {
        f(&self.read_state())
    }

    /// Validate, integrate and persist a block.
    ///
    /// Returns an error only when the store failed; the block is then in
    /// memory but must not be announced.
    pub fn submit_block(&self, block: Block) -> Result<Submission, PersistenceError> {
        let (submission, update, tip, turn) = {
            let mut state = self.write_state();
            let old_height = state.builder.tip_height();
            let submission = state.builder.submit_block(block);
            if !submission.is_accepted() {
                return Ok(submission);
            }

            let update = submission.tip_changed.then(|| {
                let from_height = submission
                    .reorg
                    .as_ref()
                    .and_then(|r| r.connected.first())
                    .map_or(old_height + 1, |b| b.height());
                let hashes = state
                    .builder
                    .canonical_path()
                    .get(from_height as usize..)
                    .map(<[Hash256]>::to_vec)
                    .unwrap_or_default();
                CanonicalUpdate { from_height, hashes }
            });

            if submission.tip_changed {
                let resurrected: Vec<Transaction> = submission
                    .reorg
                    .iter()
                    .flat_map(|r| r.disconnected.iter())
                    .flat_map(|b| b.transactions.iter().cloned())
                    .collect();
                let ChainState { builder, mempool } = &mut *state;
                let dropped = mempool.revalidate(builder.ledger(), resurrected);
                if dropped > 0 {
                    log::debug!("Dropped {} pending transactions after tip change", dropped);
                }
            }

            let tip = TipInfo {
                hash: state.builder.tip_hash(),
                height: state.builder.tip_height(),
            };
            (submission, update, tip, self.shared.persist.issue())
        };

        let _turn = self.shared.persist.wait_for(turn);
        self.shared.store.on_accept(&submission.connected, update.as_ref())?;

        if submission.tip_changed {
            self.shared.tip_tx.send_replace(tip);
        }
        Ok(submission)
    }

    /// Admit a transaction to the pending pool
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, TxRejection> {
        let mut state = self.write_state();
        let ChainState { builder, mempool } = &mut *state;
        let txid = mempool.admit(tx, builder.ledger())?;
        log::debug!("Admitted transaction {} ({} pending)", txid.short(), mempool.len());
        Ok(txid)
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.read_state().builder.balance_of(address)
    }

    /// Nonce for the next transfer from `address`, counting pooled transfers
    pub fn next_nonce(&self, address: &Address) -> u64 {
        let state = self.read_state();
        state.builder.ledger().nonce_of(address) + state.mempool.queued_for(address) as u64
    }

    pub fn tip(&self) -> TipInfo {
        *self.shared.tip_tx.borrow()
    }

    pub fn tip_height(&self) -> u64 {
        self.read_state().builder.tip_height()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.read_state().builder.genesis_hash()
    }

    pub fn params(&self) -> ConsensusParams {
        self.read_state().builder.params().clone()
    }

    pub fn get_block(&self, id: BlockId) -> Option<Arc<Block>> {
        let state = self.read_state();
        match id {
            BlockId::Hash(hash) => state.builder.block(&hash),
            BlockId::Height(height) => state.builder.block_at_height(height),
        }
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.read_state().builder.contains(hash)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.read_state().mempool.pending()
    }

    /// Expire stale orphans and return the missing ancestors to request again
    pub fn orphan_maintenance(&self, now: Instant) -> Vec<Hash256> {
        let mut state = self.write_state();
        let orphans = state.builder.orphans_mut();
        let expired = orphans.expire(now);
        if expired > 0 {
            log::debug!("Expired {} orphan blocks", expired);
        }
        orphans.due_requests(now)
    }

    /// Subscribe to canonical tip changes
    pub fn subscribe(&self) -> watch::Receiver<TipInfo> {
        self.shared.tip_tx.subscribe()
    }

    /// Unsolved block on top of the canonical tip, paying reward and fees to `reward_address`
    pub fn build_template(&self, strategy: &dyn MiningStrategy, reward_address: Address, max_transactions: usize) -> Block {
        let state = self.read_state();
        let builder = &state.builder;
        let tip = builder.tip();
        let height = tip.height + 1;
        let bits = builder
            .expected_target_for_child(&tip.hash)
            .map_or(builder.params().pow_limit_bits, |t| t.to_bits());
        let timestamp = unix_time().max(tip.block.header.timestamp + 1);

        let pending = state.mempool.pending();
        let mut selected = strategy.select_transactions(&pending, builder.ledger(), max_transactions.saturating_sub(1));
        let total_fees = selected.iter().try_fold(0u64, |acc, tx| acc.checked_add(tx.fee));
        let fees = total_fees.unwrap_or_else(|| {
            selected.clear();
            0
        });
        let reward = builder.params().block_reward(height).saturating_add(fees);

        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(Transaction::coinbase(reward_address, reward, height));
        transactions.extend(selected);

        log::debug!(
            "Template at height {} with {} transactions ({} strategy)",
            height,
            transactions.len(),
            strategy.name()
        );
        Block::template(tip.hash, height, timestamp, bits, transactions)
    }
}
