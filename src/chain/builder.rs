// Chain builder: fork tree, canonical tip selection and block acceptance
//
// Every valid block ever seen is kept in an arena keyed by hash together
// with its cumulative work. The canonical chain is the path from genesis to
// the entry with the most work; on equal work the tip that was seen first
// stays. The ledger always reflects the canonical path.

use crate::chain::{BlockDelta, LedgerState, OrphanPool};
use crate::config::ConsensusParams;
use crate::consensus::validation::{check_context, check_structure};
use crate::consensus::{BlockError, ConsensusError, Target, ValidationError, difficulty};
use crate::core::{Address, Block, Hash256};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A block linked into the fork tree
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub block: Arc<Block>,
    pub hash: Hash256,
    pub height: u64,
    /// Work of this block and all its ancestors
    pub chain_work: BigUint,
    /// Easiest target this block was allowed to declare
    pub required_target: Target,
    /// Arrival order, used for first-seen tie breaking
    pub seq: u64,
    /// Ledger effect relative to the parent
    pub delta: BlockDelta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptResult {
    /// Stored; the tip either advanced along its own branch or did not move
    Accepted,
    /// Stored, and the canonical tip moved to a different branch
    AcceptedFork,
    Rejected(BlockError),
    /// Parent unknown; buffered until it arrives
    Orphan,
    /// Already stored or buffered; nothing changed
    AlreadyKnown,
}

/// Blocks that left and joined the canonical chain during a tip switch
#[derive(Debug, Clone, Default)]
pub struct Reorg {
    /// Old branch, newest first
    pub disconnected: Vec<Arc<Block>>,
    /// New branch, oldest first
    pub connected: Vec<Arc<Block>>,
}

/// Outcome of `ChainBuilder::submit_block`
#[derive(Debug, Clone)]
pub struct Submission {
    pub result: AcceptResult,
    pub tip_changed: bool,
    /// Blocks linked into the tree by this call, in link order; buffered orphans included
    pub connected: Vec<Arc<Block>>,
    /// Unknown ancestor to request from peers when the block was orphaned
    pub missing: Option<Hash256>,
    pub reorg: Option<Reorg>,
}

impl Submission {
    fn only(result: AcceptResult) -> Self {
        Self {
            result,
            tip_changed: false,
            connected: Vec::new(),
            missing: None,
            reorg: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.result, AcceptResult::Accepted | AcceptResult::AcceptedFork)
    }
}

/// Current unix time in seconds
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct ChainBuilder {
    params: ConsensusParams,
    entries: HashMap<Hash256, BlockEntry>,
    genesis_hash: Hash256,
    tip: Hash256,
    /// Canonical block hashes indexed by height
    canonical: Vec<Hash256>,
    ledger: LedgerState,
    orphans: OrphanPool,
    next_seq: u64,
    /// Ledger at the most recently connected side-branch block
    branch_ledger: Option<(Hash256, LedgerState)>,
}

impl ChainBuilder {
    pub fn new(params: ConsensusParams) -> Self {
        let genesis = Arc::new(params.genesis_block());
        let hash = genesis.hash();
        let target = Target::from_bits(params.genesis_bits)
            .unwrap_or_else(|| difficulty::pow_limit(&params));

        let entry = BlockEntry {
            block: genesis,
            hash,
            height: 0,
            chain_work: target.work(),
            required_target: target,
            seq: 0,
            delta: BlockDelta::default(),
        };

        let mut entries = HashMap::new();
        entries.insert(hash, entry);

        Self {
            params,
            entries,
            genesis_hash: hash,
            tip: hash,
            canonical: vec![hash],
            ledger: LedgerState::new(),
            orphans: OrphanPool::new(),
            next_seq: 1,
            branch_ledger: None,
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn tip(&self) -> &BlockEntry {
        &self.entries[&self.tip]
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.tip
    }

    pub fn tip_height(&self) -> u64 {
        self.tip().height
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.ledger.balance_of(address)
    }

    /// Number of blocks in the tree, genesis and losing forks included
    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn orphans_mut(&mut self) -> &mut OrphanPool {
        &mut self.orphans
    }

    pub fn entry(&self, hash: &Hash256) -> Option<&BlockEntry> {
        self.entries.get(hash)
    }

    pub fn block(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.entries.get(hash).map(|e| e.block.clone())
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash) || self.orphans.contains(hash)
    }

    pub fn canonical_path(&self) -> &[Hash256] {
        &self.canonical
    }

    pub fn is_canonical(&self, hash: &Hash256) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|e| self.canonical.get(e.height as usize) == Some(hash))
    }

    /// Canonical block at `height`
    pub fn block_at_height(&self, height: u64) -> Option<Arc<Block>> {
        let hash = self.canonical.get(usize::try_from(height).ok()?)?;
        self.block(hash)
    }

    /// Up to `count` canonical blocks starting at `from`
    pub fn blocks_in_range(&self, from: u64, count: usize) -> Vec<Arc<Block>> {
        let Ok(start) = usize::try_from(from) else {
            return Vec::new();
        };
        self.canonical
            .iter()
            .skip(start)
            .take(count)
            .filter_map(|h| self.block(h))
            .collect()
    }

    /// `hash` and up to `count - 1` of its ancestors, oldest first, genesis excluded
    pub fn ancestors(&self, hash: &Hash256, count: usize) -> Vec<Arc<Block>> {
        let mut blocks = Vec::new();
        let mut current = *hash;
        while blocks.len() < count {
            let Some(entry) = self.entries.get(&current) else { break };
            if entry.height == 0 {
                break;
            }
            blocks.push(entry.block.clone());
            current = *entry.block.prev_hash();
        }
        blocks.reverse();
        blocks
    }

    /// Ancestor of `hash` at `height`, following parent links
    fn ancestor_at(&self, hash: &Hash256, height: u64) -> Option<&BlockEntry> {
        let mut entry = self.entries.get(hash)?;
        while entry.height > height {
            entry = self.entries.get(entry.block.prev_hash())?;
        }
        (entry.height == height).then_some(entry)
    }

    /// Easiest target a child of `parent` may declare
    pub fn expected_target_for_child(&self, parent: &Hash256) -> Option<Target> {
        let entry = self.entries.get(parent)?;
        let window_start = if difficulty::is_retarget_height(&self.params, entry.height) {
            self.ancestor_at(parent, entry.height - self.params.retarget_interval)
                .map(|a| a.block.header.timestamp)
        } else {
            None
        };
        Some(difficulty::next_target(
            &self.params,
            entry.height,
            &entry.required_target,
            entry.block.header.timestamp,
            window_start,
        ))
    }

    /// Ledger of the chain ending at `hash`.
    ///
    /// Starts from the canonical ledger, reverts the canonical blocks above
    /// the fork point and replays the branch up to `hash`.
    pub fn ledger_at(&self, hash: &Hash256) -> Option<LedgerState> {
        let mut ledger = self.ledger.clone();
        let mut branch = Vec::new();
        let mut current = *hash;
        let fork_height = loop {
            let entry = self.entries.get(&current)?;
            if self.canonical.get(entry.height as usize) == Some(&current) {
                break entry.height as usize;
            }
            branch.push(entry);
            current = *entry.block.prev_hash();
        };

        for undone in self.canonical[fork_height + 1..].iter().rev() {
            ledger.undo(&self.entries[undone].delta);
        }
        for entry in branch.iter().rev() {
            ledger.redo(&entry.delta);
        }
        Some(ledger)
    }

    /// Ledger a child of the side-branch block `parent` is checked against
    fn take_branch_ledger(&mut self, parent: &Hash256) -> Option<LedgerState> {
        match self.branch_ledger.take() {
            Some((hash, ledger)) if hash == *parent => Some(ledger),
            _ => self.ledger_at(parent),
        }
    }

    pub fn submit_block(&mut self, block: Block) -> Submission {
        self.submit_block_at(block, Instant::now(), unix_time())
    }

    /// Validate and integrate a block.
    ///
    /// Checks run in order and stop at the first failure: structure, parent
    /// linkage, context and proof of work, then replay against the parent's
    /// ledger.
    pub fn submit_block_at(&mut self, block: Block, now: Instant, unix_time: u64) -> Submission {
        let hash = block.hash();
        if self.contains(&hash) {
            return Submission::only(AcceptResult::AlreadyKnown);
        }

        if let Err(e) = check_structure(&block) {
            log::debug!("Rejected block {}: {}", hash.short(), e);
            return Submission::only(AcceptResult::Rejected(e.into()));
        }

        let block = Arc::new(block);

        if !self.entries.contains_key(block.prev_hash()) {
            // Only buffer blocks that at least meet their own declared target
            let Some(declared) = Target::from_bits(block.header.bits) else {
                return Submission::only(AcceptResult::Rejected(
                    ValidationError::InvalidBits(block.header.bits).into(),
                ));
            };
            if !declared.is_met_by(&hash) {
                return Submission::only(AcceptResult::Rejected(
                    ConsensusError::InsufficientProofOfWork.into(),
                ));
            }
            let missing = self.orphans.insert(block, now);
            log::debug!("Orphan block {}, missing ancestor {}", hash.short(), missing.short());
            let mut submission = Submission::only(AcceptResult::Orphan);
            submission.missing = Some(missing);
            return submission;
        }

        let old_tip = self.tip;
        if let Err(e) = self.connect(block.clone(), unix_time) {
            log::debug!("Rejected block {}: {}", hash.short(), e);
            return Submission::only(AcceptResult::Rejected(e));
        }
        let mut connected = vec![block];

        // Link buffered descendants
        let mut parents = vec![hash];
        while let Some(parent) = parents.pop() {
            for child in self.orphans.take_children(&parent) {
                let child_hash = child.hash();
                match self.connect(child.clone(), unix_time) {
                    Ok(()) => {
                        connected.push(child);
                        parents.push(child_hash);
                    }
                    Err(e) => {
                        log::debug!("Dropped orphan {}: {}", child_hash.short(), e);
                        self.orphans.remove_subtree(&child_hash);
                    }
                }
            }
        }

        let tip_changed = self.tip != old_tip;
        let forked = tip_changed && !self.is_canonical(&old_tip);
        let reorg = forked.then(|| self.reorg_from(&old_tip));

        if let Some(reorg) = &reorg {
            log::info!(
                "Reorganized to {} at height {}: {} blocks disconnected, {} connected",
                self.tip.short(),
                self.tip_height(),
                reorg.disconnected.len(),
                reorg.connected.len()
            );
        } else if tip_changed {
            log::info!("New tip {} at height {}", self.tip.short(), self.tip_height());
        }

        Submission {
            result: if forked { AcceptResult::AcceptedFork } else { AcceptResult::Accepted },
            tip_changed,
            connected,
            missing: None,
            reorg,
        }
    }

    /// Contextual and semantic validation of a block whose parent is known,
    /// then insertion and tip selection
    fn connect(&mut self, block: Arc<Block>, unix_time: u64) -> Result<(), BlockError> {
        let prev = *block.prev_hash();
        let parent = self.entries.get(&prev).ok_or(ValidationError::UnexpectedGenesis)?;
        let parent_header = parent.block.header.clone();
        let parent_work = parent.chain_work.clone();
        let parent_height = parent.height;

        let required = self
            .expected_target_for_child(&prev)
            .ok_or(ValidationError::UnexpectedGenesis)?;
        check_context(&block, &parent_header, &required, unix_time)?;
        let declared = Target::from_bits(block.header.bits)
            .ok_or(ValidationError::InvalidBits(block.header.bits))?;

        // Extending the tip checks against the live ledger
        let base = if prev == self.tip {
            None
        } else {
            Some(self.take_branch_ledger(&prev).ok_or(ValidationError::UnexpectedGenesis)?)
        };
        let changes = base.as_ref().unwrap_or(&self.ledger).check_block(&block, &self.params)?;
        let delta = base.as_ref().unwrap_or(&self.ledger).delta(&changes);

        let hash = block.hash();
        let entry = BlockEntry {
            block,
            hash,
            height: parent_height + 1,
            chain_work: parent_work + declared.work(),
            required_target: required,
            seq: self.next_seq,
            delta,
        };
        self.next_seq += 1;

        let heavier = entry.chain_work > self.tip().chain_work;
        self.entries.insert(hash, entry);

        match base {
            None if heavier => {
                self.ledger.commit(changes);
                self.canonical.push(hash);
                self.tip = hash;
            }
            None => {}
            Some(mut ledger) => {
                ledger.commit(changes);
                if heavier {
                    self.ledger = ledger;
                    self.set_canonical_tip(hash);
                } else {
                    self.branch_ledger = Some((hash, ledger));
                }
            }
        }
        Ok(())
    }

    /// Rewrite the canonical index so it ends at `hash`
    fn set_canonical_tip(&mut self, hash: Hash256) {
        let mut branch = Vec::new();
        let mut current = hash;
        loop {
            let entry = &self.entries[&current];
            if self.canonical.get(entry.height as usize) == Some(&current) {
                self.canonical.truncate(entry.height as usize + 1);
                break;
            }
            branch.push(current);
            current = *entry.block.prev_hash();
        }
        branch.reverse();
        self.canonical.extend(branch);
        self.tip = hash;
    }

    /// Branches on either side of the fork point between `old_tip` and the current tip
    fn reorg_from(&self, old_tip: &Hash256) -> Reorg {
        let mut disconnected = Vec::new();
        let mut current = *old_tip;
        let fork_height = loop {
            let entry = &self.entries[&current];
            if self.canonical.get(entry.height as usize) == Some(&current) {
                break entry.height;
            }
            disconnected.push(entry.block.clone());
            current = *entry.block.prev_hash();
        };
        let connected = self
            .canonical
            .iter()
            .skip(fork_height as usize + 1)
            .filter_map(|h| self.block(h))
            .collect();
        Reorg {
            disconnected,
            connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{CancelToken, ProofOfWork};
    use crate::core::{KeyPair, Transaction};
    use std::time::Duration;

    const EASY: u32 = 0x207fffff;
    const HARD: u32 = 0x1f7fffff;

    fn builder() -> ChainBuilder {
        ChainBuilder::new(ConsensusParams::regtest())
    }

    fn mine(mut block: Block) -> Block {
        let target = Target::from_bits(block.header.bits).unwrap();
        let result = ProofOfWork::new(target).search(&block, 0..u64::MAX, &CancelToken::new());
        block.header.nonce = result.nonce().unwrap();
        block
    }

    fn child_of(parent: &Block, bits: u32, miner: &Address, transfers: Vec<Transaction>) -> Block {
        let height = parent.height() + 1;
        let fees: u64 = transfers.iter().map(|t| t.fee).sum();
        let reward = ConsensusParams::regtest().block_reward(height);
        let mut txs = vec![Transaction::coinbase(*miner, reward + fees, height)];
        txs.extend(transfers);
        mine(Block::template(
            parent.hash(),
            height,
            parent.header.timestamp + 10,
            bits,
            txs,
        ))
    }

    fn submit(chain: &mut ChainBuilder, block: &Block) -> Submission {
        chain.submit_block_at(block.clone(), Instant::now(), block.header.timestamp)
    }

    #[test]
    fn test_extends_tip() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();
        let b1 = child_of(&genesis, EASY, &miner.address, vec![]);

        let sub = submit(&mut chain, &b1);
        assert_eq!(sub.result, AcceptResult::Accepted);
        assert!(sub.tip_changed);
        assert_eq!(chain.tip_hash(), b1.hash());
        assert_eq!(chain.tip_height(), 1);
        assert_eq!(chain.balance_of(&miner.address), 1000);
    }

    #[test]
    fn test_duplicate_submission_is_noop() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();
        let b1 = child_of(&genesis, EASY, &miner.address, vec![]);

        assert_eq!(submit(&mut chain, &b1).result, AcceptResult::Accepted);
        let ledger = chain.ledger().clone();
        let count = chain.block_count();

        let again = submit(&mut chain, &b1);
        assert_eq!(again.result, AcceptResult::AlreadyKnown);
        assert!(!again.tip_changed);
        assert_eq!(chain.ledger(), &ledger);
        assert_eq!(chain.block_count(), count);
    }

    #[test]
    fn test_heavier_fork_wins_and_excludes_losing_transactions() {
        let mut chain = builder();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let t1 = Transaction::create(&alice, bob.address, 10, 0, 0);
        let b1 = child_of(&genesis, EASY, &alice.address, vec![]);
        // coinbase credits alice before t1 spends
        let b1 = {
            let mut txs = b1.transactions.clone();
            txs.push(t1);
            mine(Block::template(genesis.hash(), 1, b1.header.timestamp, EASY, txs))
        };
        assert_eq!(submit(&mut chain, &b1).result, AcceptResult::Accepted);
        assert_eq!(chain.balance_of(&bob.address), 10);

        let t2 = Transaction::create(&bob, alice.address, 5, 0, 0);
        let b2a = child_of(&b1, EASY, &alice.address, vec![t2]);
        assert_eq!(submit(&mut chain, &b2a).result, AcceptResult::Accepted);
        assert_eq!(chain.balance_of(&bob.address), 5);

        let b2b = child_of(&b1, HARD, &bob.address, vec![]);
        let sub = submit(&mut chain, &b2b);
        assert_eq!(sub.result, AcceptResult::AcceptedFork);
        assert_eq!(chain.tip_hash(), b2b.hash());

        let reorg = sub.reorg.unwrap();
        assert_eq!(reorg.disconnected[0].hash(), b2a.hash());
        assert_eq!(reorg.connected[0].hash(), b2b.hash());

        // t2 is no longer part of the canonical history
        assert_eq!(chain.balance_of(&bob.address), 10 + 1000);
        assert!(chain.entry(&b2a.hash()).is_some());
        assert!(!chain.is_canonical(&b2a.hash()));
    }

    /// Replay of the canonical path from genesis
    fn replayed(chain: &ChainBuilder) -> LedgerState {
        let blocks: Vec<_> = chain.ancestors(&chain.tip_hash(), usize::MAX);
        LedgerState::from_canonical_chain(blocks.iter().map(|b| b.as_ref()), chain.params()).unwrap()
    }

    #[test]
    fn test_ledger_after_reorg_matches_replay() {
        let mut chain = builder();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let b1 = child_of(&genesis, EASY, &alice.address, vec![]);
        submit(&mut chain, &b1);
        let pay = Transaction::create(&alice, bob.address, 70, 1, 0);
        let b2a = child_of(&b1, EASY, &alice.address, vec![pay]);
        submit(&mut chain, &b2a);
        assert_eq!(chain.ledger(), &replayed(&chain));

        // b3b arrives before its parent, then b2b makes that branch heavier
        let b2b = child_of(&b1, HARD, &bob.address, vec![]);
        let b3b = child_of(&b2b, EASY, &bob.address, vec![]);
        assert_eq!(submit(&mut chain, &b3b).result, AcceptResult::Orphan);
        let sub = submit(&mut chain, &b2b);
        assert_eq!(sub.result, AcceptResult::AcceptedFork);
        assert_eq!(chain.tip_hash(), b3b.hash());
        assert_eq!(chain.ledger(), &replayed(&chain));
        assert_eq!(chain.balance_of(&bob.address), 2000);
    }

    #[test]
    fn test_side_branch_grows_then_takes_over() {
        let mut chain = builder();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let mut main = vec![child_of(&genesis, EASY, &alice.address, vec![])];
        for _ in 0..3 {
            let tx = Transaction::create(&alice, bob.address, 5, 0, main.len() as u64 - 1);
            let next = child_of(main.last().unwrap(), EASY, &alice.address, vec![tx]);
            main.push(next);
        }
        for block in &main {
            submit(&mut chain, block);
        }
        let main_ledger = chain.ledger().clone();

        // A branch off height 1 that only overtakes at its fifth block
        let mut side = vec![main[0].clone()];
        for i in 0..5 {
            let tx = Transaction::create(&alice, bob.address, 1, 0, i);
            let next = child_of(side.last().unwrap(), EASY, &bob.address, vec![tx]);
            side.push(next);
        }
        for block in &side[1..4] {
            let sub = submit(&mut chain, block);
            assert_eq!(sub.result, AcceptResult::Accepted);
            assert!(!sub.tip_changed);
            assert_eq!(chain.ledger(), &main_ledger);
        }

        // Ledger of a side block equals a replay of its own path
        let side_tip = side[3].hash();
        let path = chain.ancestors(&side_tip, usize::MAX);
        let expected = LedgerState::from_canonical_chain(path.iter().map(|b| b.as_ref()), chain.params()).unwrap();
        assert_eq!(chain.ledger_at(&side_tip), Some(expected));

        let sub = submit(&mut chain, &side[4]);
        assert_eq!(sub.result, AcceptResult::AcceptedFork);
        assert_eq!(sub.reorg.unwrap().disconnected.len(), 3);
        assert_eq!(chain.tip_hash(), side[4].hash());
        assert_eq!(chain.ledger(), &replayed(&chain));
        assert_eq!(chain.balance_of(&bob.address), 4 * 1000 + 4);

        // And back: the old main branch is one block short
        let main_ledger_again = chain.ledger_at(&main[3].hash()).unwrap();
        assert_eq!(main_ledger_again, main_ledger);
    }

    #[test]
    fn test_equal_work_keeps_first_seen() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let other = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let a = child_of(&genesis, EASY, &miner.address, vec![]);
        let b = child_of(&genesis, EASY, &other.address, vec![]);
        submit(&mut chain, &a);
        let sub = submit(&mut chain, &b);
        assert_eq!(sub.result, AcceptResult::Accepted);
        assert!(!sub.tip_changed);
        assert_eq!(chain.tip_hash(), a.hash());
    }

    #[test]
    fn test_tip_is_independent_of_arrival_order() {
        let miner = KeyPair::generate();
        let genesis = builder().block_at_height(0).unwrap();
        let a1 = child_of(&genesis, EASY, &miner.address, vec![]);
        let a2 = child_of(&a1, EASY, &miner.address, vec![]);
        let b1 = child_of(&genesis, HARD, &miner.address, vec![]);

        let mut first = builder();
        for b in [&a1, &a2, &b1] {
            submit(&mut first, b);
        }
        let mut second = builder();
        for b in [&b1, &a2, &a1] {
            submit(&mut second, b);
        }
        assert_eq!(first.tip_hash(), b1.hash());
        assert_eq!(second.tip_hash(), b1.hash());
        assert_eq!(first.ledger(), second.ledger());
    }

    #[test]
    fn test_orphan_connects_when_parent_arrives() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();
        let b1 = child_of(&genesis, EASY, &miner.address, vec![]);
        let b2 = child_of(&b1, EASY, &miner.address, vec![]);

        let sub = submit(&mut chain, &b2);
        assert_eq!(sub.result, AcceptResult::Orphan);
        assert_eq!(sub.missing, Some(b1.hash()));
        assert_eq!(chain.tip_height(), 0);
        assert_eq!(submit(&mut chain, &b2).result, AcceptResult::AlreadyKnown);

        let sub = submit(&mut chain, &b1);
        assert_eq!(sub.result, AcceptResult::Accepted);
        assert_eq!(sub.connected.len(), 2);
        assert_eq!(chain.tip_height(), 2);
        assert_eq!(chain.tip_hash(), b2.hash());
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_invalid_signature_rejected_without_change() {
        let mut chain = builder();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let mut forged = Transaction::create(&alice, bob.address, 10, 0, 0);
        forged.amount = 20;
        let bad = child_of(&genesis, EASY, &alice.address, vec![forged]);

        let sub = submit(&mut chain, &bad);
        assert_eq!(
            sub.result,
            AcceptResult::Rejected(BlockError::Validation(ValidationError::InvalidSignature))
        );
        assert_eq!(chain.tip_height(), 0);
        assert_eq!(chain.block_count(), 1);
    }

    #[test]
    fn test_double_spend_rejected() {
        let mut chain = builder();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let b1 = child_of(&genesis, EASY, &alice.address, vec![]);
        submit(&mut chain, &b1);
        let spend = Transaction::create(&alice, bob.address, 600, 0, 0);
        let b2 = child_of(&b1, EASY, &alice.address, vec![spend.clone()]);
        submit(&mut chain, &b2);

        // Same transfer again: stale nonce
        let replay = Transaction::create(&alice, bob.address, 601, 0, 0);
        let b3 = child_of(&b2, EASY, &bob.address, vec![replay]);
        let sub = submit(&mut chain, &b3);
        assert!(matches!(
            sub.result,
            AcceptResult::Rejected(BlockError::Consensus(ConsensusError::InvalidNonce { .. }))
        ));
        assert_eq!(chain.tip_hash(), b2.hash());
    }

    #[test]
    fn test_target_easier_than_required_rejected() {
        let mut params = ConsensusParams::regtest();
        params.genesis_bits = HARD;
        let mut chain = ChainBuilder::new(params);
        let miner = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();

        let easy = child_of(&genesis, EASY, &miner.address, vec![]);
        let sub = submit(&mut chain, &easy);
        assert!(matches!(
            sub.result,
            AcceptResult::Rejected(BlockError::Consensus(ConsensusError::TargetTooEasy { .. }))
        ));
    }

    #[test]
    fn test_orphan_without_work_is_not_buffered() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();
        let b1 = child_of(&genesis, EASY, &miner.address, vec![]);
        let mut b2 = child_of(&b1, EASY, &miner.address, vec![]);
        let target = Target::from_bits(EASY).unwrap();
        while target.is_met_by(&b2.hash()) {
            b2.header.nonce += 1;
        }

        let sub = submit(&mut chain, &b2);
        assert_eq!(
            sub.result,
            AcceptResult::Rejected(ConsensusError::InsufficientProofOfWork.into())
        );
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_range_and_ancestor_queries() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let mut parent = chain.block_at_height(0).unwrap().as_ref().clone();
        let mut hashes = Vec::new();
        for _ in 0..4 {
            let b = child_of(&parent, EASY, &miner.address, vec![]);
            submit(&mut chain, &b);
            hashes.push(b.hash());
            parent = b;
        }

        let range: Vec<_> = chain.blocks_in_range(2, 10).iter().map(|b| b.hash()).collect();
        assert_eq!(range, hashes[1..].to_vec());

        let ancestors: Vec<_> = chain.ancestors(&hashes[3], 2).iter().map(|b| b.hash()).collect();
        assert_eq!(ancestors, vec![hashes[2], hashes[3]]);
        assert_eq!(chain.ancestors(&hashes[3], 100).len(), 4);
        assert_eq!(chain.block_at_height(4).unwrap().hash(), hashes[3]);
        assert!(chain.block_at_height(5).is_none());
    }

    #[test]
    fn test_retarget_applies_to_children() {
        let mut params = ConsensusParams::mainnet();
        params.retarget_interval = 2;
        let mut chain = ChainBuilder::new(params.clone());
        let miner = KeyPair::generate();
        let mut parent = chain.block_at_height(0).unwrap().as_ref().clone();

        // Blocks 10s apart against a 12s spacing: slightly harder after height 2
        for _ in 0..2 {
            let b = child_of(&parent, EASY, &miner.address, vec![]);
            assert!(submit(&mut chain, &b).is_accepted());
            parent = b;
        }
        let required = chain.expected_target_for_child(&chain.tip_hash()).unwrap();
        let limit = Target::from_bits(EASY).unwrap();
        assert!(required.is_harder_or_equal(&limit));
        assert_ne!(required, limit);

        // A child declaring the old easy target is now refused
        let lazy = child_of(&parent, EASY, &miner.address, vec![]);
        let sub = submit(&mut chain, &lazy);
        assert!(matches!(
            sub.result,
            AcceptResult::Rejected(BlockError::Consensus(ConsensusError::TargetTooEasy { .. }))
        ));
    }

    #[test]
    fn test_expired_orphans_are_dropped() {
        let mut chain = builder();
        let miner = KeyPair::generate();
        let genesis = chain.block_at_height(0).unwrap();
        let b1 = child_of(&genesis, EASY, &miner.address, vec![]);
        let b2 = child_of(&b1, EASY, &miner.address, vec![]);
        submit(&mut chain, &b2);
        assert_eq!(chain.orphan_count(), 1);

        let later = Instant::now() + crate::config::ORPHAN_TTL + Duration::from_secs(1);
        chain.orphans_mut().expire(later);
        assert_eq!(chain.orphan_count(), 0);
    }
}
