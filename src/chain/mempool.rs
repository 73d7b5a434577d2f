// Pool of valid transactions waiting to be mined

use crate::chain::LedgerState;
use crate::config::MAX_POOL_SIZE;
use crate::consensus::ValidationError;
use crate::core::{Address, Hash256, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Why a transaction was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRejection {
    AlreadyKnown,
    Coinbase,
    Invalid(ValidationError),
    /// Another pooled transaction already uses this sender nonce
    Conflict { existing: Hash256 },
    StaleNonce { expected: u64, got: u64 },
    NonceGap { expected: u64, got: u64 },
    InsufficientFunds { balance: u64, needed: u64 },
    PoolFull,
}

impl fmt::Display for TxRejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxRejection::AlreadyKnown => write!(f, "Transaction already in pool"),
            TxRejection::Coinbase => write!(f, "Coinbase transactions are not relayed"),
            TxRejection::Invalid(e) => write!(f, "Invalid transaction: {}", e),
            TxRejection::Conflict { existing } => {
                write!(f, "Conflicts with pooled transaction {}", existing)
            }
            TxRejection::StaleNonce { expected, got } => {
                write!(f, "Nonce {} already used (next is {})", got, expected)
            }
            TxRejection::NonceGap { expected, got } => {
                write!(f, "Nonce {} leaves a gap (next is {})", got, expected)
            }
            TxRejection::InsufficientFunds { balance, needed } => {
                write!(f, "Pending spends {} exceed balance {}", needed, balance)
            }
            TxRejection::PoolFull => write!(f, "Transaction pool is full"),
        }
    }
}

impl std::error::Error for TxRejection {}

struct PoolEntry {
    tx: Transaction,
    seq: u64,
}

pub struct Mempool {
    txs: HashMap<Hash256, PoolEntry>,
    by_sender: HashMap<Address, BTreeMap<u64, Hash256>>,
    next_seq: u64,
    max_size: usize,
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            txs: HashMap::new(),
            by_sender: HashMap::new(),
            next_seq: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.txs.get(txid).map(|entry| &entry.tx)
    }

    /// Number of pooled transfers from `sender`
    pub fn queued_for(&self, sender: &Address) -> usize {
        self.by_sender.get(sender).map_or(0, BTreeMap::len)
    }

    /// Pending transactions in arrival order
    pub fn pending(&self) -> Vec<Transaction> {
        let mut entries: Vec<&PoolEntry> = self.txs.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.tx.clone()).collect()
    }

    /// Admit a transaction that is valid on top of `ledger` and the pool.
    /// Admitting a transaction twice reports `AlreadyKnown` and changes nothing.
    pub fn admit(&mut self, tx: Transaction, ledger: &LedgerState) -> Result<Hash256, TxRejection> {
        let seq = self.next_seq;
        let txid = self.insert_checked(tx, seq, ledger)?;
        self.next_seq += 1;
        Ok(txid)
    }

    fn insert_checked(&mut self, tx: Transaction, seq: u64, ledger: &LedgerState) -> Result<Hash256, TxRejection> {
        let txid = tx.txid();
        if self.txs.contains_key(&txid) {
            return Err(TxRejection::AlreadyKnown);
        }
        let Some(sender) = tx.sender_address() else {
            return Err(TxRejection::Coinbase);
        };
        tx.verify().map_err(TxRejection::Invalid)?;
        if self.txs.len() >= self.max_size {
            return Err(TxRejection::PoolFull);
        }

        let account = ledger.account(&sender);
        if tx.nonce < account.nonce {
            return Err(TxRejection::StaleNonce {
                expected: account.nonce,
                got: tx.nonce,
            });
        }

        let queued = self.by_sender.get(&sender);
        if let Some(existing) = queued.and_then(|q| q.get(&tx.nonce)) {
            return Err(TxRejection::Conflict { existing: *existing });
        }

        let queued_count = queued.map_or(0, |q| q.len() as u64);
        let expected = account.nonce + queued_count;
        if tx.nonce != expected {
            return Err(TxRejection::NonceGap {
                expected,
                got: tx.nonce,
            });
        }

        let queued_debit = queued
            .into_iter()
            .flat_map(|q| q.values())
            .filter_map(|id| self.txs.get(id))
            .try_fold(0u64, |acc, entry| acc.checked_add(entry.tx.total_debit()?));
        let needed = queued_debit
            .and_then(|d| d.checked_add(tx.total_debit()?))
            .unwrap_or(u64::MAX);
        if needed > account.balance {
            return Err(TxRejection::InsufficientFunds {
                balance: account.balance,
                needed,
            });
        }

        self.by_sender.entry(sender).or_default().insert(tx.nonce, txid);
        self.txs.insert(txid, PoolEntry { tx, seq });
        Ok(txid)
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let entry = self.txs.remove(txid)?;
        if let Some(sender) = entry.tx.sender_address() {
            if let Some(queue) = self.by_sender.get_mut(&sender) {
                queue.remove(&entry.tx.nonce);
                if queue.is_empty() {
                    self.by_sender.remove(&sender);
                }
            }
        }
        Some(entry.tx)
    }

    /// Re-check the pool against a new canonical ledger.
    ///
    /// `resurrected` are transactions of blocks that left the canonical chain;
    /// they are offered back ahead of the current pool contents. Returns the
    /// number of transactions that did not survive.
    pub fn revalidate(&mut self, ledger: &LedgerState, resurrected: Vec<Transaction>) -> usize {
        let mut candidates: Vec<(u64, Transaction)> = Vec::with_capacity(self.len() + resurrected.len());
        for tx in resurrected.into_iter().filter(|tx| !tx.is_coinbase()) {
            candidates.push((0, tx));
        }
        candidates.extend(self.txs.drain().map(|(_, entry)| (entry.seq, entry.tx)));
        self.by_sender.clear();

        // Nonce order per sender keeps queues contiguous; arrival order is kept in seq
        candidates.sort_by_key(|(seq, tx)| (tx.nonce, *seq));

        let offered = candidates.len();
        let mut kept = 0;
        for (seq, tx) in candidates {
            if self.insert_checked(tx, seq, ledger).is_ok() {
                kept += 1;
            }
        }
        offered - kept
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::core::{Block, KeyPair};

    fn funded(owner: &KeyPair, amount: u64) -> LedgerState {
        let params = ConsensusParams::regtest();
        let coinbase = Transaction::coinbase(owner.address, params.block_reward(1), 1);
        let block = Block::template(Hash256::zero(), 1, 1, 0x207fffff, vec![coinbase]);
        let mut ledger = LedgerState::new();
        ledger.apply_block(&block, &params).unwrap();
        assert_eq!(ledger.balance_of(&owner.address), amount);
        ledger
    }

    #[test]
    fn test_admission_is_idempotent() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&alice, 1000);
        let mut pool = Mempool::new();

        let tx = Transaction::create(&alice, bob.address, 10, 1, 0);
        let id = pool.admit(tx.clone(), &ledger).unwrap();
        assert_eq!(pool.admit(tx, &ledger), Err(TxRejection::AlreadyKnown));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&id));
    }

    #[test]
    fn test_conflicting_nonce_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let ledger = funded(&alice, 1000);
        let mut pool = Mempool::new();

        let first = pool.admit(Transaction::create(&alice, bob.address, 10, 0, 0), &ledger).unwrap();
        let second = pool.admit(Transaction::create(&alice, carol.address, 10, 0, 0), &ledger);
        assert_eq!(second, Err(TxRejection::Conflict { existing: first }));
    }

    #[test]
    fn test_nonce_and_balance_rules() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&alice, 1000);
        let mut pool = Mempool::new();

        let gap = pool.admit(Transaction::create(&alice, bob.address, 10, 0, 3), &ledger);
        assert_eq!(gap, Err(TxRejection::NonceGap { expected: 0, got: 3 }));

        pool.admit(Transaction::create(&alice, bob.address, 600, 0, 0), &ledger).unwrap();
        let over = pool.admit(Transaction::create(&alice, bob.address, 500, 0, 1), &ledger);
        assert_eq!(over, Err(TxRejection::InsufficientFunds { balance: 1000, needed: 1100 }));

        let coinbase = Transaction::coinbase(bob.address, 5, 9);
        assert_eq!(pool.admit(coinbase, &ledger), Err(TxRejection::Coinbase));

        let mut forged = Transaction::create(&alice, bob.address, 1, 0, 1);
        forged.amount = 2;
        assert_eq!(
            pool.admit(forged, &ledger),
            Err(TxRejection::Invalid(ValidationError::InvalidSignature))
        );
    }

    #[test]
    fn test_pending_in_arrival_order() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&alice, 1000);
        let mut pool = Mempool::new();

        let a = Transaction::create(&alice, bob.address, 1, 0, 0);
        let b = Transaction::create(&alice, bob.address, 2, 0, 1);
        pool.admit(a.clone(), &ledger).unwrap();
        pool.admit(b.clone(), &ledger).unwrap();
        assert_eq!(pool.pending(), vec![a, b]);
    }

    #[test]
    fn test_revalidate_drops_confirmed_and_restores_disconnected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let params = ConsensusParams::regtest();
        let ledger = funded(&alice, 1000);
        let mut pool = Mempool::new();

        let t0 = Transaction::create(&alice, bob.address, 10, 0, 0);
        let t1 = Transaction::create(&alice, bob.address, 20, 0, 1);
        pool.admit(t0.clone(), &ledger).unwrap();
        pool.admit(t1.clone(), &ledger).unwrap();

        // t0 gets mined
        let mut mined = ledger.clone();
        let block = Block::template(Hash256::zero(), 2, 2, 0x207fffff, vec![t0.clone()]);
        mined.apply_block(&block, &params).unwrap();
        assert_eq!(pool.revalidate(&mined, Vec::new()), 1);
        assert_eq!(pool.pending(), vec![t1.clone()]);

        // The block is reorganized away: t0 comes back ahead of t1
        assert_eq!(pool.revalidate(&ledger, vec![t0.clone()]), 0);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.pending(), vec![t0, t1]);
    }

    #[test]
    fn test_pool_capacity() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&alice, 1000);
        let mut pool = Mempool::with_capacity(1);

        pool.admit(Transaction::create(&alice, bob.address, 1, 0, 0), &ledger).unwrap();
        let full = pool.admit(Transaction::create(&alice, bob.address, 1, 0, 1), &ledger);
        assert_eq!(full, Err(TxRejection::PoolFull));
    }
}
