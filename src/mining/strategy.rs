// Transaction selection for new block templates

use crate::chain::LedgerState;
use crate::core::{Block, Transaction};
use clap::ValueEnum;
use std::cmp::Reverse;

/// Decides which pending transactions go into the next block
pub trait MiningStrategy: Send + Sync {
    /// Pick at most `max` transactions from `pending` (arrival order) that
    /// apply cleanly, in order, on top of `ledger`
    fn select_transactions(&self, pending: &[Transaction], ledger: &LedgerState, max: usize) -> Vec<Transaction>;

    /// Whether a new canonical tip should abandon the current template
    fn on_new_tip(&self, _tip: &Block) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

/// Strategy selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    Fifo,
    FeePriority,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn MiningStrategy> {
        match self {
            StrategyKind::Fifo => Box::new(Fifo),
            StrategyKind::FeePriority => Box::new(FeePriority),
        }
    }
}

/// Oldest transactions first
pub struct Fifo;

/// Highest fee first; equal fees keep arrival order
pub struct FeePriority;

impl MiningStrategy for Fifo {
    fn select_transactions(&self, pending: &[Transaction], ledger: &LedgerState, max: usize) -> Vec<Transaction> {
        fill(pending.iter().collect(), ledger, max)
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

impl MiningStrategy for FeePriority {
    fn select_transactions(&self, pending: &[Transaction], ledger: &LedgerState, max: usize) -> Vec<Transaction> {
        let mut ordered: Vec<&Transaction> = pending.iter().collect();
        // Stable sort keeps arrival order among equal fees
        ordered.sort_by_key(|tx| Reverse(tx.fee));
        fill(ordered, ledger, max)
    }

    fn name(&self) -> &'static str {
        "fee-priority"
    }
}

/// Take transactions in preference order while they apply on a sandbox.
///
/// A transfer whose nonce predecessor has not been taken yet is skipped and
/// retried in the next pass, so a high-fee successor never blocks its sender.
fn fill(mut candidates: Vec<&Transaction>, ledger: &LedgerState, max: usize) -> Vec<Transaction> {
    let mut sandbox = ledger.sandbox();
    let mut selected = Vec::new();
    candidates.retain(|tx| !tx.is_coinbase());

    loop {
        let before = selected.len();
        candidates.retain(|tx| {
            if selected.len() >= max {
                return true;
            }
            if sandbox.try_apply(tx) {
                selected.push((*tx).clone());
                false
            } else {
                true
            }
        });
        if selected.len() == before || selected.len() >= max || candidates.is_empty() {
            break;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::core::{Hash256, KeyPair};

    fn funded(owners: &[&KeyPair]) -> LedgerState {
        let params = ConsensusParams::regtest();
        let mut ledger = LedgerState::new();
        for (i, owner) in owners.iter().enumerate() {
            let height = i as u64 + 1;
            let coinbase = Transaction::coinbase(owner.address, params.block_reward(height), height);
            let block = Block::template(Hash256::zero(), height, height, 0x207fffff, vec![coinbase]);
            ledger.apply_block(&block, &params).unwrap();
        }
        ledger
    }

    #[test]
    fn test_fifo_keeps_arrival_order() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&[&alice, &bob]);

        let a = Transaction::create(&alice, bob.address, 10, 1, 0);
        let b = Transaction::create(&bob, alice.address, 10, 9, 0);
        let picked = Fifo.select_transactions(&[a.clone(), b.clone()], &ledger, 10);
        assert_eq!(picked, vec![a, b]);
    }

    #[test]
    fn test_fee_priority_orders_by_fee() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&[&alice, &bob]);

        let low = Transaction::create(&alice, bob.address, 10, 1, 0);
        let high = Transaction::create(&bob, alice.address, 10, 9, 0);
        let picked = FeePriority.select_transactions(&[low.clone(), high.clone()], &ledger, 10);
        assert_eq!(picked, vec![high.clone(), low]);

        let only = FeePriority.select_transactions(&[high.clone()], &ledger, 1);
        assert_eq!(only, vec![high]);
    }

    #[test]
    fn test_successor_waits_for_its_predecessor() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ledger = funded(&[&alice]);

        let first = Transaction::create(&alice, bob.address, 10, 1, 0);
        let second = Transaction::create(&alice, bob.address, 10, 50, 1);
        let picked = FeePriority.select_transactions(&[first.clone(), second.clone()], &ledger, 10);
        assert_eq!(picked, vec![first, second]);
    }

    #[test]
    fn test_selection_never_double_spends() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let ledger = funded(&[&alice]);

        let to_bob = Transaction::create(&alice, bob.address, 900, 0, 0);
        let to_carol = Transaction::create(&alice, carol.address, 900, 5, 0);
        let picked = FeePriority.select_transactions(&[to_bob, to_carol.clone()], &ledger, 10);
        assert_eq!(picked, vec![to_carol]);

        // The selection always applies on the parent ledger
        let mut sandbox = ledger.sandbox();
        assert!(picked.iter().all(|tx| sandbox.try_apply(tx)));
    }

    #[test]
    fn test_kind_builds_named_strategy() {
        assert_eq!(StrategyKind::Fifo.build().name(), "fifo");
        assert_eq!(StrategyKind::FeePriority.build().name(), "fee-priority");
    }
}
