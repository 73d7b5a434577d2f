// Derived ledger state: balances and nonces of the canonical chain

use crate::config::ConsensusParams;
use crate::consensus::ConsensusError;
use crate::core::{Address, Block, Transaction};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: u64,
    /// Number of transfers sent; the next transfer must carry this value
    pub nonce: u64,
}

/// Balances and nonces obtained by replaying a chain from genesis
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    accounts: BTreeMap<Address, Account>,
}

/// Account updates computed against a ledger but not yet written to it
#[derive(Debug, Default)]
pub struct LedgerChanges(BTreeMap<Address, Account>);

/// Accounts one block touched, before and after it was applied.
///
/// Replaying or reverting a delta needs no validation, so switching branches
/// only costs the blocks between the two tips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDelta {
    before: BTreeMap<Address, Option<Account>>,
    after: BTreeMap<Address, Account>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay a canonical path. A leading genesis block is skipped.
    pub fn from_canonical_chain<'a, I>(blocks: I, params: &ConsensusParams) -> Result<Self, ConsensusError>
    where
        I: IntoIterator<Item = &'a Block>,
    {
        let mut ledger = Self::new();
        for block in blocks {
            if block.is_genesis() {
                continue;
            }
            ledger.apply_block(block, params)?;
        }
        Ok(ledger)
    }

    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.account(address).balance
    }

    pub fn nonce_of(&self, address: &Address) -> u64 {
        self.account(address).nonce
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    pub fn total_supply(&self) -> u64 {
        self.accounts.values().map(|a| a.balance).sum()
    }

    pub fn sandbox(&self) -> LedgerSandbox<'_> {
        LedgerSandbox {
            base: self,
            touched: BTreeMap::new(),
        }
    }

    /// Compute the effect of a block without modifying the ledger
    pub fn check_block(&self, block: &Block, params: &ConsensusParams) -> Result<LedgerChanges, ConsensusError> {
        let fees = block.total_fees().ok_or(ConsensusError::BalanceOverflow)?;
        let mut sandbox = self.sandbox();

        for tx in &block.transactions {
            if tx.is_coinbase() {
                let expected = params
                    .block_reward(block.height())
                    .checked_add(fees)
                    .ok_or(ConsensusError::BalanceOverflow)?;
                if tx.amount != expected {
                    return Err(ConsensusError::InvalidCoinbaseAmount {
                        expected,
                        got: tx.amount,
                    });
                }
            }
            sandbox.apply(tx)?;
        }

        Ok(sandbox.into_changes())
    }

    pub fn commit(&mut self, changes: LedgerChanges) {
        self.accounts.extend(changes.0);
    }

    /// Delta that `changes` would make to this ledger
    pub fn delta(&self, changes: &LedgerChanges) -> BlockDelta {
        BlockDelta {
            before: changes
                .0
                .keys()
                .map(|address| (*address, self.accounts.get(address).copied()))
                .collect(),
            after: changes.0.clone(),
        }
    }

    pub fn redo(&mut self, delta: &BlockDelta) {
        self.accounts.extend(delta.after.iter().map(|(address, account)| (*address, *account)));
    }

    pub fn undo(&mut self, delta: &BlockDelta) {
        for (address, before) in &delta.before {
            match before {
                Some(account) => self.accounts.insert(*address, *account),
                None => self.accounts.remove(address),
            };
        }
    }

    /// Apply a block atomically: on error the ledger is unchanged
    pub fn apply_block(&mut self, block: &Block, params: &ConsensusParams) -> Result<(), ConsensusError> {
        let changes = self.check_block(block, params)?;
        self.commit(changes);
        Ok(())
    }
}

/// Copy-on-write view used to try transactions against a ledger
pub struct LedgerSandbox<'a> {
    base: &'a LedgerState,
    touched: BTreeMap<Address, Account>,
}

impl LedgerSandbox<'_> {
    pub fn account(&self, address: &Address) -> Account {
        self.touched
            .get(address)
            .copied()
            .unwrap_or_else(|| self.base.account(address))
    }

    /// Apply one transaction. Coinbase amounts are credited as-is.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), ConsensusError> {
        if let Some(from) = tx.sender_address() {
            let mut sender = self.account(&from);
            if tx.nonce != sender.nonce {
                return Err(ConsensusError::InvalidNonce {
                    address: from,
                    expected: sender.nonce,
                    got: tx.nonce,
                });
            }
            let needed = tx.total_debit().ok_or(ConsensusError::BalanceOverflow)?;
            if sender.balance < needed {
                return Err(ConsensusError::InsufficientFunds {
                    address: from,
                    balance: sender.balance,
                    needed,
                });
            }
            sender.balance -= needed;
            sender.nonce += 1;
            self.touched.insert(from, sender);
        }

        let mut recipient = self.account(&tx.recipient);
        recipient.balance = recipient
            .balance
            .checked_add(tx.amount)
            .ok_or(ConsensusError::BalanceOverflow)?;
        self.touched.insert(tx.recipient, recipient);
        Ok(())
    }

    /// Apply `tx` only if it succeeds; report whether it did
    pub fn try_apply(&mut self, tx: &Transaction) -> bool {
        let snapshot = self.touched.clone();
        match self.apply(tx) {
            Ok(()) => true,
            Err(_) => {
                self.touched = snapshot;
                false
            }
        }
    }

    pub fn into_changes(self) -> LedgerChanges {
        LedgerChanges(self.touched)
    }
}
