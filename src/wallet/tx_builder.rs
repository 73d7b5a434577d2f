// Transaction builder

use crate::chain::Account;
use crate::core::{Address, Transaction};
use crate::wallet::Keystore;

/// Builds signed transfers from keys held in a keystore
pub struct TransactionBuilder<'a> {
    keystore: &'a Keystore,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(keystore: &'a Keystore) -> Self {
        Self { keystore }
    }

    /// Build a transfer of `amount` plus `fee` from `from`, whose confirmed
    /// state is `account`. The transfer takes the account's next nonce.
    pub fn build(
        &self,
        from: &Address,
        to: Address,
        amount: u64,
        fee: u64,
        account: Account,
    ) -> Result<Transaction, String> {
        let keypair = self
            .keystore
            .get_keypair(from)
            .ok_or("Sender address not found in keystore")?;

        if amount == 0 {
            return Err("Amount must be positive".to_string());
        }
        let needed = amount.checked_add(fee).ok_or("Amount plus fee overflows")?;
        if needed > account.balance {
            return Err(format!("Insufficient funds: have {}, need {}", account.balance, needed));
        }

        let tx = Transaction::create(keypair, to, amount, fee, account.nonce);
        log::debug!("Built transaction {} ({} -> {}, nonce {})", tx.txid().short(), from, to, account.nonce);
        Ok(tx)
    }
}
