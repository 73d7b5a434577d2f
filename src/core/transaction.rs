// Transaction data structures
//
// Accounts carry a balance and a nonce. A transfer spends from the sender's
// balance and must carry the sender's next nonce, so replaying a transfer or
// spending twice with the same nonce is rejected by the ledger. A coinbase has
// no sender and uses the block height as its nonce.

use crate::consensus::ValidationError;
use crate::core::serialize::{
    read_array, read_u32, read_u64, read_var_bytes, write_var_bytes,
};
use crate::core::{Address, Hash256, KeyPair, PublicKey, Serializable, Signature, crypto, hash256};
use std::io::Read;

/// Current transaction format version
pub const TX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    /// `None` for a coinbase
    pub sender: Option<PublicKey>,
    pub recipient: Address,
    pub amount: u64,
    /// Paid to the miner of the including block
    pub fee: u64,
    /// Sender sequence number, or block height for a coinbase
    pub nonce: u64,
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Create and sign a transfer
    pub fn create(sender: &KeyPair, recipient: Address, amount: u64, fee: u64, nonce: u64) -> Self {
        let mut tx = Self {
            version: TX_VERSION,
            sender: Some(sender.public_key),
            recipient,
            amount,
            fee,
            nonce,
            signature: None,
        };
        tx.signature = Some(sender.sign(&tx.signing_bytes()));
        tx
    }

    /// Create the reward transaction for a block at `height`
    pub fn coinbase(recipient: Address, amount: u64, height: u64) -> Self {
        Self {
            version: TX_VERSION,
            sender: None,
            recipient,
            amount,
            fee: 0,
            nonce: height,
            signature: None,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender.is_none()
    }

    /// Address debited by this transaction, if any
    pub fn sender_address(&self) -> Option<Address> {
        self.sender.as_ref().map(crypto::derive_address)
    }

    /// Transaction id: hash256 of the full encoding
    pub fn txid(&self) -> Hash256 {
        hash256(&self.serialize())
    }

    /// Amount plus fee, or `None` on overflow
    pub fn total_debit(&self) -> Option<u64> {
        self.amount.checked_add(self.fee)
    }

    /// Bytes covered by the signature: everything except the signature itself
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        self.encode_unsigned(&mut buf);
        buf
    }

    fn encode_unsigned(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        match &self.sender {
            Some(pk) => write_var_bytes(buf, &pk.serialize()),
            None => write_var_bytes(buf, &[]),
        }
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.fee.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }

    /// Context-free checks: shape, amounts and signature
    pub fn verify(&self) -> Result<(), ValidationError> {
        if self.version != TX_VERSION {
            return Err(ValidationError::UnsupportedVersion(self.version));
        }

        let Some(sender) = &self.sender else {
            if self.signature.is_some() {
                return Err(ValidationError::SignedCoinbase);
            }
            if self.fee != 0 {
                return Err(ValidationError::CoinbaseFee);
            }
            return Ok(());
        };

        let signature = self.signature.as_ref().ok_or(ValidationError::MissingSignature)?;
        if self.amount == 0 {
            return Err(ValidationError::ZeroAmount);
        }
        if self.total_debit().is_none() {
            return Err(ValidationError::AmountOverflow);
        }
        if crypto::derive_address(sender) == self.recipient {
            return Err(ValidationError::SelfTransfer);
        }
        if !crypto::verify(sender, &self.signing_bytes(), signature) {
            return Err(ValidationError::InvalidSignature);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }
}

impl Serializable for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_unsigned(buf);
        match &self.signature {
            Some(sig) => write_var_bytes(buf, &sig.to_bytes()),
            None => write_var_bytes(buf, &[]),
        }
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Self, String> {
        let version = read_u32(reader).map_err(|e| format!("tx version: {}", e))?;

        let sender_bytes = read_var_bytes(reader, PublicKey::LEN)
            .map_err(|e| format!("tx sender: {}", e))?;
        let sender = match sender_bytes.len() {
            0 => None,
            _ => Some(PublicKey::from_slice(&sender_bytes).map_err(|e| e.to_string())?),
        };

        let recipient = Address::from_pubkey_hash(
            read_array(reader).map_err(|e| format!("tx recipient: {}", e))?,
        );
        let amount = read_u64(reader).map_err(|e| format!("tx amount: {}", e))?;
        let fee = read_u64(reader).map_err(|e| format!("tx fee: {}", e))?;
        let nonce = read_u64(reader).map_err(|e| format!("tx nonce: {}", e))?;

        let sig_bytes = read_var_bytes(reader, Signature::LEN)
            .map_err(|e| format!("tx signature: {}", e))?;
        let signature = match sig_bytes.len() {
            0 => None,
            _ => Some(Signature::from_slice(&sig_bytes).map_err(|e| e.to_string())?),
        };

        Ok(Self {
            version,
            sender,
            recipient,
            amount,
            fee,
            nonce,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_signs_transfer() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let tx = Transaction::create(&alice, bob.address, 10, 1, 0);

        assert!(!tx.is_coinbase());
        assert_eq!(tx.sender_address(), Some(alice.address));
        assert_eq!(tx.verify(), Ok(()));
    }

    #[test]
    fn test_tampered_amount_breaks_signature() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut tx = Transaction::create(&alice, bob.address, 10, 0, 0);
        tx.amount = 1_000;
        assert_eq!(tx.verify(), Err(ValidationError::InvalidSignature));
    }

    #[test]
    fn test_signature_from_other_key_is_rejected() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut tx = Transaction::create(&alice, bob.address, 10, 0, 0);
        tx.signature = Some(mallory.sign(&tx.signing_bytes()));
        assert!(!tx.is_valid());
    }

    #[test]
    fn test_shape_rules() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let zero = Transaction::create(&alice, bob.address, 0, 0, 0);
        assert_eq!(zero.verify(), Err(ValidationError::ZeroAmount));

        let to_self = Transaction::create(&alice, alice.address, 5, 0, 0);
        assert_eq!(to_self.verify(), Err(ValidationError::SelfTransfer));

        let mut unsigned = Transaction::create(&alice, bob.address, 5, 0, 0);
        unsigned.signature = None;
        assert_eq!(unsigned.verify(), Err(ValidationError::MissingSignature));

        let overflow = Transaction::create(&alice, bob.address, u64::MAX, 1, 0);
        assert_eq!(overflow.verify(), Err(ValidationError::AmountOverflow));
    }

    #[test]
    fn test_coinbase_rules() {
        let miner = KeyPair::generate();
        let cb = Transaction::coinbase(miner.address, 1000, 7);
        assert!(cb.is_coinbase());
        assert_eq!(cb.nonce, 7);
        assert_eq!(cb.verify(), Ok(()));

        let mut with_fee = cb.clone();
        with_fee.fee = 3;
        assert_eq!(with_fee.verify(), Err(ValidationError::CoinbaseFee));

        let mut signed = cb;
        signed.signature = Some(miner.sign(b"x"));
        assert_eq!(signed.verify(), Err(ValidationError::SignedCoinbase));
    }

    #[test]
    fn test_coinbase_ids_differ_by_height() {
        let miner = KeyPair::generate();
        let a = Transaction::coinbase(miner.address, 1000, 1);
        let b = Transaction::coinbase(miner.address, 1000, 2);
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn test_encoding_preserves_txid() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let tx = Transaction::create(&alice, bob.address, 42, 2, 9);
        let decoded = Transaction::deserialize(&tx.serialize()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_decode_rejects_bad_sender_length() {
        let miner = KeyPair::generate();
        let mut bytes = Transaction::coinbase(miner.address, 1, 1).serialize();
        // sender length prefix sits right after the 4-byte version
        bytes[4] = 5;
        assert!(Transaction::deserialize(&bytes).is_err());
    }
}
