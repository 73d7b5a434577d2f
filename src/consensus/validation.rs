// Block and transaction validation rules and their error types

use crate::config::{MAX_BLOCK_TRANSACTIONS, MAX_FUTURE_BLOCK_TIME};
use crate::consensus::pow::{ProofOfWork, Target};
use crate::core::{Address, Block, BlockHeader, Hash256};
use std::collections::HashSet;
use std::fmt;

/// Malformed data: never valid in any chain context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    UnsupportedVersion(u32),
    /// Transfer without a signature
    MissingSignature,
    /// Signature does not verify against the sender key
    InvalidSignature,
    SignedCoinbase,
    CoinbaseFee,
    ZeroAmount,
    AmountOverflow,
    SelfTransfer,
    /// Merkle root doesn't match the transaction list
    InvalidMerkleRoot,
    DuplicateTransaction(Hash256),
    TooManyTransactions(usize),
    MultipleCoinbase,
    CoinbaseNotFirst,
    /// Only the built-in genesis may have the zero hash as parent
    UnexpectedGenesis,
    InvalidHeight { expected: u64, got: u64 },
    TimestampNotAfterParent,
    TimestampTooFarInFuture,
    InvalidBits(u32),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::UnsupportedVersion(v) => write!(f, "Unsupported version {}", v),
            ValidationError::MissingSignature => write!(f, "Missing signature"),
            ValidationError::InvalidSignature => write!(f, "Invalid signature"),
            ValidationError::SignedCoinbase => write!(f, "Coinbase must not be signed"),
            ValidationError::CoinbaseFee => write!(f, "Coinbase must not pay a fee"),
            ValidationError::ZeroAmount => write!(f, "Transfer amount must be positive"),
            ValidationError::AmountOverflow => write!(f, "Amount plus fee overflows"),
            ValidationError::SelfTransfer => write!(f, "Sender and recipient are the same"),
            ValidationError::InvalidMerkleRoot => write!(f, "Invalid merkle root"),
            ValidationError::DuplicateTransaction(id) => write!(f, "Duplicate transaction {}", id),
            ValidationError::TooManyTransactions(n) => write!(f, "Too many transactions: {}", n),
            ValidationError::MultipleCoinbase => write!(f, "Multiple coinbase transactions"),
            ValidationError::CoinbaseNotFirst => write!(f, "Coinbase not in first position"),
            ValidationError::UnexpectedGenesis => write!(f, "Block claims to be a genesis block"),
            ValidationError::InvalidHeight { expected, got } => {
                write!(f, "Invalid height: expected {}, got {}", expected, got)
            }
            ValidationError::TimestampNotAfterParent => write!(f, "Timestamp not after parent"),
            ValidationError::TimestampTooFarInFuture => write!(f, "Timestamp too far in the future"),
            ValidationError::InvalidBits(bits) => write!(f, "Invalid compact target {:#010x}", bits),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Well-formed data that breaks a rule of the chain it extends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Declared target is easier than the chain requires
    TargetTooEasy { required: u32, declared: u32 },
    InsufficientProofOfWork,
    /// Wrong sequence number: a replay or a double spend
    InvalidNonce { address: Address, expected: u64, got: u64 },
    InsufficientFunds { address: Address, balance: u64, needed: u64 },
    InvalidCoinbaseAmount { expected: u64, got: u64 },
    BalanceOverflow,
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConsensusError::TargetTooEasy { required, declared } => write!(
                f,
                "Target {:#010x} easier than required {:#010x}",
                declared, required
            ),
            ConsensusError::InsufficientProofOfWork => write!(f, "Insufficient proof of work"),
            ConsensusError::InvalidNonce { address, expected, got } => write!(
                f,
                "Invalid nonce for {}: expected {}, got {}",
                address, expected, got
            ),
            ConsensusError::InsufficientFunds { address, balance, needed } => write!(
                f,
                "Insufficient funds for {}: balance {}, needed {}",
                address, balance, needed
            ),
            ConsensusError::InvalidCoinbaseAmount { expected, got } => write!(
                f,
                "Invalid coinbase amount: expected {}, got {}",
                expected, got
            ),
            ConsensusError::BalanceOverflow => write!(f, "Balance overflow"),
        }
    }
}

impl std::error::Error for ConsensusError {}

/// Reason a block was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    Validation(ValidationError),
    Consensus(ConsensusError),
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockError::Validation(e) => write!(f, "validation: {}", e),
            BlockError::Consensus(e) => write!(f, "consensus: {}", e),
        }
    }
}

impl std::error::Error for BlockError {}

impl From<ValidationError> for BlockError {
    fn from(e: ValidationError) -> Self {
        BlockError::Validation(e)
    }
}

impl From<ConsensusError> for BlockError {
    fn from(e: ConsensusError) -> Self {
        BlockError::Consensus(e)
    }
}

/// Context-free block checks: layout, Merkle commitment and transaction validity
pub fn check_structure(block: &Block) -> Result<(), ValidationError> {
    if block.header.version != 1 {
        return Err(ValidationError::UnsupportedVersion(block.header.version));
    }
    if block.is_genesis() {
        return Err(ValidationError::UnexpectedGenesis);
    }

    let count = block.transactions.len();
    if count > MAX_BLOCK_TRANSACTIONS {
        return Err(ValidationError::TooManyTransactions(count));
    }

    let coinbase_positions: Vec<usize> = block
        .transactions
        .iter()
        .enumerate()
        .filter(|(_, tx)| tx.is_coinbase())
        .map(|(i, _)| i)
        .collect();
    match coinbase_positions.as_slice() {
        [] | [0] => {}
        [_] => return Err(ValidationError::CoinbaseNotFirst),
        _ => return Err(ValidationError::MultipleCoinbase),
    }

    // Duplicate ids would let two different lists share a Merkle root
    let txids = block.txids();
    let mut seen = HashSet::with_capacity(count);
    for id in &txids {
        if !seen.insert(*id) {
            return Err(ValidationError::DuplicateTransaction(*id));
        }
    }

    if crate::core::merkle::build_root(&txids) != block.header.merkle_root {
        return Err(ValidationError::InvalidMerkleRoot);
    }

    for tx in &block.transactions {
        tx.verify()?;
    }

    Ok(())
}

/// Checks against the parent header: height, time and proof of work
pub fn check_context(
    block: &Block,
    parent: &BlockHeader,
    required: &Target,
    now: u64,
) -> Result<(), BlockError> {
    let header = &block.header;

    let expected_height = parent.height + 1;
    if header.height != expected_height {
        return Err(ValidationError::InvalidHeight {
            expected: expected_height,
            got: header.height,
        }
        .into());
    }

    if header.timestamp <= parent.timestamp {
        return Err(ValidationError::TimestampNotAfterParent.into());
    }
    if header.timestamp > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
        return Err(ValidationError::TimestampTooFarInFuture.into());
    }

    let declared = Target::from_bits(header.bits).ok_or(ValidationError::InvalidBits(header.bits))?;
    if !declared.is_harder_or_equal(required) {
        return Err(ConsensusError::TargetTooEasy {
            required: required.to_bits(),
            declared: header.bits,
        }
        .into());
    }

    if !ProofOfWork::new(declared).validate(block) {
        return Err(ConsensusError::InsufficientProofOfWork.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::POW_LIMIT_BITS;
    use crate::consensus::pow::CancelToken;
    use crate::core::{KeyPair, Transaction};

    fn parent_header() -> BlockHeader {
        Block::genesis(POW_LIMIT_BITS, 1_000).header
    }

    fn solved(mut block: Block) -> Block {
        let target = Target::from_bits(block.header.bits).unwrap();
        let result = ProofOfWork::new(target).search(&block, 0..u64::MAX, &CancelToken::new());
        block.header.nonce = result.nonce().unwrap();
        block
    }

    fn child(txs: Vec<Transaction>) -> Block {
        let parent = parent_header();
        Block::template(parent.hash(), 1, parent.timestamp + 10, POW_LIMIT_BITS, txs)
    }

    #[test]
    fn test_structure_accepts_well_formed_block() {
        let miner = KeyPair::generate();
        let block = child(vec![Transaction::coinbase(miner.address, 1000, 1)]);
        assert_eq!(check_structure(&block), Ok(()));
    }

    #[test]
    fn test_structure_rejects_bad_merkle_root() {
        let miner = KeyPair::generate();
        let mut block = child(vec![Transaction::coinbase(miner.address, 1000, 1)]);
        block.header.merkle_root = Hash256::new([9u8; 32]);
        assert_eq!(check_structure(&block), Err(ValidationError::InvalidMerkleRoot));
    }

    #[test]
    fn test_structure_rejects_coinbase_placement() {
        let miner = KeyPair::generate();
        let bob = KeyPair::generate();
        let transfer = Transaction::create(&miner, bob.address, 1, 0, 0);

        let late = child(vec![transfer.clone(), Transaction::coinbase(miner.address, 1000, 1)]);
        assert_eq!(check_structure(&late), Err(ValidationError::CoinbaseNotFirst));

        let two = child(vec![
            Transaction::coinbase(miner.address, 1000, 1),
            Transaction::coinbase(bob.address, 1000, 1),
        ]);
        assert_eq!(check_structure(&two), Err(ValidationError::MultipleCoinbase));
    }

    #[test]
    fn test_structure_rejects_duplicates_and_bad_signatures() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let tx = Transaction::create(&alice, bob.address, 5, 0, 0);

        let dup = child(vec![tx.clone(), tx.clone()]);
        assert_eq!(check_structure(&dup), Err(ValidationError::DuplicateTransaction(tx.txid())));

        let mut forged = tx;
        forged.amount = 50;
        let bad = child(vec![forged]);
        assert_eq!(check_structure(&bad), Err(ValidationError::InvalidSignature));
    }

    #[test]
    fn test_structure_rejects_fake_genesis() {
        let block = Block::genesis(POW_LIMIT_BITS, 5_000);
        assert_eq!(check_structure(&block), Err(ValidationError::UnexpectedGenesis));
    }

    #[test]
    fn test_context_checks() {
        let parent = parent_header();
        let required = Target::from_bits(POW_LIMIT_BITS).unwrap();
        let now = parent.timestamp + 100;

        let good = solved(child(vec![]));
        assert_eq!(check_context(&good, &parent, &required, now), Ok(()));

        let mut wrong_height = child(vec![]);
        wrong_height.header.height = 5;
        let wrong_height = solved(wrong_height);
        assert!(matches!(
            check_context(&wrong_height, &parent, &required, now),
            Err(BlockError::Validation(ValidationError::InvalidHeight { expected: 1, got: 5 }))
        ));

        let mut stale = child(vec![]);
        stale.header.timestamp = parent.timestamp;
        let stale = solved(stale);
        assert_eq!(
            check_context(&stale, &parent, &required, now),
            Err(ValidationError::TimestampNotAfterParent.into())
        );

        let mut future = child(vec![]);
        future.header.timestamp = now + MAX_FUTURE_BLOCK_TIME + 1;
        let future = solved(future);
        assert_eq!(
            check_context(&future, &parent, &required, now),
            Err(ValidationError::TimestampTooFarInFuture.into())
        );
    }

    #[test]
    fn test_context_requires_target_and_work() {
        let parent = parent_header();
        let now = parent.timestamp + 100;
        let harder = Target::from_bits(0x1f7fffff).unwrap();

        // Declared target easier than required
        let easy = solved(child(vec![]));
        assert!(matches!(
            check_context(&easy, &parent, &harder, now),
            Err(BlockError::Consensus(ConsensusError::TargetTooEasy { .. }))
        ));

        // Find a nonce whose hash misses the declared target
        let required = Target::from_bits(POW_LIMIT_BITS).unwrap();
        let mut unsolved = child(vec![]);
        while required.is_met_by(&unsolved.hash()) {
            unsolved.header.nonce += 1;
        }
        assert_eq!(
            check_context(&unsolved, &parent, &required, now),
            Err(ConsensusError::InsufficientProofOfWork.into())
        );
    }
}
