// Block data structures

use crate::config::MAX_BLOCK_TRANSACTIONS;
use crate::core::merkle::{self, MerkleProof};
use crate::core::serialize::{read_hash, read_length, read_u32, read_u64, write_varint};
use crate::core::{Hash256, Serializable, Transaction, hash256};
use std::io::Read;

/// Encoded header length
pub const HEADER_SIZE: usize = 96;
/// Header bytes before the nonce; constant during a nonce search
pub const HEADER_PREFIX_SIZE: usize = HEADER_SIZE - 8;

/// Block header - 96 bytes, nonce last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix seconds
    pub timestamp: u64,
    /// Difficulty target (compact format)
    pub bits: u32,
    pub height: u64,
    pub nonce: u64,
}

impl BlockHeader {
    /// Encode everything except the nonce
    pub fn prefix_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.prev_block_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf
    }

    pub fn hash(&self) -> Hash256 {
        hash256(&self.serialize())
    }
}

impl Serializable for BlockHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.prefix_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Self, String> {
        let field = |name: &str, e: std::io::Error| format!("header {}: {}", name, e);
        Ok(Self {
            version: read_u32(reader).map_err(|e| field("version", e))?,
            prev_block_hash: read_hash(reader).map_err(|e| field("prev hash", e))?,
            merkle_root: read_hash(reader).map_err(|e| field("merkle root", e))?,
            timestamp: read_u64(reader).map_err(|e| field("timestamp", e))?,
            bits: read_u32(reader).map_err(|e| field("bits", e))?,
            height: read_u64(reader).map_err(|e| field("height", e))?,
            nonce: read_u64(reader).map_err(|e| field("nonce", e))?,
        })
    }
}

/// Block - header plus ordered transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Build an unsolved block whose Merkle root commits to `transactions`
    pub fn template(
        prev_block_hash: Hash256,
        height: u64,
        timestamp: u64,
        bits: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let header = BlockHeader {
            version: 1,
            prev_block_hash,
            merkle_root: Self::calculate_merkle_root(&transactions),
            timestamp,
            bits,
            height,
            nonce: 0,
        };
        Self::new(header, transactions)
    }

    /// The genesis block: no transactions, no parent, not mined
    pub fn genesis(bits: u32, timestamp: u64) -> Self {
        Self::template(Hash256::zero(), 0, timestamp, bits, Vec::new())
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let ids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        merkle::build_root(&ids)
    }

    /// Proof that the transaction at `index` is committed by this header
    pub fn merkle_proof(&self, index: usize) -> Option<MerkleProof> {
        merkle::build_proof(&self.txids(), index)
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_block_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash.is_zero()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Sum of fees of the non-coinbase transactions, `None` on overflow
    pub fn total_fees(&self) -> Option<u64> {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.fee))
    }
}

impl Serializable for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.header.encode(buf);
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Self, String> {
        let header = BlockHeader::decode(reader)?;
        let count = read_length(reader, MAX_BLOCK_TRANSACTIONS)
            .map_err(|e| format!("block tx count: {}", e))?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode(reader)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GENESIS_TIMESTAMP;
    use crate::core::KeyPair;

    fn sample_txs() -> Vec<Transaction> {
        let miner = KeyPair::generate();
        let alice = KeyPair::generate();
        vec![
            Transaction::coinbase(miner.address, 1001, 1),
            Transaction::create(&miner, alice.address, 10, 1, 0),
        ]
    }

    #[test]
    fn test_header_layout() {
        let block = Block::genesis(0x207fffff, GENESIS_TIMESTAMP);
        let bytes = block.header.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(block.header.prefix_bytes().len(), HEADER_PREFIX_SIZE);
        assert_eq!(&bytes[..HEADER_PREFIX_SIZE], block.header.prefix_bytes().as_slice());
    }

    #[test]
    fn test_nonce_changes_hash() {
        let mut header = Block::genesis(0x207fffff, GENESIS_TIMESTAMP).header;
        let before = header.hash();
        header.nonce += 1;
        assert_ne!(before, header.hash());
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(0x207fffff, GENESIS_TIMESTAMP);
        assert!(genesis.is_genesis());
        assert_eq!(genesis.height(), 0);
        assert_eq!(genesis.header.merkle_root, Hash256::zero());
        assert!(genesis.coinbase().is_none());
    }

    #[test]
    fn test_template_commits_to_transactions() {
        let txs = sample_txs();
        let block = Block::template(Hash256::zero(), 1, 100, 0x207fffff, txs.clone());
        assert_eq!(block.header.merkle_root, Block::calculate_merkle_root(&txs));
        assert_eq!(block.coinbase(), Some(&txs[0]));
        assert_eq!(block.total_fees(), Some(1));

        let proof = block.merkle_proof(1).unwrap();
        assert!(merkle::verify_proof(&block.header.merkle_root, &txs[1].txid(), &proof));
    }

    #[test]
    fn test_block_encoding() {
        let block = Block::template(Hash256::zero(), 1, 100, 0x207fffff, sample_txs());
        let decoded = Block::deserialize(&block.serialize()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Block::genesis(0x207fffff, GENESIS_TIMESTAMP).serialize();
        bytes.push(0);
        assert!(Block::deserialize(&bytes).is_err());
    }
}
