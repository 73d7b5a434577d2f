// Blockchain database using sled

use crate::core::{Block, Hash256, Serializable};
use crate::storage::{CanonicalUpdate, ChainStore, PersistenceError, StoredChain};
use sled::{Batch, Db};
use std::path::Path;
use std::sync::Arc;

const TIP_KEY: &[u8] = b"tip";
const HEIGHT_KEY: &[u8] = b"height";

/// Blockchain database
///
/// Layout: `b<hash>` holds a serialized block, `h<height be>` the canonical
/// hash at that height, `tip` and `height` the canonical tip.
pub struct BlockchainDB {
    db: Db,
}

impl BlockchainDB {
    /// Open or create a database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| format!("Failed to open database: {}", e))?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self, String> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| format!("Failed to create memory db: {}", e))?;
        Ok(Self { db })
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, String> {
        match self.db.get(Self::block_key(hash)).map_err(|e| format!("Database error: {}", e))? {
            Some(data) => Ok(Some(Block::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, String> {
        self.db
            .contains_key(Self::block_key(hash))
            .map_err(|e| format!("Database error: {}", e))
    }

    /// Canonical block hash at `height`
    pub fn get_hash_by_height(&self, height: u64) -> Result<Option<Hash256>, String> {
        match self.db.get(Self::height_key(height)).map_err(|e| format!("Database error: {}", e))? {
            Some(data) => Ok(Some(Hash256::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn get_tip(&self) -> Result<Option<Hash256>, String> {
        match self.db.get(TIP_KEY).map_err(|e| format!("Database error: {}", e))? {
            Some(data) => Ok(Some(Hash256::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Height of the stored tip; 0 when nothing is stored
    pub fn get_chain_height(&self) -> Result<u64, String> {
        match self.db.get(HEIGHT_KEY).map_err(|e| format!("Database error: {}", e))? {
            Some(data) => {
                let bytes: [u8; 8] = data
                    .as_ref()
                    .try_into()
                    .map_err(|_| format!("Invalid height data length: {}", data.len()))?;
                Ok(u64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn all_blocks(&self) -> Result<Vec<Block>, String> {
        self.db
            .scan_prefix(b"b")
            .map(|item| {
                let (_, data) = item.map_err(|e| format!("Database error: {}", e))?;
                Block::deserialize(&data)
            })
            .collect()
    }

    /// Canonical hashes in height order; keys are big-endian so the scan is sorted
    fn canonical_hashes(&self) -> Result<Vec<Hash256>, String> {
        self.db
            .scan_prefix(b"h")
            .map(|item| {
                let (_, data) = item.map_err(|e| format!("Database error: {}", e))?;
                Hash256::from_slice(&data)
            })
            .collect()
    }

    fn write(&self, blocks: &[Arc<Block>], canonical: Option<&CanonicalUpdate>) -> Result<(), String> {
        let mut batch = Batch::default();
        for block in blocks {
            batch.insert(Self::block_key(&block.hash()), block.serialize());
        }

        if let Some(update) = canonical.filter(|u| !u.hashes.is_empty()) {
            for (offset, hash) in update.hashes.iter().enumerate() {
                batch.insert(Self::height_key(update.from_height + offset as u64), hash.as_bytes().as_slice());
            }
            // A heavier branch can be shorter than the one it replaced
            let new_height = update.tip_height();
            let old_height = self.get_chain_height()?;
            for height in new_height + 1..=old_height {
                batch.remove(Self::height_key(height));
            }
            if let Some(tip) = update.tip() {
                batch.insert(TIP_KEY, tip.as_bytes().as_slice());
            }
            batch.insert(HEIGHT_KEY, new_height.to_le_bytes().to_vec());
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| format!("Failed to store blocks: {}", e))?;
        self.flush()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), String> {
        self.db
            .flush()
            .map_err(|e| format!("Failed to flush: {}", e))?;
        Ok(())
    }

    fn block_key(hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b'b');
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn height_key(height: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(b'h');
        key.extend_from_slice(&height.to_be_bytes());
        key
    }
}

impl ChainStore for BlockchainDB {
    fn load(&self) -> Result<StoredChain, PersistenceError> {
        let blocks = self.all_blocks()?;
        let canonical = self.canonical_hashes()?;
        let tip = self.get_tip()?;
        log::info!("Loaded {} blocks, {} on the canonical chain", blocks.len(), canonical.len());
        Ok(StoredChain { blocks, canonical, tip })
    }

    fn on_accept(&self, blocks: &[Arc<Block>], canonical: Option<&CanonicalUpdate>) -> Result<(), PersistenceError> {
        self.write(blocks, canonical).map_err(PersistenceError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GENESIS_TIMESTAMP, POW_LIMIT_BITS};

    fn chain(len: u64) -> Vec<Arc<Block>> {
        let mut blocks = vec![Arc::new(Block::genesis(POW_LIMIT_BITS, GENESIS_TIMESTAMP))];
        for height in 1..len {
            let prev = blocks[height as usize - 1].hash();
            blocks.push(Arc::new(Block::template(
                prev,
                height,
                GENESIS_TIMESTAMP + height,
                POW_LIMIT_BITS,
                Vec::new(),
            )));
        }
        blocks
    }

    fn update(blocks: &[Arc<Block>], from: u64) -> CanonicalUpdate {
        CanonicalUpdate {
            from_height: from,
            hashes: blocks[from as usize..].iter().map(|b| b.hash()).collect(),
        }
    }

    #[test]
    fn test_store_and_get_block() {
        let db = BlockchainDB::memory().unwrap();
        let blocks = chain(2);
        db.on_accept(&blocks[1..], None).unwrap();

        let hash = blocks[1].hash();
        assert!(db.has_block(&hash).unwrap());
        assert_eq!(db.get_block(&hash).unwrap().unwrap(), *blocks[1]);
        // Not canonical yet
        assert_eq!(db.get_tip().unwrap(), None);
    }

    #[test]
    fn test_canonical_index_and_tip() {
        let db = BlockchainDB::memory().unwrap();
        let blocks = chain(4);
        db.on_accept(&blocks, Some(&update(&blocks, 0))).unwrap();

        assert_eq!(db.get_chain_height().unwrap(), 3);
        assert_eq!(db.get_tip().unwrap(), Some(blocks[3].hash()));
        assert_eq!(db.get_hash_by_height(2).unwrap(), Some(blocks[2].hash()));

        let stored = db.load().unwrap();
        assert_eq!(stored.blocks.len(), 4);
        assert_eq!(stored.canonical.len(), 4);
    }

    #[test]
    fn test_shorter_branch_clears_stale_heights() {
        let db = BlockchainDB::memory().unwrap();
        let blocks = chain(4);
        db.on_accept(&blocks, Some(&update(&blocks, 0))).unwrap();

        let fork = Arc::new(Block::template(blocks[0].hash(), 1, GENESIS_TIMESTAMP + 50, 0x1f7fffff, Vec::new()));
        let switch = CanonicalUpdate {
            from_height: 1,
            hashes: vec![fork.hash()],
        };
        db.on_accept(std::slice::from_ref(&fork), Some(&switch)).unwrap();

        assert_eq!(db.get_chain_height().unwrap(), 1);
        assert_eq!(db.get_hash_by_height(1).unwrap(), Some(fork.hash()));
        assert_eq!(db.get_hash_by_height(2).unwrap(), None);
        assert_eq!(db.load().unwrap().blocks.len(), 5);
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = chain(3);
        {
            let db = BlockchainDB::new(dir.path()).unwrap();
            db.on_accept(&blocks, Some(&update(&blocks, 0))).unwrap();
        }
        let db = BlockchainDB::new(dir.path()).unwrap();
        let stored = db.load().unwrap();
        assert_eq!(stored.tip, Some(blocks[2].hash()));
        assert_eq!(stored.canonical, blocks.iter().map(|b| b.hash()).collect::<Vec<_>>());
    }
}
