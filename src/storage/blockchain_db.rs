// Block store using sled

use crate::core::{Block, Hash256, Serializable};
use crate::error::{NodeError, Result};
use sled::Db;
use std::path::Path;
use std::sync::Arc;

/// Load/save contract for the active chain
pub trait ChainStore: Send + Sync {
    /// Blocks of the stored active chain, genesis first; empty when nothing is stored
    fn load(&self) -> Result<Vec<Block>>;

    /// Persist active chain blocks starting at `from_height`. Whatever was
    /// stored at or above that height is replaced.
    fn save(&self, from_height: u64, blocks: &[Arc<Block>]) -> Result<()>;
}

/// sled-backed chain store: blocks by hash, height -> hash index, tip and height
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| NodeError::persistence(format!("failed to open {}: {}", path.as_ref().display(), e)))?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Ok(Self { db })
    }

    /// Store a block
    pub fn store_block(&self, block: &Block) -> Result<()> {
        self.db.insert(Self::block_key(&block.hash()), block.serialize())?;
        Ok(())
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        match self.db.get(Self::block_key(hash))? {
            Some(data) => {
                let block = Block::deserialize(&data)
                    .map_err(|e| NodeError::persistence(format!("corrupt block {}: {}", hash, e)))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Check if a block exists
    pub fn has_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.db.contains_key(Self::block_key(hash))?)
    }

    /// Get block hash by height
    pub fn get_hash_by_height(&self, height: u64) -> Result<Option<Hash256>> {
        match self.db.get(Self::height_key(height))? {
            Some(data) => Ok(Some(Self::decode_hash(&data)?)),
            None => Ok(None),
        }
    }

    /// Get the chain tip (best block hash)
    pub fn get_tip(&self) -> Result<Option<Hash256>> {
        match self.db.get(b"tip")? {
            Some(data) => Ok(Some(Self::decode_hash(&data)?)),
            None => Ok(None),
        }
    }

    /// Number of blocks in the stored chain
    pub fn get_chain_length(&self) -> Result<u64> {
        match self.db.get(b"length")? {
            Some(data) => {
                let bytes: [u8; 8] = data[..]
                    .try_into()
                    .map_err(|_| NodeError::persistence(format!("invalid length record: {} bytes", data.len())))?;
                Ok(u64::from_le_bytes(bytes))
            }
            None => Ok(0), // No blocks stored yet
        }
    }

    fn decode_hash(data: &[u8]) -> Result<Hash256> {
        Hash256::from_slice(data).map_err(|_| NodeError::persistence(format!("invalid hash length: {}", data.len())))
    }

    // Helper: create key for block storage
    fn block_key(hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b'b'); // 'b' for block
        key.extend_from_slice(hash.as_bytes());
        key
    }

    // Helper: create key for height index
    fn height_key(height: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(b'h'); // 'h' for height
        key.extend_from_slice(&height.to_be_bytes());
        key
    }
}

impl ChainStore for SledStore {
    fn load(&self) -> Result<Vec<Block>> {
        let length = self.get_chain_length()?;
        let mut chain = Vec::with_capacity(length.min(1 << 16) as usize);

        for height in 0..length {
            let hash = self
                .get_hash_by_height(height)?
                .ok_or_else(|| NodeError::persistence(format!("height {} missing from index", height)))?;
            let block = self
                .get_block(&hash)?
                .ok_or_else(|| NodeError::persistence(format!("block {} missing", hash)))?;
            chain.push(block);
        }

        log::debug!("Loaded {} blocks from store", chain.len());
        Ok(chain)
    }

    fn save(&self, from_height: u64, blocks: &[Arc<Block>]) -> Result<()> {
        let old_length = self.get_chain_length()?;
        let new_length = from_height + blocks.len() as u64;
        let mut batch = sled::Batch::default();

        for (height, block) in (from_height..).zip(blocks) {
            let hash = block.hash();
            batch.insert(Self::block_key(&hash), block.serialize());
            batch.insert(Self::height_key(height), hash.as_bytes().as_slice());
        }

        // a reorganisation may have shortened the chain
        for height in new_length..old_length {
            batch.remove(Self::height_key(height));
        }

        if let Some(tip) = blocks.last() {
            batch.insert(b"tip".as_slice(), tip.hash().as_bytes().as_slice());
        }
        batch.insert(b"length".as_slice(), new_length.to_le_bytes().as_slice());

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }
}
