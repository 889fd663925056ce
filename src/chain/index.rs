// Index of every known block, active or not

use crate::config::ChainParams;
use crate::consensus::difficulty::{interval_start_height, is_retarget_height};
use crate::consensus::{retarget, Target};
use crate::core::{Block, Hash256};
use primitive_types::U256;
use std::collections::HashMap;
use std::sync::Arc;

/// A block with its position in the block tree
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub block: Arc<Block>,
    pub height: u64,
    /// Work of this block plus all its ancestors
    pub chain_work: U256,
}

impl IndexEntry {
    pub fn parent(&self) -> Hash256 {
        self.block.header.prev_block_hash
    }

    pub fn timestamp(&self) -> u32 {
        self.block.header.timestamp
    }

    pub fn bits(&self) -> u32 {
        self.block.header.bits
    }
}

/// Block tree keyed by hash
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: HashMap<Hash256, IndexEntry>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block whose parent is already indexed (or the genesis block)
    pub fn insert(&mut self, hash: Hash256, block: Arc<Block>, height: u64, chain_work: U256) {
        self.entries.insert(
            hash,
            IndexEntry {
                block,
                height,
                chain_work,
            },
        );
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<IndexEntry> {
        self.entries.remove(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&IndexEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ancestor of `hash` at `height` (the block itself when heights match)
    pub fn ancestor(&self, hash: &Hash256, height: u64) -> Option<&IndexEntry> {
        let mut entry = self.entries.get(hash)?;
        if height > entry.height {
            return None;
        }
        while entry.height > height {
            entry = self.entries.get(&entry.parent())?;
        }
        Some(entry)
    }

    /// Median timestamp of `hash` and up to `span - 1` of its ancestors
    pub fn median_time_past(&self, hash: &Hash256, span: usize) -> u32 {
        let mut times = Vec::with_capacity(span);
        let mut current = self.entries.get(hash);

        while let Some(entry) = current {
            if times.len() == span {
                break;
            }
            times.push(entry.timestamp());
            current = if entry.height == 0 {
                None
            } else {
                self.entries.get(&entry.parent())
            };
        }

        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Bits required for a child of `parent`
    pub fn next_bits(&self, params: &ChainParams, parent: &Hash256) -> Option<u32> {
        let entry = self.entries.get(parent)?;
        let next_height = entry.height + 1;

        if !is_retarget_height(params, next_height) {
            return Some(entry.bits());
        }

        let first = self.ancestor(parent, interval_start_height(params, entry.height))?;
        Some(retarget(params, entry.bits(), first.timestamp(), entry.timestamp()))
    }

    /// Work of a header with `bits` on top of `parent`
    pub fn work_on(&self, parent: &Hash256, bits: u32) -> Option<U256> {
        let entry = self.entries.get(parent)?;
        Some(entry.chain_work.saturating_add(Target::from_bits(bits).work()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockHeader, Transaction, TxOutput};

    fn block(prev: Hash256, height: u32, timestamp: u32, bits: u32) -> Arc<Block> {
        let coinbase = Transaction::coinbase(height, b"", vec![TxOutput::new(1, vec![])]);
        let merkle = Block::calculate_merkle_root(std::slice::from_ref(&coinbase));
        Arc::new(Block::new(BlockHeader::new(1, prev, merkle, timestamp, bits, 0), vec![coinbase]))
    }

    /// Linear chain with the given timestamps, all at the limit target
    fn linear(times: &[u32]) -> (BlockIndex, Vec<Hash256>) {
        let mut index = BlockIndex::new();
        let mut hashes = Vec::new();
        let mut prev = Hash256::zero();
        let mut work = U256::zero();
        for (height, ts) in times.iter().enumerate() {
            let b = block(prev, height as u32, *ts, 0x207fffff);
            let hash = b.hash();
            work = work + Target::from_bits(0x207fffff).work();
            index.insert(hash, b, height as u64, work);
            hashes.push(hash);
            prev = hash;
        }
        (index, hashes)
    }

    #[test]
    fn test_ancestor_lookup() {
        let (index, hashes) = linear(&[100, 200, 300, 400]);
        assert_eq!(index.ancestor(&hashes[3], 1).unwrap().block.hash(), hashes[1]);
        assert_eq!(index.ancestor(&hashes[3], 3).unwrap().height, 3);
        assert!(index.ancestor(&hashes[1], 2).is_none());
    }

    #[test]
    fn test_median_time_past() {
        let (index, hashes) = linear(&[100, 500, 200, 400, 300]);
        assert_eq!(index.median_time_past(&hashes[4], 11), 300);
        assert_eq!(index.median_time_past(&hashes[4], 3), 300);
        assert_eq!(index.median_time_past(&hashes[1], 11), 500);
        assert_eq!(index.median_time_past(&hashes[0], 11), 100);
    }

    #[test]
    fn test_next_bits_between_retargets() {
        let params = ChainParams {
            retarget_interval: 2,
            ..ChainParams::regtest()
        };
        let (index, hashes) = linear(&[1000, 1001, 1002]);
        // child of height 2 lands on height 3: bits carry over
        assert_eq!(index.next_bits(&params, &hashes[2]), Some(0x207fffff));

        // child of height 1 lands on height 2: one second against 120 expected
        let bits = index.next_bits(&params, &hashes[1]).unwrap();
        let limit = Target::from_bits(0x207fffff).to_u256().unwrap();
        assert_eq!(Target::from_bits(bits).to_u256().unwrap(), Target::from_u256(limit / 4).to_u256().unwrap());
    }

    #[test]
    fn test_cumulative_work() {
        let (index, hashes) = linear(&[1, 2, 3]);
        assert_eq!(index.get(&hashes[2]).unwrap().chain_work, U256::from(6u64));
        assert_eq!(index.work_on(&hashes[2], 0x207fffff), Some(U256::from(8u64)));
    }
}
