// Blocks waiting for their parent

use crate::core::{Block, Hash256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Bounded buffer of blocks whose parent is unknown
#[derive(Debug)]
pub struct OrphanPool {
    blocks: HashMap<Hash256, Arc<Block>>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    /// Insertion order, oldest first
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Buffer a block, dropping the oldest one when full. Returns false if already held.
    pub fn add(&mut self, hash: Hash256, block: Arc<Block>) -> bool {
        if self.blocks.contains_key(&hash) {
            return false;
        }

        while self.blocks.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.remove(&oldest);
        }

        self.by_parent
            .entry(block.header.prev_block_hash)
            .or_default()
            .push(hash);
        self.blocks.insert(hash, block);
        self.order.push_back(hash);
        true
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Arc<Block>> {
        let block = self.blocks.remove(hash)?;
        let parent = block.header.prev_block_hash;
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.retain(|child| child != hash);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        self.order.retain(|h| h != hash);
        Some(block)
    }

    /// Remove and return every buffered child of `parent`
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Arc<Block>> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        children
            .iter()
            .filter_map(|hash| {
                self.order.retain(|h| h != hash);
                self.blocks.remove(hash)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockHeader, Transaction, TxOutput};

    fn orphan(parent: u8, tag: u8) -> (Hash256, Arc<Block>) {
        let coinbase = Transaction::coinbase(1, &[tag], vec![TxOutput::new(1, vec![])]);
        let merkle = Block::calculate_merkle_root(std::slice::from_ref(&coinbase));
        let block = Block::new(
            BlockHeader::new(1, Hash256::new([parent; 32]), merkle, 0, 0x207fffff, 0),
            vec![coinbase],
        );
        (block.hash(), Arc::new(block))
    }

    #[test]
    fn test_children_released_by_parent() {
        let mut pool = OrphanPool::new(10);
        let (h1, b1) = orphan(1, 1);
        let (h2, b2) = orphan(1, 2);
        let (h3, b3) = orphan(2, 3);
        assert!(pool.add(h1, b1));
        assert!(pool.add(h2, b2));
        assert!(pool.add(h3, b3.clone()));
        assert!(!pool.add(h3, b3));

        let released = pool.take_children(&Hash256::new([1; 32]));
        assert_eq!(released.len(), 2);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&h3));
        assert!(pool.take_children(&Hash256::new([1; 32])).is_empty());
    }

    #[test]
    fn test_bounded_drops_oldest() {
        let mut pool = OrphanPool::new(2);
        let (h1, b1) = orphan(1, 1);
        let (h2, b2) = orphan(1, 2);
        let (h3, b3) = orphan(1, 3);
        pool.add(h1, b1);
        pool.add(h2, b2);
        pool.add(h3, b3);

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&h1));
        assert_eq!(pool.take_children(&Hash256::new([1; 32])).len(), 2);
    }
}
