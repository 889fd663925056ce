// Gossip message handling, independent of sockets

use crate::chain::{BlockStatus, ChainManager};
use crate::core::{Block, Hash256};
use crate::mempool::SubmitStatus;
use crate::network::{Message, RejectMessage, MAX_BLOCKS_PER_MESSAGE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ids relayed recently, forgotten after `ttl`
#[derive(Debug)]
pub struct SeenCache {
    ttl: Duration,
    entries: HashMap<Hash256, Instant>,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record `id`. Returns false if it was already seen within the window.
    pub fn insert(&mut self, id: Hash256) -> bool {
        self.insert_at(id, Instant::now())
    }

    fn insert_at(&mut self, id: Hash256, now: Instant) -> bool {
        if let Some(seen) = self.entries.get(&id) {
            if now.duration_since(*seen) < self.ttl {
                return false;
            }
        }
        self.entries.insert(id, now);
        true
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.entries
            .get(id)
            .is_some_and(|seen| seen.elapsed() < self.ttl)
    }

    /// Forget ids older than the window
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, seen| seen.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the connection layer should do after a message was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipAction {
    /// Answer the sender
    Reply(Message),
    /// Relay to every peer except the sender
    Relay(Message),
    /// Our chain is missing blocks the sender has
    Sync,
    /// The sender's chain reaches at least this height
    PeerHeight(u64),
}

/// Result of feeding a batch of blocks through validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Blocks added to the block tree
    pub indexed: usize,
    pub already_known: usize,
    /// The first block's parent was unknown
    pub first_orphaned: bool,
    /// Highest height among indexed blocks
    pub best_height: Option<u64>,
    pub rejected: Option<Hash256>,
}

/// Routes transactions and blocks from peers into the chain manager
pub struct Gossip {
    chain: Arc<ChainManager>,
    seen: Mutex<SeenCache>,
}

impl Gossip {
    pub fn new(chain: Arc<ChainManager>, seen_ttl: Duration) -> Self {
        Self {
            chain,
            seen: Mutex::new(SeenCache::new(seen_ttl)),
        }
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    /// Mark an id as relayed by us, so echoes from peers are ignored
    pub fn mark_seen(&self, id: Hash256) -> bool {
        self.seen.lock().insert(id)
    }

    pub fn prune_seen(&self) -> usize {
        self.seen.lock().prune()
    }

    /// Handle transaction, block and block-request messages
    pub fn handle(&self, message: Message) -> Vec<GossipAction> {
        match message {
            Message::NewTransaction(tx) => {
                let txid = tx.txid();
                if self.seen.lock().contains(&txid) {
                    log::debug!("Duplicate transaction {} ignored", txid);
                    return Vec::new();
                }
                match self.chain.submit_transaction(tx.clone()) {
                    Ok(SubmitStatus::Accepted) => {
                        self.mark_seen(txid);
                        vec![GossipAction::Relay(Message::NewTransaction(tx))]
                    }
                    Ok(SubmitStatus::AlreadyKnown) => {
                        self.mark_seen(txid);
                        Vec::new()
                    }
                    // rejected ids stay out of the cache so a retry is answered again
                    Err(e) => {
                        log::debug!("Rejected transaction {}: {}", txid, e);
                        vec![GossipAction::Reply(Message::Reject(RejectMessage::from_error(txid, &e)))]
                    }
                }
            }
            Message::NewBlock(block) => {
                let hash = block.hash();
                if self.seen.lock().contains(&hash) {
                    log::debug!("Duplicate block {} ignored", hash);
                    return Vec::new();
                }
                match self.chain.process_block(block.clone()) {
                    Ok(status) => {
                        if status != BlockStatus::Orphan {
                            self.mark_seen(hash);
                        }
                        self.block_actions(block, status)
                    }
                    Err(e) => {
                        log::debug!("Rejected block {}: {}", hash, e);
                        vec![GossipAction::Reply(Message::Reject(RejectMessage::from_error(hash, &e)))]
                    }
                }
            }
            Message::GetBlocks { from_height } => {
                let blocks = self
                    .chain
                    .blocks_from(from_height, MAX_BLOCKS_PER_MESSAGE)
                    .into_iter()
                    .map(|block| (*block).clone())
                    .collect();
                vec![GossipAction::Reply(Message::Blocks(blocks))]
            }
            Message::Blocks(blocks) => {
                let outcome = self.import_blocks(blocks);
                let mut actions = Vec::new();
                if let Some(height) = outcome.best_height {
                    actions.push(GossipAction::PeerHeight(height));
                }
                if outcome.first_orphaned {
                    actions.push(GossipAction::PeerHeight(self.chain.height() + 1));
                    actions.push(GossipAction::Sync);
                }
                actions
            }
            other => {
                log::debug!("Gossip ignores {}", other.message_type().command());
                Vec::new()
            }
        }
    }

    fn block_actions(&self, block: Block, status: BlockStatus) -> Vec<GossipAction> {
        match status {
            BlockStatus::Connected { height }
            | BlockStatus::Reorganized { height, .. }
            | BlockStatus::SideChain { height } => vec![
                GossipAction::PeerHeight(height),
                GossipAction::Relay(Message::NewBlock(block)),
            ],
            // the sender has the missing ancestors, whatever height it announced
            BlockStatus::Orphan => vec![
                GossipAction::PeerHeight(self.chain.height() + 1),
                GossipAction::Sync,
            ],
            BlockStatus::AlreadyKnown => Vec::new(),
        }
    }

    /// Validate blocks in order, stopping at the first rejection
    pub fn import_blocks(&self, blocks: Vec<Block>) -> ImportOutcome {
        let mut outcome = ImportOutcome::default();

        for (position, block) in blocks.into_iter().enumerate() {
            let hash = block.hash();
            match self.chain.process_block(block) {
                Ok(BlockStatus::AlreadyKnown) => {
                    self.mark_seen(hash);
                    outcome.already_known += 1;
                }
                Ok(BlockStatus::Orphan) => {
                    if position == 0 {
                        outcome.first_orphaned = true;
                        break;
                    }
                }
                Ok(status) => {
                    self.mark_seen(hash);
                    outcome.indexed += 1;
                    if let BlockStatus::Connected { height }
                    | BlockStatus::Reorganized { height, .. }
                    | BlockStatus::SideChain { height } = status
                    {
                        outcome.best_height = outcome.best_height.max(Some(height));
                    }
                }
                Err(e) => {
                    log::debug!("Synced block {} rejected: {}", hash, e);
                    outcome.rejected = Some(hash);
                    break;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::wallet::{KeyPair, TransactionBuilder};

    fn setup() -> (Gossip, KeyPair) {
        let chain = Arc::new(ChainManager::new(ChainParams::regtest(), None).unwrap());
        (Gossip::new(chain, Duration::from_secs(60)), KeyPair::from_secret_bytes(&[1; 32]).unwrap())
    }

    #[test]
    fn test_seen_cache_window() {
        let mut cache = SeenCache::new(Duration::from_secs(10));
        let id = Hash256::new([1; 32]);
        let start = Instant::now();

        assert!(cache.insert_at(id, start));
        assert!(!cache.insert_at(id, start + Duration::from_secs(5)));
        assert!(cache.insert_at(id, start + Duration::from_secs(11)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_transaction_relayed_once() {
        let (gossip, alice) = setup();
        let bob = KeyPair::from_secret_bytes(&[2; 32]).unwrap();
        gossip.chain().request_mine(&alice.script_pubkey()).unwrap();

        let tx = TransactionBuilder::new(&alice, gossip.chain().spendable_utxos(&alice.address))
            .build(&bob.address, 5_000, 100)
            .unwrap();

        let first = gossip.handle(Message::NewTransaction(tx.clone()));
        assert_eq!(first, vec![GossipAction::Relay(Message::NewTransaction(tx.clone()))]);
        assert!(gossip.handle(Message::NewTransaction(tx)).is_empty());
        assert_eq!(gossip.chain().mempool_size(), 1);
    }

    #[test]
    fn test_invalid_transaction_gets_reject() {
        let (gossip, alice) = setup();
        let bob = KeyPair::from_secret_bytes(&[2; 32]).unwrap();
        gossip.chain().request_mine(&alice.script_pubkey()).unwrap();

        // signed by the wrong key
        let coins = gossip.chain().spendable_utxos(&alice.address);
        let forged = TransactionBuilder::new(&bob, coins).build(&bob.address, 5_000, 100).unwrap();

        let actions = gossip.handle(Message::NewTransaction(forged.clone()));
        match actions.as_slice() {
            [GossipAction::Reply(Message::Reject(reject))] => {
                assert_eq!(reject.id, forged.txid());
                assert_eq!(reject.code, crate::error::RejectCode::Invalid);
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_block_relay_and_orphan_sync() {
        let (source, alice) = setup();
        let (gossip, _) = setup();
        let (first, _) = source.chain().request_mine(&alice.script_pubkey()).unwrap();
        let (second, _) = source.chain().request_mine(&alice.script_pubkey()).unwrap();

        assert_eq!(
            gossip.handle(Message::NewBlock(second)),
            vec![GossipAction::PeerHeight(1), GossipAction::Sync]
        );

        let actions = gossip.handle(Message::NewBlock(first.clone()));
        assert_eq!(
            actions,
            vec![
                GossipAction::PeerHeight(1),
                GossipAction::Relay(Message::NewBlock(first))
            ]
        );
        // the buffered orphan connected behind its parent
        assert_eq!(gossip.chain().height(), 2);
    }

    #[test]
    fn test_rejected_transaction_is_answered_again() {
        let (source, alice) = setup();
        let (lagging, _) = setup();
        let bob = KeyPair::from_secret_bytes(&[2; 32]).unwrap();
        let (funding, _) = source.chain().request_mine(&alice.script_pubkey()).unwrap();
        let tx = TransactionBuilder::new(&alice, source.chain().spendable_utxos(&alice.address))
            .build(&bob.address, 5_000, 100)
            .unwrap();

        let early = lagging.handle(Message::NewTransaction(tx.clone()));
        assert!(matches!(early.as_slice(), [GossipAction::Reply(Message::Reject(_))]));
        let retry = lagging.handle(Message::NewTransaction(tx.clone()));
        assert!(matches!(retry.as_slice(), [GossipAction::Reply(Message::Reject(_))]));

        lagging.handle(Message::NewBlock(funding));
        let after = lagging.handle(Message::NewTransaction(tx.clone()));
        assert_eq!(after, vec![GossipAction::Relay(Message::NewTransaction(tx.clone()))]);
        assert!(lagging.chain().mempool_contains(&tx.txid()));
        assert!(lagging.handle(Message::NewTransaction(tx)).is_empty());
    }

    #[test]
    fn test_rejected_block_is_answered_again() {
        let (source, alice) = setup();
        let (gossip, _) = setup();
        let (block, _) = source.chain().request_mine(&alice.script_pubkey()).unwrap();

        let mut tampered = block.clone();
        tampered.transactions[0].outputs[0].value += 1;
        assert_eq!(tampered.hash(), block.hash());

        let actions = gossip.handle(Message::NewBlock(tampered));
        assert!(matches!(actions.as_slice(), [GossipAction::Reply(Message::Reject(_))]));

        // the honest body behind the same header still gets through
        let actions = gossip.handle(Message::NewBlock(block.clone()));
        assert_eq!(actions[0], GossipAction::PeerHeight(1));
        assert_eq!(gossip.chain().tip(), block.hash());
    }

    #[test]
    fn test_get_blocks_and_import() {
        let (source, alice) = setup();
        for _ in 0..3 {
            source.chain().request_mine(&alice.script_pubkey()).unwrap();
        }

        let reply = source.handle(Message::GetBlocks { from_height: 1 });
        let [GossipAction::Reply(Message::Blocks(blocks))] = reply.as_slice() else {
            panic!("expected a blocks reply");
        };
        assert_eq!(blocks.len(), 3);

        let (gossip, _) = setup();
        let outcome = gossip.import_blocks(blocks[1..].to_vec());
        assert!(outcome.first_orphaned);

        let outcome = gossip.import_blocks(blocks.clone());
        assert_eq!(outcome.indexed, 2);
        assert_eq!(outcome.already_known, 1);
        assert_eq!(outcome.best_height, Some(3));
        assert_eq!(gossip.chain().tip(), source.chain().tip());
    }
}
