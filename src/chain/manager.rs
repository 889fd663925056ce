// Chain manager: block acceptance, fork choice and reorganization

use super::index::BlockIndex;
use super::orphans::OrphanPool;
use crate::config::ChainParams;
use crate::consensus::{BlockValidator, Target, ValidationError};
use crate::core::{Block, Hash256, OutPoint, Transaction};
use crate::error::{ConflictError, Result};
use crate::mempool::{Mempool, MempoolEntry, SubmitStatus};
use crate::storage::{BlockUndo, ChainStore, Utxo, UtxoSet};
use crate::wallet::Address;
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// What the chain manager is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Idle,
    Mining,
    Validating,
    Reorganizing,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainStatus::Idle => "idle",
            ChainStatus::Mining => "mining",
            ChainStatus::Validating => "validating",
            ChainStatus::Reorganizing => "reorganizing",
        };
        f.write_str(name)
    }
}

/// Result of handing a block to the chain manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Extended the active chain
    Connected { height: u64 },
    /// Became the tip of a heavier branch; `disconnected` blocks left the active chain
    Reorganized { height: u64, disconnected: usize },
    /// Stored on a branch with no more work than the active chain
    SideChain { height: u64 },
    /// Parent unknown; held until it arrives
    Orphan,
    AlreadyKnown,
}

impl BlockStatus {
    /// Whether the block moved the active tip
    pub fn is_new_tip(&self) -> bool {
        matches!(self, BlockStatus::Connected { .. } | BlockStatus::Reorganized { .. })
    }

    /// Whether the block is now part of the block tree
    pub fn is_indexed(&self) -> bool {
        matches!(
            self,
            BlockStatus::Connected { .. } | BlockStatus::Reorganized { .. } | BlockStatus::SideChain { .. }
        )
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything guarded by the chain lock
pub(super) struct ChainState {
    pub(super) index: BlockIndex,
    /// Hashes of the active chain; position is height
    pub(super) active: Vec<Hash256>,
    pub(super) utxos: UtxoSet,
    undo: HashMap<Hash256, BlockUndo>,
    orphans: OrphanPool,
    pub(super) mempool: Mempool,
    /// Transactions confirmed on the active chain, by containing block
    confirmed: HashMap<Hash256, Hash256>,
    invalid: HashSet<Hash256>,
}

impl ChainState {
    fn new(params: &ChainParams) -> Self {
        Self {
            index: BlockIndex::new(),
            active: Vec::new(),
            utxos: UtxoSet::new(),
            undo: HashMap::new(),
            orphans: OrphanPool::new(params.max_orphan_blocks),
            mempool: Mempool::from_params(params),
            confirmed: HashMap::new(),
            invalid: HashSet::new(),
        }
    }

    pub(super) fn tip(&self) -> Hash256 {
        self.active.last().copied().unwrap_or_else(Hash256::zero)
    }

    pub(super) fn height(&self) -> u64 {
        (self.active.len() as u64).saturating_sub(1)
    }

    fn tip_work(&self) -> U256 {
        self.index
            .get(&self.tip())
            .map(|entry| entry.chain_work)
            .unwrap_or_default()
    }

    fn is_active(&self, hash: &Hash256, height: u64) -> bool {
        self.active.get(height as usize) == Some(hash)
    }

    fn active_blocks(&self) -> Vec<Arc<Block>> {
        self.active
            .iter()
            .filter_map(|hash| self.index.get(hash).map(|entry| entry.block.clone()))
            .collect()
    }

    /// Apply an indexed block on top of the active tip
    fn connect(&mut self, params: &ChainParams, hash: Hash256) -> std::result::Result<(), ValidationError> {
        let (block, height) = {
            let entry = self.index.get(&hash).ok_or(ValidationError::Disconnected(hash))?;
            (entry.block.clone(), entry.height)
        };

        let undo = self.utxos.apply(&block, height, params)?;
        self.undo.insert(hash, undo);
        self.active.push(hash);
        for tx in &block.transactions {
            self.confirmed.insert(tx.txid(), hash);
        }
        self.mempool.on_block_accepted(&block);
        Ok(())
    }

    /// Undo the active tip. Genesis is never disconnected.
    fn disconnect_tip(&mut self) -> Option<Arc<Block>> {
        if self.active.len() <= 1 {
            return None;
        }
        let hash = self.active.pop()?;
        let block = self.index.get(&hash)?.block.clone();

        if let Some(undo) = self.undo.remove(&hash) {
            self.utxos.revert(&undo);
        }
        for tx in &block.transactions {
            if self.confirmed.get(&tx.txid()) == Some(&hash) {
                self.confirmed.remove(&tx.txid());
            }
        }
        Some(block)
    }

    /// Last active ancestor of `tip` and the blocks above it, oldest first
    fn branch_to(&self, tip: &Hash256) -> Option<(Hash256, Vec<Hash256>)> {
        let mut branch = Vec::new();
        let mut cursor = *tip;
        loop {
            let entry = self.index.get(&cursor)?;
            if self.is_active(&cursor, entry.height) {
                branch.reverse();
                return Some((cursor, branch));
            }
            branch.push(cursor);
            cursor = entry.parent();
        }
    }

    /// Ledger as it stands after `parent`, which may sit on a side branch.
    /// Active blocks above the fork point are reverted on a copy, then the
    /// branch up to `parent` is applied.
    fn utxos_after(&self, params: &ChainParams, parent: &Hash256) -> std::result::Result<UtxoSet, ValidationError> {
        let (fork, branch) = self
            .branch_to(parent)
            .ok_or(ValidationError::Disconnected(*parent))?;
        let fork_height = self
            .index
            .get(&fork)
            .map(|entry| entry.height)
            .ok_or(ValidationError::Disconnected(fork))?;

        let mut utxos = self.utxos.clone();
        for hash in self.active.iter().skip(fork_height as usize + 1).rev() {
            if let Some(undo) = self.undo.get(hash) {
                utxos.revert(undo);
            }
        }
        for hash in &branch {
            let entry = self.index.get(hash).ok_or(ValidationError::Disconnected(*hash))?;
            utxos.apply(&entry.block, entry.height, params)?;
        }
        Ok(utxos)
    }

    /// Put transactions back in the pool after the active chain changed:
    /// first those of blocks that left the chain, then the previous pool
    fn restore_mempool(&mut self, params: &ChainParams, released: &[Arc<Block>], pending: Vec<MempoolEntry>, now: u64) {
        let tip_height = self.height();
        let released_txs = released
            .iter()
            .flat_map(|block| block.transactions.iter().filter(|tx| !tx.is_coinbase()).cloned())
            .map(|tx| (tx, now));
        let pending_txs = pending.into_iter().map(|entry| (entry.tx, entry.time));

        let mut restored = 0;
        for (tx, time) in released_txs.chain(pending_txs) {
            let txid = tx.txid();
            if self.confirmed.contains_key(&txid) {
                continue;
            }
            match self.mempool.submit(tx, &self.utxos, tip_height, params, time) {
                Ok(SubmitStatus::Accepted) => restored += 1,
                Ok(SubmitStatus::AlreadyKnown) => {}
                Err(e) => log::debug!("Dropped {} after chain switch: {}", txid, e),
            }
        }
        log::debug!("Restored {} transaction(s) to the mempool", restored);
    }
}

/// Active chain as last written to the store
#[derive(Default)]
struct Persisted {
    generation: u64,
    hashes: Vec<Hash256>,
}

/// Owns the block tree, the active chain, its UTXO set and the mempool.
///
/// All mutation happens under one lock, so each submitted block or
/// transaction is processed to completion before the next.
pub struct ChainManager {
    pub(super) params: ChainParams,
    validator: BlockValidator,
    pub(super) state: Mutex<ChainState>,
    status: RwLock<ChainStatus>,
    /// Bumped whenever the active tip changes
    generation: AtomicU64,
    /// Running miners
    pub(super) miners: AtomicUsize,
    store: Option<Box<dyn ChainStore>>,
    /// What the store currently holds
    persisted: Mutex<Persisted>,
    genesis_hash: Hash256,
}

impl ChainManager {
    /// Start from genesis and replay whatever `store` holds
    pub fn new(params: ChainParams, store: Option<Box<dyn ChainStore>>) -> Result<Self> {
        params.check()?;

        let genesis = Arc::new(Block::genesis(&params));
        let genesis_hash = genesis.hash();

        let mut state = ChainState::new(&params);
        let work = Target::from_bits(genesis.header.bits).work();
        state.index.insert(genesis_hash, genesis, 0, work);
        state.connect(&params, genesis_hash)?;

        let chain = Self {
            validator: BlockValidator::new(&params),
            params,
            state: Mutex::new(state),
            status: RwLock::new(ChainStatus::Idle),
            generation: AtomicU64::new(0),
            miners: AtomicUsize::new(0),
            store,
            persisted: Mutex::new(Persisted::default()),
            genesis_hash,
        };
        chain.replay()?;

        log::info!(
            "Chain ready: genesis {}, tip {} at height {}",
            chain.genesis_hash,
            chain.tip(),
            chain.height()
        );
        Ok(chain)
    }

    /// Re-validate the stored chain block by block
    fn replay(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let blocks = match store.load() {
            Ok(blocks) => blocks,
            Err(e) => {
                log::warn!("Failed to load stored chain, starting from genesis: {}", e);
                return Ok(());
            }
        };
        let Some(first) = blocks.first() else {
            return Ok(());
        };
        if first.hash() != self.genesis_hash {
            return Err(ValidationError::GenesisMismatch(first.hash()).into());
        }

        let now = unix_now();
        let mut state = self.state.lock();
        for block in blocks.into_iter().skip(1) {
            let hash = block.hash();
            if let Err(e) = self.accept(&mut state, Arc::new(block), now) {
                log::warn!("Stored block {} rejected, stopping replay: {}", hash, e);
                break;
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.persisted.lock() = Persisted {
            generation,
            hashes: state.active.clone(),
        };
        log::info!("Loaded {} block(s) from storage", state.height());
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn status(&self) -> ChainStatus {
        *self.status.read()
    }

    pub(super) fn set_status(&self, status: ChainStatus) {
        *self.status.write() = status;
    }

    /// Status to fall back to once the current job is done
    pub(super) fn resting_status(&self) -> ChainStatus {
        if self.miners.load(Ordering::SeqCst) > 0 {
            ChainStatus::Mining
        } else {
            ChainStatus::Idle
        }
    }

    /// Takes the chain lock, so a block in progress keeps its status until done
    pub(super) fn settle_status(&self) {
        let _state = self.state.lock();
        self.set_status(self.resting_status());
    }

    /// Changes whenever the active tip does; miners poll it to abandon stale work
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Validate and store a block, following the heaviest chain.
    ///
    /// Orphans waiting on this block are processed right after it.
    pub fn process_block(&self, block: Block) -> Result<BlockStatus> {
        let mut state = self.state.lock();
        self.set_status(ChainStatus::Validating);

        let tip_before = state.tip();
        let now = unix_now();
        let block = Arc::new(block);
        let hash = block.hash();

        let result = self.accept(&mut state, block, now);
        if let Ok(status) = &result {
            if status.is_indexed() {
                self.connect_orphans(&mut state, hash, now);
            }
        }

        let snapshot = if state.tip() != tip_before {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            Some((generation, state.active_blocks()))
        } else {
            None
        };
        self.set_status(self.resting_status());
        drop(state);

        if let Some((generation, chain)) = snapshot {
            self.persist(generation, chain);
        }
        result
    }

    fn accept(&self, state: &mut ChainState, block: Arc<Block>, now: u64) -> Result<BlockStatus> {
        let hash = block.hash();
        if state.index.contains(&hash) || state.orphans.contains(&hash) {
            return Ok(BlockStatus::AlreadyKnown);
        }
        if state.invalid.contains(&hash) {
            return Err(ConflictError::KnownInvalid(hash).into());
        }

        let parent_hash = block.header.prev_block_hash;
        if state.invalid.contains(&parent_hash) {
            state.invalid.insert(hash);
            return Err(ConflictError::KnownInvalid(parent_hash).into());
        }

        self.validator.validate_block(&block)?;

        let Some(parent) = state.index.get(&parent_hash) else {
            log::debug!("Orphan block {} (missing parent {})", hash, parent_hash);
            state.orphans.add(hash, block);
            return Ok(BlockStatus::Orphan);
        };
        let height = parent.height + 1;

        if let Err(err) = self.check_context(state, &block, height, now) {
            // a timestamp too far ahead may become acceptable later
            if !matches!(err, ValidationError::TimestampTooNew(_)) {
                state.invalid.insert(hash);
            }
            return Err(err.into());
        }

        if parent_hash != state.tip() {
            let staged = state
                .utxos_after(&self.params, &parent_hash)
                .and_then(|mut utxos| utxos.apply(&block, height, &self.params));
            if let Err(err) = staged {
                log::warn!("Side chain block {} at height {} rejected: {}", hash, height, err);
                state.invalid.insert(hash);
                return Err(err.into());
            }
        }

        let chain_work = state
            .index
            .work_on(&parent_hash, block.header.bits)
            .ok_or(ValidationError::Disconnected(parent_hash))?;
        state.index.insert(hash, block, height, chain_work);

        if parent_hash == state.tip() {
            if let Err(err) = state.connect(&self.params, hash) {
                log::warn!("Block {} at height {} rejected: {}", hash, height, err);
                state.index.remove(&hash);
                state.invalid.insert(hash);
                return Err(err.into());
            }
            log::info!("New tip {} at height {}", hash, height);
            return Ok(BlockStatus::Connected { height });
        }

        if chain_work > state.tip_work() {
            self.set_status(ChainStatus::Reorganizing);
            let disconnected = self.reorganize(state, hash, now)?;
            log::info!(
                "Reorganized to {} at height {} ({} block(s) disconnected)",
                hash,
                height,
                disconnected
            );
            return Ok(BlockStatus::Reorganized { height, disconnected });
        }

        log::debug!("Side chain block {} at height {}", hash, height);
        Ok(BlockStatus::SideChain { height })
    }

    /// Rules that depend on the block's ancestry
    fn check_context(
        &self,
        state: &ChainState,
        block: &Block,
        height: u64,
        now: u64,
    ) -> std::result::Result<(), ValidationError> {
        let parent = &block.header.prev_block_hash;
        BlockValidator::check_coinbase_height(block, height)?;

        let expected = state
            .index
            .next_bits(&self.params, parent)
            .ok_or(ValidationError::Disconnected(*parent))?;
        if block.header.bits != expected {
            return Err(ValidationError::UnexpectedDifficulty {
                expected,
                found: block.header.bits,
            });
        }

        let timestamp = block.header.timestamp;
        let median = state.index.median_time_past(parent, self.params.median_time_span);
        if timestamp <= median {
            return Err(ValidationError::TimestampTooOld(timestamp));
        }
        if u64::from(timestamp) > now + u64::from(self.params.max_future_block_time) {
            return Err(ValidationError::TimestampTooNew(timestamp));
        }
        Ok(())
    }

    /// Switch the active chain to end at `new_tip`. On failure the old chain
    /// is restored and the offending blocks are marked invalid.
    fn reorganize(&self, state: &mut ChainState, new_tip: Hash256, now: u64) -> Result<usize> {
        let (fork, branch) = state
            .branch_to(&new_tip)
            .ok_or(ValidationError::Disconnected(new_tip))?;
        let pending = state.mempool.drain();

        let mut disconnected = Vec::new();
        while state.tip() != fork {
            match state.disconnect_tip() {
                Some(block) => disconnected.push(block),
                None => break,
            }
        }
        // oldest first
        disconnected.reverse();

        for (connected, hash) in branch.iter().enumerate() {
            let Err(err) = state.connect(&self.params, *hash) else {
                continue;
            };
            log::warn!("Reorganization to {} failed at block {}: {}", new_tip, hash, err);

            for bad in &branch[connected..] {
                state.index.remove(bad);
                state.invalid.insert(*bad);
            }

            let mut rolled_back = Vec::with_capacity(connected);
            for _ in 0..connected {
                if let Some(block) = state.disconnect_tip() {
                    rolled_back.push(block);
                }
            }
            for block in &disconnected {
                if let Err(e) = state.connect(&self.params, block.hash()) {
                    log::error!("Failed to restore block {}: {}", block.hash(), e);
                    break;
                }
            }

            rolled_back.reverse();
            state.restore_mempool(&self.params, &rolled_back, pending, now);
            return Err(err.into());
        }

        state.restore_mempool(&self.params, &disconnected, pending, now);
        Ok(disconnected.len())
    }

    /// Process orphans that were waiting on `parent`, and their descendants
    fn connect_orphans(&self, state: &mut ChainState, parent: Hash256, now: u64) {
        let mut queue = vec![parent];
        while let Some(parent) = queue.pop() {
            for child in state.orphans.take_children(&parent) {
                let hash = child.hash();
                match self.accept(state, child, now) {
                    Ok(status) if status.is_indexed() => {
                        log::debug!("Orphan {} connected: {:?}", hash, status);
                        queue.push(hash);
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("Orphan {} rejected: {}", hash, e),
                }
            }
        }
    }

    /// Write the part of `chain` the store does not hold yet
    fn persist(&self, generation: u64, chain: Vec<Arc<Block>>) {
        let Some(store) = &self.store else {
            return;
        };
        let mut persisted = self.persisted.lock();
        if persisted.generation >= generation {
            return;
        }

        let hashes: Vec<Hash256> = chain.iter().map(|block| block.hash()).collect();
        if hashes == persisted.hashes {
            persisted.generation = generation;
            return;
        }
        // the tip block is always rewritten so the stored tip follows it
        let from = hashes
            .iter()
            .zip(&persisted.hashes)
            .take_while(|(ours, stored)| ours == stored)
            .count()
            .min(hashes.len().saturating_sub(1));

        match store.save(from as u64, &chain[from..]) {
            Ok(()) => *persisted = Persisted { generation, hashes },
            Err(e) => log::warn!("Failed to persist chain at height {}: {}", chain.len().saturating_sub(1), e),
        }
    }

    /// Validate a transaction against the active chain and pool it
    pub fn submit_transaction(&self, tx: Transaction) -> Result<SubmitStatus> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let txid = tx.txid();
        if state.confirmed.contains_key(&txid) {
            return Ok(SubmitStatus::AlreadyKnown);
        }

        let tip_height = state.height();
        let status = state
            .mempool
            .submit(tx, &state.utxos, tip_height, &self.params, unix_now())?;
        if status == SubmitStatus::Accepted {
            log::debug!("Accepted transaction {} ({} pending)", txid, state.mempool.len());
        }
        Ok(status)
    }

    /// Drop pool entries older than the expiry window
    pub fn expire_mempool(&self) -> usize {
        self.state.lock().mempool.expire(unix_now())
    }

    pub fn tip(&self) -> Hash256 {
        self.state.lock().tip()
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height()
    }

    pub fn tip_block(&self) -> Option<Arc<Block>> {
        let state = self.state.lock();
        state.index.get(&state.tip()).map(|entry| entry.block.clone())
    }

    /// Cumulative work of the active chain
    pub fn chain_work(&self) -> U256 {
        self.state.lock().tip_work()
    }

    /// Bits a child of the active tip must carry
    pub fn next_bits(&self) -> u32 {
        let state = self.state.lock();
        state
            .index
            .next_bits(&self.params, &state.tip())
            .unwrap_or(self.params.initial_bits)
    }

    /// Active chain block at `height`
    pub fn get_block(&self, height: u64) -> Option<Arc<Block>> {
        let state = self.state.lock();
        let hash = state.active.get(height as usize)?;
        state.index.get(hash).map(|entry| entry.block.clone())
    }

    /// Any indexed block, active or not
    pub fn get_block_by_hash(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.state.lock().index.get(hash).map(|entry| entry.block.clone())
    }

    /// Whether the block is indexed, buffered as an orphan, or known invalid
    pub fn knows_block(&self, hash: &Hash256) -> bool {
        let state = self.state.lock();
        state.index.contains(hash) || state.orphans.contains(hash) || state.invalid.contains(hash)
    }

    pub fn is_active(&self, hash: &Hash256) -> bool {
        let state = self.state.lock();
        state
            .index
            .get(hash)
            .is_some_and(|entry| state.is_active(hash, entry.height))
    }

    /// Up to `max` active blocks starting at `from_height`
    pub fn blocks_from(&self, from_height: u64, max: usize) -> Vec<Arc<Block>> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .skip(from_height as usize)
            .take(max)
            .filter_map(|hash| state.index.get(hash).map(|entry| entry.block.clone()))
            .collect()
    }

    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphans.len()
    }

    pub fn is_confirmed(&self, txid: &Hash256) -> bool {
        self.state.lock().confirmed.contains_key(txid)
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.state.lock().utxos.get(outpoint).cloned()
    }

    /// Confirmed balance of an address
    pub fn get_balance(&self, address: &Address) -> u64 {
        self.state.lock().utxos.get_balance(&address.script_pubkey())
    }

    /// Every confirmed output paying `address`
    pub fn utxos_for(&self, address: &Address) -> Vec<(OutPoint, Utxo)> {
        self.state.lock().utxos.utxos_for(&address.script_pubkey())
    }

    /// Confirmed outputs of `address` not already spent by a pending transaction
    pub fn spendable_utxos(&self, address: &Address) -> Vec<(OutPoint, Utxo)> {
        let state = self.state.lock();
        let mut utxos: Vec<(OutPoint, Utxo)> = state
            .utxos
            .utxos_for(&address.script_pubkey())
            .into_iter()
            .filter(|(outpoint, _)| state.mempool.spender_of(outpoint).is_none())
            .collect();
        utxos.sort_by_key(|(outpoint, utxo)| (utxo.height, *outpoint));
        utxos
    }

    pub fn utxo_count(&self) -> usize {
        self.state.lock().utxos.len()
    }

    pub fn mempool_size(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> bool {
        self.state.lock().mempool.contains(txid)
    }

    pub fn mempool_transaction(&self, txid: &Hash256) -> Option<Transaction> {
        self.state.lock().mempool.get(txid).map(|entry| entry.tx.clone())
    }
}
