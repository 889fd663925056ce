// Block templates and the mining loop

use super::manager::{unix_now, BlockStatus, ChainManager, ChainState};
use crate::consensus::{block_subsidy, Miner, MiningOutcome, ValidationError};
use crate::core::{Block, BlockHeader, Hash256, Transaction, TxOutput};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

pub const BLOCK_VERSION: u32 = 1;

/// Tag written after the height in every coinbase we mine
pub const COINBASE_TAG: &[u8] = b"ledger-node";

/// An unsolved block and the tip generation it was built against
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub height: u64,
    /// Fees collected by the coinbase
    pub fees: u64,
    pub generation: u64,
}

/// Counts a running miner for as long as it lives
struct MiningGuard<'a> {
    chain: &'a ChainManager,
}

impl<'a> MiningGuard<'a> {
    fn new(chain: &'a ChainManager) -> Self {
        chain.miners.fetch_add(1, Ordering::SeqCst);
        chain.settle_status();
        Self { chain }
    }
}

impl Drop for MiningGuard<'_> {
    fn drop(&mut self) {
        self.chain.miners.fetch_sub(1, Ordering::SeqCst);
        self.chain.settle_status();
    }
}

impl ChainManager {
    /// Template on the active tip carrying the best-paying pending transactions
    pub fn template(&self, reward_script: &[u8]) -> Result<BlockTemplate> {
        let state = self.state.lock();
        let parent = state.tip();

        let transactions = state
            .mempool
            .select_for_block(self.params.max_block_transactions.saturating_sub(1));
        let fees = transactions
            .iter()
            .filter_map(|tx| state.mempool.get(&tx.txid()))
            .fold(0u64, |total, entry| total.saturating_add(entry.fee));

        let median = state.index.median_time_past(&parent, self.params.median_time_span);
        let timestamp = (unix_now() as u32).max(median + 1);

        self.build_template(&state, &parent, transactions, fees, timestamp, reward_script)
    }

    /// Template on any indexed block with caller-chosen transactions and time.
    ///
    /// The coinbase claims the subsidy only.
    pub fn template_on(
        &self,
        parent: &Hash256,
        transactions: Vec<Transaction>,
        timestamp: u32,
        reward_script: &[u8],
    ) -> Result<BlockTemplate> {
        let state = self.state.lock();
        self.build_template(&state, parent, transactions, 0, timestamp, reward_script)
    }

    fn build_template(
        &self,
        state: &ChainState,
        parent: &Hash256,
        transactions: Vec<Transaction>,
        fees: u64,
        timestamp: u32,
        reward_script: &[u8],
    ) -> Result<BlockTemplate> {
        let entry = state
            .index
            .get(parent)
            .ok_or(ValidationError::Disconnected(*parent))?;
        let height = entry.height + 1;
        let bits = state
            .index
            .next_bits(&self.params, parent)
            .ok_or(ValidationError::Disconnected(*parent))?;

        let reward = block_subsidy(&self.params, height).saturating_add(fees);
        let coinbase_height = u32::try_from(height).map_err(|_| ValidationError::BadCoinbaseHeight(height))?;
        let coinbase = Transaction::coinbase(
            coinbase_height,
            COINBASE_TAG,
            vec![TxOutput::new(reward, reward_script.to_vec())],
        );

        let mut all = Vec::with_capacity(transactions.len() + 1);
        all.push(coinbase);
        all.extend(transactions);

        let merkle_root = Block::calculate_merkle_root(&all);
        let header = BlockHeader::new(BLOCK_VERSION, *parent, merkle_root, timestamp, bits, 0);

        Ok(BlockTemplate {
            block: Block::new(header, all),
            height,
            fees,
            generation: self.generation(),
        })
    }

    /// Solve a template. Gives up when `stop` is set or the tip moves.
    pub fn solve(&self, template: BlockTemplate, stop: &AtomicBool) -> Option<Block> {
        let miner = match Miner::new(template.block.header.bits) {
            Ok(miner) => miner,
            Err(e) => {
                log::error!("Cannot mine template at height {}: {}", template.height, e);
                return None;
            }
        };

        let mut block = template.block;
        let generation = template.generation;
        let result = miner.mine(&mut block.header, || {
            stop.load(Ordering::Relaxed) || self.generation() != generation
        });

        match result.outcome {
            MiningOutcome::Found => {
                log::debug!(
                    "Solved height {} after {} attempts ({:.0} H/s)",
                    template.height,
                    result.attempts,
                    result.hash_rate()
                );
                Some(block)
            }
            _ => None,
        }
    }

    /// Mine one block on the active tip and submit it.
    ///
    /// Restarts on a fresh template whenever another block moves the tip first.
    pub fn request_mine(&self, reward_script: &[u8]) -> Result<(Block, BlockStatus)> {
        let _mining = MiningGuard::new(self);
        let never = AtomicBool::new(false);

        loop {
            let template = self.template(reward_script)?;
            let Some(block) = self.solve(template, &never) else {
                log::debug!("Tip moved while mining, rebuilding template");
                continue;
            };
            let status = self.process_block(block.clone())?;
            return Ok((block, status));
        }
    }

    /// Mine on a background thread until the handle is stopped.
    ///
    /// Blocks that become the new tip are sent on `mined` for broadcast.
    pub fn spawn_miner(self: &Arc<Self>, reward_script: Vec<u8>, mined: mpsc::Sender<Arc<Block>>) -> MinerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let chain = Arc::clone(self);
        let flag = Arc::clone(&stop);

        let thread = thread::spawn(move || {
            let _mining = MiningGuard::new(&chain);
            log::info!("Miner started");

            while !flag.load(Ordering::Relaxed) {
                let template = match chain.template(&reward_script) {
                    Ok(template) => template,
                    Err(e) => {
                        log::error!("Failed to build block template: {}", e);
                        thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                };

                let Some(block) = chain.solve(template, &flag) else {
                    continue;
                };
                let hash = block.hash();

                match chain.process_block(block.clone()) {
                    Ok(status) if status.is_new_tip() => {
                        log::info!("Mined block {} ({:?})", hash, status);
                        if mined.blocking_send(Arc::new(block)).is_err() {
                            log::debug!("Block receiver closed, stopping miner");
                            break;
                        }
                    }
                    Ok(status) => log::debug!("Mined block {} not adopted: {:?}", hash, status),
                    Err(e) => log::warn!("Mined block {} rejected: {}", hash, e),
                }
            }

            log::info!("Miner stopped");
        });

        MinerHandle {
            stop,
            thread: Some(thread),
        }
    }

    pub fn is_mining(&self) -> bool {
        self.miners.load(Ordering::SeqCst) > 0
    }
}

/// Stops the background miner when dropped
pub struct MinerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MinerHandle {
    /// Signal the miner and wait for it to finish its current attempt batch
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Miner thread panicked");
            }
        }
    }
}

impl Drop for MinerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
