// Pending transaction pool, ordered by fee rate

use crate::config::ChainParams;
use crate::consensus::{TransactionValidator, ValidationError};
use crate::core::{Block, Hash256, OutPoint, Transaction};
use crate::error::{ConflictError, Result};
use crate::storage::{Utxo, UtxoSet};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// A validated, unconfirmed transaction
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Sum of inputs minus sum of outputs
    pub fee: u64,
    /// Serialized size in bytes
    pub size: usize,
    /// Arrival order, used to break fee-rate ties
    pub sequence: u64,
    /// Arrival time (Unix seconds)
    pub time: u64,
}

impl MempoolEntry {
    /// Fee per byte, for display
    pub fn fee_rate(&self) -> f64 {
        self.fee as f64 / self.size.max(1) as f64
    }

    /// Higher fee rate first, earlier arrival on ties
    fn priority_cmp(&self, other: &Self) -> Ordering {
        // fee_a / size_a vs fee_b / size_b without division
        let lhs = self.fee as u128 * other.size as u128;
        let rhs = other.fee as u128 * self.size as u128;
        rhs.cmp(&lhs).then(self.sequence.cmp(&other.sequence))
    }
}

/// Outcome of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    /// Already pending; nothing changed
    AlreadyKnown,
}

/// Memory pool
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Which pending transaction spends each outpoint
    spent_by: HashMap<OutPoint, Hash256>,
    capacity: usize,
    expiry_secs: u64,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(capacity: usize, expiry_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            spent_by: HashMap::new(),
            capacity: capacity.max(1),
            expiry_secs,
            next_sequence: 0,
        }
    }

    pub fn from_params(params: &ChainParams) -> Self {
        Self::new(params.mempool_capacity, params.mempool_expiry_secs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Pending transaction spending `outpoint`, if any
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent_by.get(outpoint).copied()
    }

    /// Validate `tx` against the ledger plus pending parents and add it.
    ///
    /// `tip_height` is the height of the active tip; the transaction is checked
    /// as if mined in the next block.
    pub fn submit(
        &mut self,
        tx: Transaction,
        utxos: &UtxoSet,
        tip_height: u64,
        params: &ChainParams,
        now: u64,
    ) -> Result<SubmitStatus> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Ok(SubmitStatus::AlreadyKnown);
        }

        TransactionValidator::validate_for_mempool(&tx)?;

        for outpoint in tx.spent_outpoints() {
            if let Some(spender) = self.spent_by.get(&outpoint) {
                return Err(ConflictError::DoubleSpend {
                    outpoint,
                    spender: *spender,
                }
                .into());
            }
        }

        let spend_height = tip_height + 1;
        let fee = TransactionValidator::check_inputs(
            &tx,
            |outpoint| self.lookup(utxos, outpoint, spend_height),
            spend_height,
            params.coinbase_maturity,
        )?;
        if fee == 0 {
            return Err(ValidationError::NonPositiveFee.into());
        }

        let size = tx.size();
        let entry = MempoolEntry {
            tx,
            txid,
            fee,
            size,
            sequence: self.next_sequence,
            time: now,
        };

        if self.entries.len() >= self.capacity {
            self.make_room(&entry)?;
        }

        self.next_sequence += 1;
        for outpoint in entry.tx.spent_outpoints() {
            self.spent_by.insert(outpoint, txid);
        }
        self.entries.insert(txid, entry);
        Ok(SubmitStatus::Accepted)
    }

    /// Confirmed output, or an output of a pending transaction
    fn lookup(&self, utxos: &UtxoSet, outpoint: &OutPoint, spend_height: u64) -> Option<Utxo> {
        if let Some(utxo) = utxos.get(outpoint) {
            return Some(utxo.clone());
        }
        let parent = self.entries.get(&outpoint.txid)?;
        let output = parent.tx.outputs.get(outpoint.vout as usize)?;
        Some(Utxo::new(output.clone(), spend_height, false))
    }

    /// Evict the cheapest entries until one slot is free, never touching
    /// the newcomer's own pending ancestors.
    fn make_room(&mut self, newcomer: &MempoolEntry) -> Result<()> {
        let ancestors = self.ancestors_of(&newcomer.tx);

        while self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .values()
                .filter(|entry| !ancestors.contains(&entry.txid))
                .max_by(|a, b| a.priority_cmp(b))
                .filter(|lowest| newcomer.priority_cmp(lowest) == Ordering::Less)
                .map(|lowest| lowest.txid);

            match victim {
                Some(txid) => {
                    let evicted = self.remove_with_descendants(&txid);
                    log::debug!("Mempool full: evicted {} transaction(s) starting at {}", evicted.len(), txid);
                }
                None => return Err(ConflictError::MempoolFull.into()),
            }
        }
        Ok(())
    }

    fn ancestors_of(&self, tx: &Transaction) -> HashSet<Hash256> {
        let mut ancestors = HashSet::new();
        let mut stack: Vec<Hash256> = tx.spent_outpoints().map(|op| op.txid).collect();
        while let Some(txid) = stack.pop() {
            if let Some(entry) = self.entries.get(&txid) {
                if ancestors.insert(txid) {
                    stack.extend(entry.tx.spent_outpoints().map(|op| op.txid));
                }
            }
        }
        ancestors
    }

    /// Remove one entry without touching its children
    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for outpoint in entry.tx.spent_outpoints() {
            if self.spent_by.get(&outpoint) == Some(txid) {
                self.spent_by.remove(&outpoint);
            }
        }
        Some(entry)
    }

    /// Remove an entry and everything that spends its outputs, transitively
    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let mut stack = vec![*txid];

        while let Some(current) = stack.pop() {
            let Some(entry) = self.remove_entry(&current) else {
                continue;
            };
            for vout in 0..entry.tx.outputs.len() {
                if let Some(child) = self.spent_by.get(&OutPoint::new(current, vout as u32)) {
                    stack.push(*child);
                }
            }
            removed.push(entry);
        }

        removed
    }

    /// Up to `max_count` transactions by descending fee rate, earliest arrival
    /// first on ties, with every pending parent placed before its children.
    pub fn select_for_block(&self, max_count: usize) -> Vec<Transaction> {
        let mut remaining: Vec<&MempoolEntry> = self.entries.values().collect();
        remaining.sort_by(|a, b| a.priority_cmp(b));

        let mut selected = Vec::with_capacity(max_count.min(remaining.len()));
        let mut included = HashSet::new();

        while selected.len() < max_count && !remaining.is_empty() {
            let before = selected.len();
            remaining.retain(|entry| {
                if selected.len() >= max_count {
                    return true;
                }
                let parents_ready = entry
                    .tx
                    .spent_outpoints()
                    .all(|op| !self.entries.contains_key(&op.txid) || included.contains(&op.txid));
                if !parents_ready {
                    return true;
                }
                included.insert(entry.txid);
                selected.push(entry.tx.clone());
                false
            });
            if selected.len() == before {
                break;
            }
        }

        selected
    }

    /// Drop transactions confirmed by `block` and everything that now
    /// conflicts with it. Returns the number of entries removed.
    pub fn on_block_accepted(&mut self, block: &Block) -> usize {
        let mut removed = 0;

        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            if self.remove_entry(&tx.txid()).is_some() {
                removed += 1;
            }
        }

        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for outpoint in tx.spent_outpoints() {
                if let Some(conflict) = self.spent_by.get(&outpoint).copied() {
                    let evicted = self.remove_with_descendants(&conflict);
                    log::debug!("Evicted {} conflicting transaction(s) spending {}", evicted.len(), outpoint);
                    removed += evicted.len();
                }
            }
        }

        removed
    }

    /// Drop entries older than the expiry window
    pub fn expire(&mut self, now: u64) -> usize {
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.time) > self.expiry_secs)
            .map(|entry| entry.txid)
            .collect();

        let mut removed = 0;
        for txid in expired {
            removed += self.remove_with_descendants(&txid).len();
        }
        if removed > 0 {
            log::debug!("Expired {} mempool transaction(s)", removed);
        }
        removed
    }

    /// Empty the pool, returning entries in arrival order
    pub fn drain(&mut self) -> Vec<MempoolEntry> {
        self.spent_by.clear();
        let mut entries: Vec<MempoolEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }
}
