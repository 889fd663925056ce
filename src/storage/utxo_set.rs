// UTXO (Unspent Transaction Output) set management

use crate::config::ChainParams;
use crate::consensus::{block_subsidy, TransactionValidator, ValidationError};
use crate::core::{Block, OutPoint, TxOutput};
use std::collections::{HashMap, HashSet};

/// UTXO - contains the output and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub output: TxOutput,
    pub height: u64,       // Block height where this UTXO was created
    pub is_coinbase: bool, // Whether this is a coinbase output
}

impl Utxo {
    pub fn new(output: TxOutput, height: u64, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }
}

/// What `apply` changed, kept so the block can be disconnected again
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    /// Outputs the block spent, with their full entries
    pub spent: Vec<(OutPoint, Utxo)>,
    /// Outputs the block created
    pub created: Vec<OutPoint>,
    /// Fees collected by the block
    pub fees: u64,
}

/// The set of unspent outputs on the active chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    utxos: HashMap<OutPoint, Utxo>,
}

/// Pending changes of a block being applied
struct Staged<'a> {
    base: &'a HashMap<OutPoint, Utxo>,
    spent: HashSet<OutPoint>,
    created: HashMap<OutPoint, Utxo>,
}

impl Staged<'_> {
    fn lookup(&self, outpoint: &OutPoint) -> Option<Utxo> {
        if let Some(utxo) = self.created.get(outpoint) {
            return Some(utxo.clone());
        }
        if self.spent.contains(outpoint) {
            return None;
        }
        self.base.get(outpoint).cloned()
    }

    fn spend(&mut self, outpoint: OutPoint) {
        if self.created.remove(&outpoint).is_none() {
            self.spent.insert(outpoint);
        }
    }
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a UTXO
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Check if a UTXO exists
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &Utxo)> {
        self.utxos.iter()
    }

    /// Validate every transaction of `block` at `height` and, only if all pass,
    /// spend its inputs and add its outputs.
    ///
    /// Transactions may spend outputs created earlier in the same block.
    pub fn apply(&mut self, block: &Block, height: u64, params: &ChainParams) -> Result<BlockUndo, ValidationError> {
        let mut staged = Staged {
            base: &self.utxos,
            spent: HashSet::new(),
            created: HashMap::new(),
        };
        let mut fees = 0u64;

        for tx in &block.transactions {
            let is_coinbase = tx.is_coinbase();
            if !is_coinbase {
                let fee = TransactionValidator::check_inputs(
                    tx,
                    |outpoint| staged.lookup(outpoint),
                    height,
                    params.coinbase_maturity,
                )?;
                fees = fees.checked_add(fee).ok_or(ValidationError::ValueOverflow)?;
                for outpoint in tx.spent_outpoints() {
                    staged.spend(outpoint);
                }
            }

            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, vout as u32);
                staged
                    .created
                    .insert(outpoint, Utxo::new(output.clone(), height, is_coinbase));
            }
        }

        let coinbase = block.coinbase().ok_or(ValidationError::MissingCoinbase)?;
        let claimed = coinbase.total_output_value().ok_or(ValidationError::ValueOverflow)?;
        let allowed = block_subsidy(params, height)
            .checked_add(fees)
            .ok_or(ValidationError::ValueOverflow)?;
        if claimed > allowed {
            return Err(ValidationError::ExcessiveCoinbase { claimed, allowed });
        }

        // Everything checked; commit
        let Staged { spent, created, .. } = staged;
        let mut undo = BlockUndo {
            spent: Vec::with_capacity(spent.len()),
            created: Vec::with_capacity(created.len()),
            fees,
        };
        for outpoint in spent {
            if let Some(utxo) = self.utxos.remove(&outpoint) {
                undo.spent.push((outpoint, utxo));
            }
        }
        for (outpoint, utxo) in created {
            undo.created.push(outpoint);
            self.utxos.insert(outpoint, utxo);
        }

        Ok(undo)
    }

    /// Exact inverse of the `apply` that produced `undo`
    pub fn revert(&mut self, undo: &BlockUndo) {
        for outpoint in &undo.created {
            self.utxos.remove(outpoint);
        }
        for (outpoint, utxo) in &undo.spent {
            self.utxos.insert(*outpoint, utxo.clone());
        }
    }

    /// Get balance for a script pubkey
    pub fn get_balance(&self, script_pubkey: &[u8]) -> u64 {
        self.utxos
            .values()
            .filter(|utxo| utxo.output.script_pubkey == script_pubkey)
            .map(|utxo| utxo.output.value)
            .sum()
    }

    /// Outputs locked to a script pubkey, oldest first
    pub fn utxos_for(&self, script_pubkey: &[u8]) -> Vec<(OutPoint, Utxo)> {
        let mut found: Vec<(OutPoint, Utxo)> = self
            .utxos
            .iter()
            .filter(|(_, utxo)| utxo.output.script_pubkey == script_pubkey)
            .map(|(outpoint, utxo)| (*outpoint, utxo.clone()))
            .collect();
        found.sort_by(|a, b| a.1.height.cmp(&b.1.height).then(a.0.cmp(&b.0)));
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::core::{BlockHeader, Hash256, Script, Transaction, TxInput};
    use crate::wallet::KeyPair;

    fn params() -> ChainParams {
        ChainParams::regtest()
    }

    fn key(seed: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[seed; 32]).unwrap()
    }

    fn block(height: u32, txs: Vec<Transaction>, reward_to: &[u8], reward: u64) -> Block {
        let mut transactions = vec![Transaction::coinbase(
            height,
            b"utxo",
            vec![TxOutput::new(reward, reward_to.to_vec())],
        )];
        transactions.extend(txs);
        let merkle = Block::calculate_merkle_root(&transactions);
        Block::new(
            BlockHeader::new(1, Hash256::zero(), merkle, 0, 0x207fffff, 0),
            transactions,
        )
    }

    fn pay(from: &KeyPair, outpoint: OutPoint, prev_script: &[u8], outputs: Vec<TxOutput>) -> Transaction {
        let mut tx = Transaction::new(
            vec![TxInput::new(outpoint.txid, outpoint.vout, vec![])],
            outputs,
        );
        let sighash = tx.sig_hash(0, prev_script).unwrap();
        tx.inputs[0].script_sig = Script::p2pkh_script_sig(&from.sign(&sighash), &from.public_key_bytes());
        tx
    }

    /// UTXO set holding one mature 50-coin output for `alice`
    fn funded(alice: &KeyPair) -> (UtxoSet, OutPoint) {
        let params = params();
        let mut set = UtxoSet::new();
        let b0 = block(0, vec![], &alice.script_pubkey(), params.initial_subsidy);
        set.apply(&b0, 0, &params).unwrap();
        let outpoint = OutPoint::new(b0.transactions[0].txid(), 0);
        (set, outpoint)
    }

    #[test]
    fn test_apply_and_revert_restores_state() {
        let params = params();
        let alice = key(1);
        let bob = key(2);
        let (mut set, coin) = funded(&alice);
        let before = set.clone();

        let spend = pay(
            &alice,
            coin,
            &alice.script_pubkey(),
            vec![TxOutput::new(30 * 100_000_000, bob.script_pubkey()), TxOutput::new(19 * 100_000_000, alice.script_pubkey())],
        );
        let b1 = block(1, vec![spend], &bob.script_pubkey(), params.initial_subsidy + 100_000_000);

        let undo = set.apply(&b1, 1, &params).unwrap();
        assert!(!set.contains(&coin));
        assert_eq!(undo.fees, 100_000_000);
        assert_eq!(set.get_balance(&bob.script_pubkey()), 80 * 100_000_000 + 100_000_000);

        set.revert(&undo);
        assert_eq!(set, before);
    }

    #[test]
    fn test_failed_apply_changes_nothing() {
        let params = params();
        let alice = key(1);
        let (mut set, coin) = funded(&alice);
        let before = set.clone();

        let ok = pay(&alice, coin, &alice.script_pubkey(), vec![TxOutput::new(1, alice.script_pubkey())]);
        // second spend of the same coin inside one block
        let again = pay(&alice, coin, &alice.script_pubkey(), vec![TxOutput::new(2, alice.script_pubkey())]);
        let b1 = block(1, vec![ok, again], &alice.script_pubkey(), 1);

        assert_eq!(set.apply(&b1, 1, &params), Err(ValidationError::MissingInput(coin)));
        assert_eq!(set, before);
    }

    #[test]
    fn test_outputs_exceeding_inputs_rejected() {
        let params = params();
        let alice = key(1);
        let (mut set, coin) = funded(&alice);

        let greedy = pay(&alice, coin, &alice.script_pubkey(), vec![TxOutput::new(params.initial_subsidy + 1, alice.script_pubkey())]);
        let b1 = block(1, vec![greedy], &alice.script_pubkey(), 1);
        assert_eq!(set.apply(&b1, 1, &params), Err(ValidationError::OutputsExceedInputs));
    }

    #[test]
    fn test_excessive_coinbase_rejected() {
        let params = params();
        let alice = key(1);
        let (mut set, _) = funded(&alice);

        let b1 = block(1, vec![], &alice.script_pubkey(), params.initial_subsidy + 1);
        assert!(matches!(
            set.apply(&b1, 1, &params),
            Err(ValidationError::ExcessiveCoinbase { .. })
        ));
    }

    #[test]
    fn test_immature_coinbase() {
        let params = ChainParams {
            coinbase_maturity: 5,
            ..ChainParams::regtest()
        };
        let alice = key(1);
        let (mut set, coin) = funded(&alice);

        let spend = pay(&alice, coin, &alice.script_pubkey(), vec![TxOutput::new(1, alice.script_pubkey())]);
        let early = block(4, vec![spend.clone()], &alice.script_pubkey(), 1);
        assert_eq!(set.apply(&early, 4, &params), Err(ValidationError::ImmatureCoinbase(coin)));

        let mature = block(5, vec![spend], &alice.script_pubkey(), 1);
        assert!(set.apply(&mature, 5, &params).is_ok());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let params = params();
        let alice = key(1);
        let mallory = key(3);
        let (mut set, coin) = funded(&alice);

        let theft = pay(&mallory, coin, &alice.script_pubkey(), vec![TxOutput::new(1, mallory.script_pubkey())]);
        let b1 = block(1, vec![theft], &mallory.script_pubkey(), 1);
        assert_eq!(
            set.apply(&b1, 1, &params),
            Err(ValidationError::InvalidSignature { input: 0 })
        );
    }

    #[test]
    fn test_spend_within_block_and_utxos_for() {
        let params = params();
        let alice = key(1);
        let bob = key(2);
        let (mut set, coin) = funded(&alice);

        let first = pay(&alice, coin, &alice.script_pubkey(), vec![TxOutput::new(40, bob.script_pubkey())]);
        let chained = pay(
            &bob,
            OutPoint::new(first.txid(), 0),
            &bob.script_pubkey(),
            vec![TxOutput::new(30, alice.script_pubkey())],
        );
        let b1 = block(1, vec![first, chained], &bob.script_pubkey(), 0);
        let undo = set.apply(&b1, 1, &params).unwrap();

        // intermediate output never reaches the set
        assert_eq!(set.get_balance(&bob.script_pubkey()), 0);
        assert_eq!(set.utxos_for(&alice.script_pubkey()).len(), 1);
        assert_eq!(undo.spent.len(), 1);
    }
}
