// Transaction builder

use crate::consensus::ValidationError;
use crate::core::{OutPoint, Script, Transaction, TxInput, TxOutput};
use crate::error::Result;
use crate::storage::Utxo;
use crate::wallet::{Address, KeyPair};

/// Builds and signs payments from one key's outputs
pub struct TransactionBuilder<'a> {
    keypair: &'a KeyPair,
    utxos: Vec<(OutPoint, Utxo)>,
}

impl<'a> TransactionBuilder<'a> {
    /// `utxos` are the spendable outputs of `keypair`, in preferred spending order
    pub fn new(keypair: &'a KeyPair, utxos: Vec<(OutPoint, Utxo)>) -> Self {
        Self { keypair, utxos }
    }

    /// Build a transaction to send amount to recipient
    pub fn build(&self, to: &Address, amount: u64, fee: u64) -> Result<Transaction> {
        let target = amount.checked_add(fee).ok_or(ValidationError::ValueOverflow)?;

        // Select UTXOs (simple strategy: oldest first until covered)
        let (selected, total_input) = self.select_utxos(target)?;

        // Create inputs (unsigned)
        let inputs: Vec<TxInput> = selected
            .iter()
            .map(|(outpoint, _)| TxInput::new(outpoint.txid, outpoint.vout, vec![]))
            .collect();

        // Payment output
        let mut outputs = vec![TxOutput::new(amount, to.script_pubkey())];

        // Change output (if any)
        let change = total_input - target;
        if change > 0 {
            outputs.push(TxOutput::new(change, self.keypair.script_pubkey()));
        }

        let mut tx = Transaction::new(inputs, outputs);
        self.sign_transaction(&mut tx, &selected)?;
        Ok(tx)
    }

    /// Select UTXOs to cover amount
    fn select_utxos(&self, target: u64) -> Result<(Vec<(OutPoint, Utxo)>, u64)> {
        let mut selected = Vec::new();
        let mut total = 0u64;

        for (outpoint, utxo) in &self.utxos {
            selected.push((*outpoint, utxo.clone()));
            total = total.checked_add(utxo.output.value).ok_or(ValidationError::ValueOverflow)?;

            if total >= target {
                return Ok((selected, total));
            }
        }

        Err(ValidationError::InsufficientFunds { have: total, need: target }.into())
    }

    /// Sign every input over its own signature digest
    fn sign_transaction(&self, tx: &mut Transaction, spent: &[(OutPoint, Utxo)]) -> Result<()> {
        let pubkey = self.keypair.public_key_bytes();

        let mut script_sigs = Vec::with_capacity(spent.len());
        for (index, (_, utxo)) in spent.iter().enumerate() {
            let sighash = tx.sig_hash(index, &utxo.output.script_pubkey)?;
            let signature = self.keypair.sign(&sighash);
            script_sigs.push(Script::p2pkh_script_sig(&signature, &pubkey));
        }

        for (input, script_sig) in tx.inputs.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(())
    }
}
