// Transaction data structures

use crate::core::{Hash256, OutPoint, Script, Serializable, hash256};
use crate::error::{NodeError, Result};
use std::io::Read;
use super::serialize::{read_count, read_hash, read_u32, read_u64, read_var_bytes, write_var_bytes, write_varint};

/// Sighash type committed to by every signature (SIGHASH_ALL)
pub const SIGHASH_ALL: u32 = 1;

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Hash of the previous transaction
    pub prev_tx_hash: Hash256,
    /// Index of the output in the previous transaction
    pub prev_index: u32,
    /// Signature script (scriptSig) - proves ownership
    pub script_sig: Vec<u8>,
    /// Sequence number (usually 0xffffffff)
    pub sequence: u32,
}

impl TxInput {
    /// Create a new transaction input
    pub fn new(prev_tx_hash: Hash256, prev_index: u32, script_sig: Vec<u8>) -> Self {
        Self {
            prev_tx_hash,
            prev_index,
            script_sig,
            sequence: 0xffffffff,
        }
    }

    /// Create a coinbase input committing to the block height
    pub fn coinbase(height: u32, tag: &[u8]) -> Self {
        let null = OutPoint::null();
        Self {
            prev_tx_hash: null.txid,
            prev_index: null.vout,
            script_sig: Script::coinbase_script_sig(height, tag),
            sequence: 0xffffffff,
        }
    }

    /// Check if this is a coinbase input
    pub fn is_coinbase(&self) -> bool {
        self.outpoint().is_null()
    }

    /// The output this input spends
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prev_tx_hash, self.prev_index)
    }
}

impl Serializable for TxInput {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.prev_tx_hash.as_bytes());
        buf.extend_from_slice(&self.prev_index.to_le_bytes());
        write_var_bytes(buf, &self.script_sig);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            prev_tx_hash: read_hash(reader)?,
            prev_index: read_u32(reader)?,
            script_sig: read_var_bytes(reader)?,
            sequence: read_u32(reader)?,
        })
    }
}

/// Transaction output - specifies amount and recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in base units
    pub value: u64,
    /// Public key script (scriptPubKey) - specifies conditions for spending
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    /// Create a new transaction output
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

impl Serializable for TxOutput {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(buf, &self.script_pubkey);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            value: read_u64(reader)?,
            script_pubkey: read_var_bytes(reader)?,
        })
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction version
    pub version: u32,
    /// Transaction inputs
    pub inputs: Vec<TxInput>,
    /// Transaction outputs
    pub outputs: Vec<TxOutput>,
    /// Lock time
    pub lock_time: u32,
}

impl Transaction {
    /// Create a new transaction
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Create a coinbase transaction (block reward) for the given height
    pub fn coinbase(height: u32, tag: &[u8], outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs: vec![TxInput::coinbase(height, tag)],
            outputs,
            lock_time: 0,
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Transaction ID (double SHA256 of serialized tx)
    pub fn txid(&self) -> Hash256 {
        hash256(&self.serialize())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    /// Total output value, `None` on overflow
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Outputs spent by this transaction (none for coinbase)
    pub fn spent_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs
            .iter()
            .filter(|input| !input.is_coinbase())
            .map(TxInput::outpoint)
    }

    /// Digest signed by the owner of input `input_index`.
    ///
    /// Every scriptSig is cleared, the signed input's slot carries the locking
    /// script of the output it spends, and the sighash type is appended.
    pub fn sig_hash(&self, input_index: usize, prev_script_pubkey: &[u8]) -> Result<Hash256> {
        if input_index >= self.inputs.len() {
            return Err(NodeError::malformed(format!(
                "input index {} out of range ({} inputs)",
                input_index,
                self.inputs.len()
            )));
        }

        let mut stripped = self.clone();
        for (i, input) in stripped.inputs.iter_mut().enumerate() {
            input.script_sig = if i == input_index {
                prev_script_pubkey.to_vec()
            } else {
                Vec::new()
            };
        }

        let mut buf = stripped.serialize();
        buf.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
        Ok(hash256(&buf))
    }
}

impl Serializable for Transaction {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_to(buf);
        }

        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_to(buf);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let version = read_u32(reader)?;

        let input_count = read_count(reader)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput::read_from(reader)?);
        }

        let output_count = read_count(reader)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput::read_from(reader)?);
        }

        let lock_time = read_u32(reader)?;

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}
