// Block data structures

use crate::config::ChainParams;
use crate::core::{Hash256, hash256, merkle_root, Script, Serializable, Transaction, TxOutput};
use crate::error::{NodeError, Result};
use std::io::Read;
use super::serialize::{read_array, read_count, read_hash, read_u32, write_varint};

/// Serialized header size in bytes
pub const HEADER_SIZE: usize = 80;

/// Block header - 80 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,
    /// Hash of the previous block
    pub prev_block_hash: Hash256,
    /// Merkle root of all transactions in the block
    pub merkle_root: Hash256,
    /// Block timestamp (Unix epoch)
    pub timestamp: u32,
    /// Difficulty target (compact format)
    pub bits: u32,
    /// Nonce for proof-of-work
    pub nonce: u32,
}

impl BlockHeader {
    /// Create a new block header
    pub fn new(
        version: u32,
        prev_block_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    /// Calculate the hash of this block header
    pub fn hash(&self) -> Hash256 {
        hash256(&self.to_bytes())
    }

    /// Fixed-size encoding hashed by proof-of-work
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.prev_block_hash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }
}

impl Serializable for BlockHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes());
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            version: read_u32(reader)?,
            prev_block_hash: read_hash(reader)?,
            merkle_root: read_hash(reader)?,
            timestamp: read_u32(reader)?,
            bits: read_u32(reader)?,
            nonce: u32::from_le_bytes(read_array(reader)?),
        })
    }
}

/// Block - contains header and transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Transactions in this block, coinbase first
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Create the genesis block for a parameter set
    pub fn genesis(params: &ChainParams) -> Self {
        // Reward goes to an all-zero key hash nobody can sign for
        let coinbase_output = TxOutput::new(
            params.initial_subsidy,
            Script::p2pkh_script_pubkey(&[0u8; 20]),
        );
        let coinbase_tx = Transaction::coinbase(0, b"ledger-node genesis", vec![coinbase_output]);

        let merkle_root = Self::calculate_merkle_root(std::slice::from_ref(&coinbase_tx));

        let header = BlockHeader::new(
            1,
            Hash256::zero(),
            merkle_root,
            params.genesis_timestamp,
            params.initial_bits,
            0,
        );

        Self {
            header,
            transactions: vec![coinbase_tx],
        }
    }

    /// Calculate Merkle root from transactions
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        merkle_root(&txids)
    }

    /// Get the block hash
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash == Hash256::zero()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}

impl Serializable for Block {
    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write_to(buf);
        }
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let header = BlockHeader::read_from(reader)?;

        let tx_count = read_count(reader)?;
        if tx_count == 0 {
            return Err(NodeError::malformed("block without transactions"));
        }
        let mut transactions = Vec::with_capacity(tx_count.min(1024));
        for _ in 0..tx_count {
            transactions.push(Transaction::read_from(reader)?);
        }

        Ok(Self {
            header,
            transactions,
        })
    }
}
