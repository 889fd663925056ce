// Transaction and block validation

use crate::config::ChainParams;
use crate::consensus::pow::check_proof_of_work;
use crate::core::{Block, BlockHeader, Hash256, OutPoint, Script, Transaction, UnlockingScript};
use crate::storage::Utxo;
use std::collections::HashSet;
use thiserror::Error;

/// Largest amount any output set may carry (21M coins)
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Validation error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Block hash doesn't meet PoW target
    #[error("invalid proof of work")]
    InvalidProofOfWork,

    /// Compact target is negative, overflows or exceeds the network limit
    #[error("invalid target bits {0:08x}")]
    InvalidTarget(u32),

    #[error("unexpected difficulty: expected {expected:08x}, found {found:08x}")]
    UnexpectedDifficulty { expected: u32, found: u32 },

    /// Merkle root doesn't match calculated value
    #[error("invalid merkle root")]
    InvalidMerkleRoot,

    /// Block has no transactions
    #[error("block has no transactions")]
    NoTransactions,

    #[error("block has {0} transactions, over the limit")]
    TooManyTransactions(usize),

    /// First transaction is not coinbase
    #[error("missing coinbase transaction")]
    MissingCoinbase,

    /// Coinbase transaction in non-first position
    #[error("coinbase not in first position")]
    CoinbaseNotFirst,

    /// Coinbase scriptSig does not commit to the block height
    #[error("coinbase does not commit to height {0}")]
    BadCoinbaseHeight(u64),

    #[error("coinbase claims {claimed}, allowed {allowed}")]
    ExcessiveCoinbase { claimed: u64, allowed: u64 },

    /// Transaction has no inputs or outputs
    #[error("empty transaction")]
    EmptyTransaction,

    #[error("transaction {0} appears twice")]
    DuplicateTransaction(Hash256),

    #[error("input {0} spent twice in one transaction")]
    DuplicateInput(OutPoint),

    /// Input references an output that is not unspent
    #[error("missing or spent input {0}")]
    MissingInput(OutPoint),

    #[error("coinbase output {0} is not mature")]
    ImmatureCoinbase(OutPoint),

    /// Transaction input script verification failed
    #[error("invalid signature on input {input}")]
    InvalidSignature { input: usize },

    #[error("outputs exceed inputs")]
    OutputsExceedInputs,

    /// Mempool admission requires a strictly positive fee
    #[error("transaction pays no fee")]
    NonPositiveFee,

    #[error("amount overflow")]
    ValueOverflow,

    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },

    /// Total output value exceeds the maximum allowed supply
    #[error("total output value exceeds maximum supply")]
    OutputValueExceedsMax,

    #[error("coinbase transaction outside a block")]
    CoinbaseInMempool,

    /// Timestamp not after the median of recent blocks
    #[error("timestamp {0} not after median time past")]
    TimestampTooOld(u32),

    /// Block timestamp is too far in the future
    #[error("timestamp {0} too far in the future")]
    TimestampTooNew(u32),

    /// Block version not supported
    #[error("invalid version")]
    InvalidVersion,

    /// Stored chain starts from a different genesis block
    #[error("genesis mismatch: {0}")]
    GenesisMismatch(Hash256),

    #[error("block does not connect to {0}")]
    Disconnected(Hash256),
}

/// Context-free block checks
pub struct BlockValidator {
    pow_limit_bits: u32,
    max_transactions: usize,
}

impl BlockValidator {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            pow_limit_bits: params.pow_limit_bits,
            max_transactions: params.max_block_transactions,
        }
    }

    /// Validate a block header: version and proof of work against its own bits
    pub fn validate_header(&self, header: &BlockHeader) -> Result<(), ValidationError> {
        // Check version (must be >= 1)
        if header.version < 1 {
            return Err(ValidationError::InvalidVersion);
        }

        check_proof_of_work(header, self.pow_limit_bits)
    }

    /// Validate a complete block: structure and Merkle root first, then work
    pub fn validate_block(&self, block: &Block) -> Result<(), ValidationError> {
        // Must have at least one transaction
        if block.transactions.is_empty() {
            return Err(ValidationError::NoTransactions);
        }
        if block.transactions.len() > self.max_transactions {
            return Err(ValidationError::TooManyTransactions(block.transactions.len()));
        }

        // First transaction must be coinbase
        if !block.transactions[0].is_coinbase() {
            return Err(ValidationError::MissingCoinbase);
        }

        // Only first transaction can be coinbase
        if block.transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(ValidationError::CoinbaseNotFirst);
        }

        let mut seen = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            TransactionValidator::check_structure(tx)?;
            let txid = tx.txid();
            if !seen.insert(txid) {
                return Err(ValidationError::DuplicateTransaction(txid));
            }
        }

        // Validate merkle root
        let calculated_merkle = Block::calculate_merkle_root(&block.transactions);
        if calculated_merkle != block.header.merkle_root {
            return Err(ValidationError::InvalidMerkleRoot);
        }

        self.validate_header(&block.header)
    }

    /// The coinbase scriptSig must start with the block height
    pub fn check_coinbase_height(block: &Block, height: u64) -> Result<(), ValidationError> {
        let committed = block
            .coinbase()
            .and_then(|tx| UnlockingScript::parse_coinbase(&tx.inputs[0].script_sig));

        match committed {
            Some(UnlockingScript::Coinbase { height: h, .. }) if h as u64 == height => Ok(()),
            _ => Err(ValidationError::BadCoinbaseHeight(height)),
        }
    }
}

/// Transaction checks shared by block application and mempool admission
pub struct TransactionValidator;

impl TransactionValidator {
    /// Checks that need no chain state
    pub fn check_structure(tx: &Transaction) -> Result<(), ValidationError> {
        // Must have inputs and outputs
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(ValidationError::EmptyTransaction);
        }

        let total_output = tx.total_output_value().ok_or(ValidationError::ValueOverflow)?;
        if total_output > MAX_MONEY {
            return Err(ValidationError::OutputValueExceedsMax);
        }

        if tx.is_coinbase() {
            if UnlockingScript::parse_coinbase(&tx.inputs[0].script_sig).is_none() {
                return Err(ValidationError::BadCoinbaseHeight(0));
            }
            return Ok(());
        }

        let mut spent = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            if outpoint.is_null() {
                return Err(ValidationError::CoinbaseNotFirst);
            }
            if !spent.insert(outpoint) {
                return Err(ValidationError::DuplicateInput(outpoint));
            }
        }

        Ok(())
    }

    /// Validate a transaction for mempool acceptance (structure only)
    pub fn validate_for_mempool(tx: &Transaction) -> Result<(), ValidationError> {
        // Cannot be coinbase
        if tx.is_coinbase() {
            return Err(ValidationError::CoinbaseInMempool);
        }
        Self::check_structure(tx)
    }

    /// Check every input against the outputs `lookup` can see and return the fee.
    ///
    /// Verifies existence, coinbase maturity at `spend_height` and each P2PKH
    /// signature over its signature digest. A fee of zero is accepted here.
    pub fn check_inputs<F>(
        tx: &Transaction,
        lookup: F,
        spend_height: u64,
        coinbase_maturity: u32,
    ) -> Result<u64, ValidationError>
    where
        F: Fn(&OutPoint) -> Option<Utxo>,
    {
        let mut total_input = 0u64;

        for (index, input) in tx.inputs.iter().enumerate() {
            let outpoint = input.outpoint();
            let utxo = lookup(&outpoint).ok_or(ValidationError::MissingInput(outpoint))?;

            if utxo.is_coinbase && spend_height.saturating_sub(utxo.height) < coinbase_maturity as u64 {
                return Err(ValidationError::ImmatureCoinbase(outpoint));
            }

            let sighash = tx
                .sig_hash(index, &utxo.output.script_pubkey)
                .map_err(|_| ValidationError::InvalidSignature { input: index })?;
            if !Script::verify_input(&input.script_sig, &utxo.output.script_pubkey, &sighash) {
                return Err(ValidationError::InvalidSignature { input: index });
            }

            total_input = total_input
                .checked_add(utxo.output.value)
                .ok_or(ValidationError::ValueOverflow)?;
        }

        let total_output = tx.total_output_value().ok_or(ValidationError::ValueOverflow)?;
        total_input
            .checked_sub(total_output)
            .ok_or(ValidationError::OutputsExceedInputs)
    }
}
