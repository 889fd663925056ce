// Educational UTXO ledger node
// Proof-of-work chain with forks, reorganizations, a mempool and gossip networking

pub mod chain;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod mempool;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use chain::{BlockStatus, ChainManager, ChainStatus};
pub use config::{ChainParams, NodeConfig, COIN};
pub use consensus::{BlockValidator, Miner, Target, ValidationError};
pub use crate::core::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
pub use error::{ConflictError, NodeError, RejectCode, Result};
pub use mempool::{Mempool, SubmitStatus};
pub use network::{Message, Node, Peer, PeerInfo};
pub use storage::{ChainStore, SledStore, Utxo, UtxoSet};
pub use wallet::{Address, KeyPair, TransactionBuilder};
