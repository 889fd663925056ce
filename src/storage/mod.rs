// Storage layer: UTXO ledger and block persistence

mod blockchain_db;
mod utxo_set;

pub use blockchain_db::{ChainStore, SledStore};
pub use utxo_set::{BlockUndo, Utxo, UtxoSet};
