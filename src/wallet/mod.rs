// Wallet helpers: keys, addresses and transaction building

mod keys;
mod tx_builder;

pub use keys::{Address, KeyPair};
pub use tx_builder::TransactionBuilder;
