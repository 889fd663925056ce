// Chain management: block tree, fork choice, mining

mod index;
mod manager;
mod miner;
mod orphans;

pub use index::{BlockIndex, IndexEntry};
pub use manager::{unix_now, BlockStatus, ChainManager, ChainStatus};
pub use miner::{BlockTemplate, MinerHandle, BLOCK_VERSION, COINBASE_TAG};
pub use orphans::OrphanPool;
