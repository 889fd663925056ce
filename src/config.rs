// Consensus parameters and node settings

use crate::error::{NodeError, Result};
use crate::wallet::Address;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// Consensus constants shared by every node on a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Timestamp of the genesis header
    pub genesis_timestamp: u32,
    /// Easiest target allowed (compact form)
    pub pow_limit_bits: u32,
    /// Target of genesis and of every block before the first retarget
    pub initial_bits: u32,
    /// Blocks between difficulty retargets
    pub retarget_interval: u32,
    /// Desired seconds between blocks
    pub target_block_time: u32,
    /// Largest factor the target may move by in one retarget
    pub max_adjustment_factor: u32,
    pub initial_subsidy: u64,
    pub halving_interval: u32,
    /// Confirmations before a coinbase output can be spent
    pub coinbase_maturity: u32,
    /// How far ahead of local time a block timestamp may be (seconds)
    pub max_future_block_time: u32,
    /// Number of ancestors used for the median-time-past rule
    pub median_time_span: usize,
    /// Transactions per block, coinbase included
    pub max_block_transactions: usize,
    pub mempool_capacity: usize,
    pub mempool_expiry_secs: u64,
    pub max_orphan_blocks: usize,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            genesis_timestamp: 1_700_000_000,
            pow_limit_bits: 0x207fffff,
            initial_bits: 0x1f00ffff,
            retarget_interval: 10,
            target_block_time: 60,
            max_adjustment_factor: 4,
            initial_subsidy: 50 * COIN,
            halving_interval: 210_000,
            coinbase_maturity: 100,
            max_future_block_time: 2 * 60 * 60,
            median_time_span: 11,
            max_block_transactions: 2_000,
            mempool_capacity: 10_000,
            mempool_expiry_secs: 3_600,
            max_orphan_blocks: 256,
        }
    }
}

impl ChainParams {
    /// Parameters for local experiments: trivial work and immediately spendable rewards
    pub fn regtest() -> Self {
        Self {
            initial_bits: 0x207fffff,
            coinbase_maturity: 1,
            ..Self::default()
        }
    }

    /// Load parameters from a JSON file; missing fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::persistence(format!("read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(data)
            .map_err(|e| NodeError::malformed(format!("chain params: {}", e)))?;
        params.check()?;
        Ok(params)
    }

    /// Reject parameter sets the consensus code cannot work with
    pub fn check(&self) -> Result<()> {
        if self.retarget_interval < 2 {
            return Err(NodeError::malformed("retarget_interval must be at least 2"));
        }
        if self.target_block_time == 0 || self.max_adjustment_factor == 0 {
            return Err(NodeError::malformed("block time and adjustment factor must be positive"));
        }
        if self.halving_interval == 0 || self.median_time_span == 0 {
            return Err(NodeError::malformed("halving interval and median span must be positive"));
        }
        if self.max_block_transactions == 0 {
            return Err(NodeError::malformed("max_block_transactions must be positive"));
        }
        Ok(())
    }
}

/// Process-level settings for a running node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub seed_peer: Option<SocketAddr>,
    /// Block store location; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    pub mining: bool,
    /// Recipient of mined rewards
    pub reward_address: Option<Address>,
    pub max_peers: usize,
    /// Peer lead (in blocks) that triggers a sync
    pub sync_threshold: u64,
    pub sync_timeout: Duration,
    pub peer_exchange_interval: Duration,
    /// How long a gossiped id stays in the dedup cache
    pub seen_ttl: Duration,
    pub params: ChainParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8333)),
            seed_peer: None,
            data_dir: None,
            mining: false,
            reward_address: None,
            max_peers: 32,
            sync_threshold: 0,
            sync_timeout: Duration::from_secs(10),
            peer_exchange_interval: Duration::from_secs(60),
            seen_ttl: Duration::from_secs(120),
            params: ChainParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_consistent() {
        let params = ChainParams::default();
        assert!(params.check().is_ok());
        assert_eq!(params.initial_subsidy, 5_000_000_000);
        assert_eq!(params.retarget_interval, 10);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let params = ChainParams::from_json(r#"{ "coinbase_maturity": 3, "target_block_time": 30 }"#).unwrap();
        assert_eq!(params.coinbase_maturity, 3);
        assert_eq!(params.target_block_time, 30);
        assert_eq!(params.halving_interval, ChainParams::default().halving_interval);
    }

    #[test]
    fn test_json_roundtrip() {
        let params = ChainParams::regtest();
        let json = serde_json::to_string_pretty(&params).unwrap();
        assert_eq!(ChainParams::from_json(&json).unwrap(), params);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(matches!(
            ChainParams::from_json(r#"{ "retarget_interval": 1 }"#),
            Err(NodeError::Malformed(_))
        ));
        assert!(ChainParams::from_json("not json").is_err());
    }
}
