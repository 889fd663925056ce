// CLI commands

use crate::chain::ChainManager;
use crate::config::{ChainParams, NodeConfig, COIN};
use crate::core::{Block, Hash256};
use crate::error::{NodeError, Result};
use crate::network::{Message, Node, Peer, VersionMessage, MAX_BLOCKS_PER_MESSAGE};
use crate::storage::{ChainStore, SledStore};
use crate::wallet::{Address, KeyPair, TransactionBuilder};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

#[derive(Parser)]
#[command(name = "ledger-node")]
#[command(about = "Educational UTXO ledger node", long_about = None)]
pub struct Cli {
    /// Directory holding the block store
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// JSON file overriding chain parameters
    #[arg(long, global = true)]
    pub params: Option<PathBuf>,

    /// Use easy regtest parameters instead of the defaults
    #[arg(long, global = true)]
    pub regtest: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node
    Run(RunArgs),

    /// Get blockchain info from the block store
    Info,

    /// Block commands
    #[command(subcommand)]
    Block(BlockCommands),

    /// Wallet commands
    #[command(subcommand)]
    Wallet(WalletCommands),
}

#[derive(Args)]
pub struct RunArgs {
    /// Address to accept peers on
    #[arg(short, long, default_value = "127.0.0.1:8333")]
    pub listen: SocketAddr,

    /// Peer to connect to at startup
    #[arg(short, long)]
    pub seed: Option<SocketAddr>,

    /// Mine continuously on the best tip
    #[arg(long)]
    pub mine: bool,

    /// Address receiving mined rewards
    #[arg(long)]
    pub reward_address: Option<Address>,

    #[arg(long, default_value = "32")]
    pub max_peers: usize,

    /// Peer lead in blocks before syncing
    #[arg(long, default_value = "0")]
    pub sync_threshold: u64,

    /// Seconds to wait for handshakes and block batches
    #[arg(long, default_value = "10")]
    pub sync_timeout: u64,

    /// Seconds between peer exchange rounds
    #[arg(long, default_value = "60")]
    pub peer_exchange: u64,
}

#[derive(Subcommand)]
pub enum BlockCommands {
    /// Get block by hash or height
    Get {
        /// Block hash or height
        id: String,
    },

    /// Get blockchain height
    Height,

    /// Get best block hash
    BestBlock,
}

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Generate a key pair
    NewKey,

    /// Show the address of a secret key
    Address {
        /// Hex-encoded secret key
        secret: String,
    },

    /// Get balance for an address, read from a running node
    Balance {
        address: Address,
        /// Node to read the chain from
        #[arg(short, long, default_value = "127.0.0.1:8333")]
        peer: SocketAddr,
    },

    /// Send coins through a running node
    Send {
        /// Hex-encoded secret key of the sender
        secret: String,
        /// Recipient address
        to: Address,
        /// Amount in base units
        amount: u64,
        /// Transaction fee in base units
        #[arg(short, long, default_value = "1000")]
        fee: u64,
        #[arg(short, long, default_value = "127.0.0.1:8333")]
        peer: SocketAddr,
    },
}

impl RunArgs {
    fn into_config(self, params: ChainParams, data_dir: Option<PathBuf>) -> Result<NodeConfig> {
        if self.mine && self.reward_address.is_none() {
            return Err(NodeError::malformed("--mine needs --reward-address"));
        }
        Ok(NodeConfig {
            listen_addr: self.listen,
            seed_peer: self.seed,
            data_dir,
            mining: self.mine,
            reward_address: self.reward_address,
            max_peers: self.max_peers,
            sync_threshold: self.sync_threshold,
            sync_timeout: Duration::from_secs(self.sync_timeout),
            peer_exchange_interval: Duration::from_secs(self.peer_exchange),
            params,
            ..NodeConfig::default()
        })
    }
}

/// CLI handler
pub struct CliHandler {
    params: ChainParams,
    data_dir: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(cli: &Cli) -> Result<Self> {
        let params = match &cli.params {
            Some(path) => ChainParams::from_json_file(path)?,
            None if cli.regtest => ChainParams::regtest(),
            None => ChainParams::default(),
        };
        Ok(Self {
            params,
            data_dir: cli.data_dir.clone(),
        })
    }

    pub async fn handle(&self, cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Run(args) => self.run(args).await,
            Commands::Info => self.info(),
            Commands::Block(cmd) => self.handle_block(cmd),
            Commands::Wallet(cmd) => self.handle_wallet(cmd).await,
        }
    }

    fn open_store(&self) -> Result<Option<Box<dyn ChainStore>>> {
        match &self.data_dir {
            Some(dir) => Ok(Some(Box::new(SledStore::open(dir)?))),
            None => Ok(None),
        }
    }

    fn open_chain(&self) -> Result<ChainManager> {
        if self.data_dir.is_none() {
            return Err(NodeError::malformed("--data-dir is required"));
        }
        ChainManager::new(self.params.clone(), self.open_store()?)
    }

    async fn run(&self, args: RunArgs) -> Result<()> {
        let config = args.into_config(self.params.clone(), self.data_dir.clone())?;
        let chain = Arc::new(ChainManager::new(config.params.clone(), self.open_store()?)?);
        log::info!("Chain loaded at height {}, tip {}", chain.height(), chain.tip());

        let node = Node::start(config.clone(), Arc::clone(&chain)).await?;

        let miner = match (config.mining, config.reward_address) {
            (true, Some(address)) => {
                let (sender, mined) = mpsc::channel(16);
                node.relay_mined(mined);
                log::info!("Mining to {}", address);
                Some(chain.spawn_miner(address.script_pubkey(), sender))
            }
            _ => None,
        };

        let mut status = interval(Duration::from_secs(30));
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        log::error!("Failed to listen for ctrl-c: {}", e);
                    }
                    break;
                }
                _ = status.tick() => {
                    log::info!(
                        "Height {} | peers {} | mempool {} | orphans {} | {}",
                        chain.height(),
                        node.peer_count().await,
                        chain.mempool_size(),
                        chain.orphan_count(),
                        chain.status()
                    );
                }
            }
        }

        log::info!("Shutting down");
        if let Some(handle) = miner {
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
        }
        node.shutdown();
        Ok(())
    }

    fn info(&self) -> Result<()> {
        let chain = self.open_chain()?;

        println!("Blockchain Info:");
        println!("  Height: {}", chain.height());
        println!("  Best block: {}", chain.tip());
        println!("  Genesis: {}", chain.genesis_hash());
        println!("  Chain work: {}", chain.chain_work());
        println!("  Next bits: {:#010x}", chain.next_bits());
        println!("  UTXO count: {}", chain.utxo_count());

        Ok(())
    }

    fn handle_block(&self, cmd: BlockCommands) -> Result<()> {
        let chain = self.open_chain()?;

        match cmd {
            BlockCommands::Get { id } => {
                let block = match id.parse::<u64>() {
                    Ok(height) => chain.get_block(height),
                    Err(_) => chain.get_block_by_hash(&Hash256::from_hex(&id)?),
                };
                match block {
                    Some(block) => print_block(&block),
                    None => println!("Block not found: {}", id),
                }
            }
            BlockCommands::Height => {
                println!("Blockchain height: {}", chain.height());
            }
            BlockCommands::BestBlock => {
                println!("Best block: {}", chain.tip());
            }
        }

        Ok(())
    }

    async fn handle_wallet(&self, cmd: WalletCommands) -> Result<()> {
        match cmd {
            WalletCommands::NewKey => {
                let key = KeyPair::generate();
                println!("Secret: {}", key.secret_hex());
                println!("Address: {}", key.address);
            }
            WalletCommands::Address { secret } => {
                println!("{}", KeyPair::from_secret_hex(&secret)?.address);
            }
            WalletCommands::Balance { address, peer } => {
                let (chain, _) = self.fetch_chain(peer).await?;
                let balance = chain.get_balance(&address);
                println!("Balance for {} at height {}:", address, chain.height());
                println!("  {} units ({} coins)", balance, balance as f64 / COIN as f64);
            }
            WalletCommands::Send {
                secret,
                to,
                amount,
                fee,
                peer,
            } => {
                let key = KeyPair::from_secret_hex(&secret)?;
                let (chain, mut connection) = self.fetch_chain(peer).await?;
                let tx = TransactionBuilder::new(&key, chain.spendable_utxos(&key.address)).build(&to, amount, fee)?;
                let txid = tx.txid();

                // validate locally before handing it over
                chain.submit_transaction(tx.clone())?;
                connection.send_message(&Message::NewTransaction(tx.clone())).await?;

                if let Some(reason) = await_reject(&mut connection, txid).await {
                    return Err(NodeError::network(format!("node rejected {}: {}", txid, reason)));
                }

                println!("Transaction sent:");
                println!("  TXID: {}", txid);
                println!("  Inputs: {}", tx.inputs.len());
                println!("  Outputs: {}", tx.outputs.len());
                println!("  Total output: {} units", tx.total_output_value().unwrap_or(0));
            }
        }

        Ok(())
    }

    /// Download the peer's active chain into an in-memory chain manager
    async fn fetch_chain(&self, addr: SocketAddr) -> Result<(ChainManager, Peer)> {
        let wait = NodeConfig::default().sync_timeout;
        let chain = ChainManager::new(self.params.clone(), None)?;

        let mut peer = Peer::connect(addr, wait).await?;
        let unlisted = SocketAddr::from(([0, 0, 0, 0], 0));
        peer.handshake(&VersionMessage::new(rand::random(), 0, unlisted), wait)
            .await?;
        log::info!("Connected to {} at height {}", addr, peer.info.best_height);

        loop {
            peer.send_message(&Message::GetBlocks {
                from_height: chain.height() + 1,
            })
            .await?;
            let blocks = timeout(wait, receive_blocks(&mut peer))
                .await
                .map_err(|_| NodeError::network(format!("{} did not answer block request", addr)))??;

            let count = blocks.len();
            for block in blocks {
                chain.process_block(block)?;
            }
            if count < MAX_BLOCKS_PER_MESSAGE {
                break;
            }
        }

        Ok((chain, peer))
    }
}

async fn receive_blocks(peer: &mut Peer) -> Result<Vec<Block>> {
    loop {
        match peer.receive_message().await? {
            Message::Blocks(blocks) => return Ok(blocks),
            Message::Ping(nonce) => peer.send_message(&Message::Pong(nonce)).await?,
            Message::GetPeers => peer.send_message(&Message::Peers(Vec::new())).await?,
            _ => {}
        }
    }
}

// A reject arrives quickly if at all
async fn await_reject(peer: &mut Peer, txid: Hash256) -> Option<String> {
    let wait = Duration::from_secs(2);
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, peer.receive_message()).await {
            Ok(Ok(Message::Reject(reject))) if reject.id == txid => return Some(reject.reason),
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}

fn print_block(block: &Block) {
    println!("Block:");
    println!("  Hash: {}", block.hash());
    println!("  Previous: {}", block.header.prev_block_hash);
    println!("  Merkle root: {}", block.header.merkle_root);
    println!("  Timestamp: {}", block.header.timestamp);
    println!("  Bits: {:#010x}", block.header.bits);
    println!("  Nonce: {}", block.header.nonce);
    println!("  Transactions: {}", block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        println!("    [{}] {}", i, tx.txid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_into_config() {
        let cli = Cli::parse_from([
            "ledger-node",
            "--regtest",
            "run",
            "--listen",
            "127.0.0.1:9000",
            "--seed",
            "127.0.0.1:9001",
            "--sync-timeout",
            "3",
        ]);
        let handler = CliHandler::new(&cli).unwrap();
        assert_eq!(handler.params, ChainParams::regtest());

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.into_config(handler.params.clone(), None).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.seed_peer, Some("127.0.0.1:9001".parse().unwrap()));
        assert_eq!(config.sync_timeout, Duration::from_secs(3));
        assert!(!config.mining);
    }

    #[test]
    fn test_mining_requires_reward_address() {
        let cli = Cli::parse_from(["ledger-node", "run", "--mine"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.into_config(ChainParams::default(), None).is_err());
    }

    #[test]
    fn test_reward_address_parsed() {
        let address = Address::from_pubkey_hash(&[3; 20]);
        let cli = Cli::parse_from([
            "ledger-node".to_string(),
            "run".to_string(),
            "--mine".to_string(),
            "--reward-address".to_string(),
            address.to_string(),
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.into_config(ChainParams::default(), None).unwrap();
        assert_eq!(config.reward_address, Some(address));
    }

    #[tokio::test]
    async fn test_wallet_send_through_node() {
        let alice = KeyPair::from_secret_bytes(&[1; 32]).unwrap();
        let bob = KeyPair::from_secret_bytes(&[2; 32]).unwrap();

        let chain = Arc::new(ChainManager::new(ChainParams::regtest(), None).unwrap());
        chain.request_mine(&alice.script_pubkey()).unwrap();
        let config = NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            params: ChainParams::regtest(),
            ..NodeConfig::default()
        };
        let node = Node::start(config, Arc::clone(&chain)).await.unwrap();

        let handler = CliHandler {
            params: ChainParams::regtest(),
            data_dir: None,
        };
        let (remote, _) = handler.fetch_chain(node.local_addr()).await.unwrap();
        assert_eq!(remote.tip(), chain.tip());

        handler
            .handle_wallet(WalletCommands::Send {
                secret: alice.secret_hex(),
                to: bob.address,
                amount: 10_000,
                fee: 500,
                peer: node.local_addr(),
            })
            .await
            .unwrap();
        assert_eq!(chain.mempool_size(), 1);

        node.shutdown();
    }
}
