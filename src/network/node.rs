// Network node - manages peer connections, relay and chain sync

use crate::chain::ChainManager;
use crate::config::NodeConfig;
use crate::core::{Block, Transaction};
use crate::error::{NodeError, Result};
use crate::mempool::SubmitStatus;
use crate::network::gossip::{Gossip, GossipAction};
use crate::network::peer::{read_message, run_writer};
use crate::network::{Message, Peer, PeerHandle, PeerInfo, VersionMessage, MAX_BLOCKS_PER_MESSAGE, MAX_PEER_ADDRESSES};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Messages queued per peer before further sends are dropped
const OUTBOX_CAPACITY: usize = 256;

// Transient clients announce an unspecified address and never accept connections
fn is_dialable(addr: &SocketAddr) -> bool {
    !addr.ip().is_unspecified() && addr.port() != 0
}

/// Network node
pub struct Node {
    config: NodeConfig,
    /// Address actually bound, which differs from the configured one for port 0
    local_addr: SocketAddr,
    nonce: u64,
    chain: Arc<ChainManager>,
    gossip: Gossip,
    /// Connected peers by socket address
    peers: RwLock<HashMap<SocketAddr, PeerHandle>>,
    /// Listen addresses learned from handshakes and peer exchange
    known_addrs: RwLock<HashSet<SocketAddr>>,
    /// Outstanding `GetBlocks` requests; dropping the sender cancels the wait
    pending_blocks: parking_lot::Mutex<HashMap<SocketAddr, oneshot::Sender<Vec<Block>>>>,
    syncing: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the listener, start background tasks and dial the seed peer
    pub async fn start(config: NodeConfig, chain: Arc<ChainManager>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| NodeError::network(format!("failed to bind {}: {}", config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NodeError::network(format!("failed to read local address: {}", e)))?;

        let node = Arc::new(Self {
            gossip: Gossip::new(Arc::clone(&chain), config.seen_ttl),
            config,
            local_addr,
            nonce: rand::random(),
            chain,
            peers: RwLock::new(HashMap::new()),
            known_addrs: RwLock::new(HashSet::new()),
            pending_blocks: parking_lot::Mutex::new(HashMap::new()),
            syncing: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        log::info!("Node listening on {}", local_addr);

        let accept = tokio::spawn(Arc::clone(&node).accept_loop(listener));
        let maintenance = tokio::spawn(Arc::clone(&node).maintenance_loop());
        node.tasks.lock().extend([accept, maintenance]);

        if let Some(seed) = node.config.seed_peer {
            let dialer = Arc::clone(&node);
            tokio::spawn(async move {
                if let Err(e) = dialer.connect_to_peer(seed).await {
                    log::warn!("Failed to connect to seed {}: {}", seed, e);
                }
            });
        }

        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    /// Stop accepting connections and background maintenance
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            if self.peer_count().await >= self.config.max_peers {
                log::debug!("Refusing {}: peer limit reached", addr);
                continue;
            }

            let node = Arc::clone(&self);
            tokio::spawn(async move {
                let peer = Peer::new(stream, addr, true);
                match node.establish(peer).await {
                    Ok((info, reader)) => node.read_loop(info, reader).await,
                    Err(e) => log::debug!("Handshake with {} failed: {}", addr, e),
                }
            });
        }
    }

    /// Connect to a peer and start serving it
    pub async fn connect_to_peer(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        if addr == self.local_addr || self.is_connected_to(addr).await {
            return Ok(());
        }

        let peer = Peer::connect(addr, self.config.sync_timeout).await?;
        let (info, reader) = self.establish(peer).await?;

        let node = Arc::clone(self);
        tokio::spawn(async move { node.read_loop(info, reader).await });
        Ok(())
    }

    async fn is_connected_to(&self, listen_addr: SocketAddr) -> bool {
        self.peers
            .read()
            .await
            .values()
            .any(|peer| peer.info.listen_addr == listen_addr || peer.info.addr == listen_addr)
    }

    /// Handshake, register the peer and start its writer task
    async fn establish(self: &Arc<Self>, mut peer: Peer) -> Result<(PeerInfo, OwnedReadHalf)> {
        let ours = VersionMessage::new(self.nonce, self.chain.height(), self.local_addr);
        peer.handshake(&ours, self.config.sync_timeout).await?;

        let (info, reader, writer) = peer.into_split();
        let (sender, outbox) = mpsc::channel(OUTBOX_CAPACITY);

        {
            let mut peers = self.peers.write().await;
            if peers.len() >= self.config.max_peers {
                return Err(NodeError::network("peer limit reached"));
            }
            if peers.values().any(|p| p.info.nonce == info.nonce) {
                return Err(NodeError::network(format!("already connected to {}", info.listen_addr)));
            }
            peers.insert(info.addr, PeerHandle::new(info.clone(), sender));
        }
        if is_dialable(&info.listen_addr) {
            self.known_addrs.write().await.insert(info.listen_addr);
        }
        tokio::spawn(run_writer(writer, outbox, info.addr));

        log::info!(
            "Connected to peer {} (listening on {}, height {}, {})",
            info.addr,
            info.listen_addr,
            info.best_height,
            info.user_agent
        );

        self.send_to(info.addr, Message::GetPeers).await;
        if info.best_height > self.chain.height() + self.config.sync_threshold {
            self.spawn_sync();
        }

        Ok((info, reader))
    }

    async fn read_loop(self: Arc<Self>, info: PeerInfo, mut reader: OwnedReadHalf) {
        let addr = info.addr;
        loop {
            match read_message(&mut reader).await {
                Ok(message) => {
                    log::debug!("Received {} from {}", message.message_type().command(), addr);
                    self.dispatch(addr, message).await;
                }
                Err(NodeError::Malformed(reason)) => {
                    log::warn!("Dropping peer {}: malformed message: {}", addr, reason);
                    break;
                }
                Err(e) => {
                    log::debug!("Connection to {} closed: {}", addr, e);
                    break;
                }
            }
        }

        self.peers.write().await.remove(&addr);
        self.pending_blocks.lock().remove(&addr);
        log::info!("Peer {} disconnected", addr);
    }

    async fn dispatch(self: &Arc<Self>, from: SocketAddr, message: Message) {
        self.touch(from).await;

        match message {
            Message::Ping(nonce) => {
                self.send_to(from, Message::Pong(nonce)).await;
            }
            Message::Pong(_) | Message::Version(_) | Message::Verack => {}
            Message::GetPeers => {
                let addrs: Vec<SocketAddr> = {
                    let peers = self.peers.read().await;
                    let requester = peers.get(&from).map(|p| p.info.listen_addr);
                    self.known_addrs
                        .read()
                        .await
                        .iter()
                        .filter(|addr| Some(**addr) != requester)
                        .take(MAX_PEER_ADDRESSES)
                        .copied()
                        .collect()
                };
                self.send_to(from, Message::Peers(addrs)).await;
            }
            Message::Peers(addrs) => self.learn_addresses(addrs).await,
            Message::Reject(reject) => {
                log::debug!("Peer {} rejected {}: {:?} {}", from, reject.id, reject.code, reject.reason);
            }
            Message::Blocks(blocks) => {
                let waiter = self.pending_blocks.lock().remove(&from);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(blocks);
                    }
                    None => {
                        let actions = self.handle_gossip(Message::Blocks(blocks)).await;
                        self.apply_actions(from, actions).await;
                    }
                }
            }
            other => {
                let actions = self.handle_gossip(other).await;
                self.apply_actions(from, actions).await;
            }
        }
    }

    /// Validation and persistence block, so they run on the blocking pool
    async fn handle_gossip(self: &Arc<Self>, message: Message) -> Vec<GossipAction> {
        let node = Arc::clone(self);
        match tokio::task::spawn_blocking(move || node.gossip.handle(message)).await {
            Ok(actions) => actions,
            Err(e) => {
                log::error!("Message handler failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn apply_actions(self: &Arc<Self>, from: SocketAddr, actions: Vec<GossipAction>) {
        for action in actions {
            match action {
                GossipAction::Reply(message) => {
                    self.send_to(from, message).await;
                }
                GossipAction::Relay(message) => {
                    self.broadcast(message, Some(from)).await;
                }
                GossipAction::Sync => self.spawn_sync(),
                GossipAction::PeerHeight(height) => {
                    if let Some(peer) = self.peers.write().await.get_mut(&from) {
                        peer.info.best_height = peer.info.best_height.max(height);
                    }
                }
            }
        }
    }

    async fn touch(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.write().await.get_mut(&addr) {
            peer.info.last_seen = crate::chain::unix_now();
        }
    }

    async fn learn_addresses(self: &Arc<Self>, addrs: Vec<SocketAddr>) {
        let fresh: Vec<SocketAddr> = {
            let mut known = self.known_addrs.write().await;
            addrs
                .into_iter()
                .filter(|addr| *addr != self.local_addr && is_dialable(addr))
                .filter(|addr| known.insert(*addr))
                .collect()
        };

        for addr in fresh {
            if self.peer_count().await >= self.config.max_peers {
                break;
            }
            self.spawn_connect(addr);
        }
    }

    // Plain fn so the connect future type does not depend on the read loop's
    fn spawn_connect(self: &Arc<Self>, addr: SocketAddr) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = node.connect_to_peer(addr).await {
                log::debug!("Could not reach advertised peer {}: {}", addr, e);
            }
        });
    }

    async fn send_to(&self, addr: SocketAddr, message: Message) -> bool {
        match self.peers.read().await.get(&addr) {
            Some(peer) => peer.send(message),
            None => false,
        }
    }

    /// Queue `message` for every peer except `except`. Returns the number queued.
    pub async fn broadcast(&self, message: Message, except: Option<SocketAddr>) -> usize {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|peer| Some(peer.info.addr) != except)
            .filter(|peer| peer.send(message.clone()))
            .count()
    }

    pub async fn broadcast_block(&self, block: &Block) -> usize {
        self.gossip.mark_seen(block.hash());
        let sent = self.broadcast(Message::NewBlock(block.clone()), None).await;
        log::debug!("Broadcast block {} to {} peer(s)", block.hash(), sent);
        sent
    }

    pub async fn broadcast_transaction(&self, tx: &Transaction) -> usize {
        self.gossip.mark_seen(tx.txid());
        self.broadcast(Message::NewTransaction(tx.clone()), None).await
    }

    /// Local entry point for new transactions: validate, pool, then relay
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<SubmitStatus> {
        let status = self.chain.submit_transaction(tx.clone())?;
        if status == SubmitStatus::Accepted {
            self.broadcast_transaction(&tx).await;
        }
        Ok(status)
    }

    /// Broadcast blocks produced by the background miner
    pub fn relay_mined(self: &Arc<Self>, mut mined: mpsc::Receiver<Arc<Block>>) {
        let node = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(block) = mined.recv().await {
                node.broadcast_block(&block).await;
            }
        });
        self.tasks.lock().push(task);
    }

    /// Get number of connected peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Get peer information
    pub async fn get_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().map(|p| p.info.clone()).collect()
    }

    fn spawn_sync(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.sync().await });
    }

    /// Catch up with the best peer ahead of us, falling back to the next on failure
    pub async fn sync(self: &Arc<Self>) {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return;
        }

        let local = self.chain.height();
        let mut candidates: Vec<PeerInfo> = self
            .get_peers()
            .await
            .into_iter()
            .filter(|peer| peer.best_height > local)
            .collect();
        candidates.sort_by(|a, b| b.best_height.cmp(&a.best_height));

        for peer in candidates {
            log::info!("Syncing from {} (height {} vs local {})", peer.addr, peer.best_height, local);
            match self.sync_from(peer.addr).await {
                Ok(()) => {
                    log::info!("Sync from {} finished at height {}", peer.addr, self.chain.height());
                    break;
                }
                Err(e) => log::warn!("Sync from {} failed: {}", peer.addr, e),
            }
        }

        self.syncing.store(false, Ordering::SeqCst);
    }

    async fn sync_from(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let mut from = self.chain.height() + 1;
        let mut rewind = 1u64;

        loop {
            let blocks = self.request_blocks(addr, from).await?;
            if blocks.is_empty() {
                return Ok(());
            }
            let count = blocks.len();
            let node = Arc::clone(self);
            let outcome = tokio::task::spawn_blocking(move || node.gossip.import_blocks(blocks))
                .await
                .map_err(|e| NodeError::network(format!("block import failed: {}", e)))?;

            if outcome.first_orphaned {
                // their chain forks below `from`; step back further each time
                if from <= 1 {
                    return Err(NodeError::network("peer chain shares no blocks with ours"));
                }
                from = from.saturating_sub(rewind).max(1);
                rewind = rewind.saturating_mul(2);
                continue;
            }
            if let Some(hash) = outcome.rejected {
                return Err(NodeError::network(format!("peer sent invalid block {}", hash)));
            }
            if count < MAX_BLOCKS_PER_MESSAGE {
                return Ok(());
            }
            from += count as u64;
        }
    }

    async fn request_blocks(&self, addr: SocketAddr, from_height: u64) -> Result<Vec<Block>> {
        let (sender, receiver) = oneshot::channel();
        self.pending_blocks.lock().insert(addr, sender);

        if !self.send_to(addr, Message::GetBlocks { from_height }).await {
            self.pending_blocks.lock().remove(&addr);
            return Err(NodeError::network(format!("peer {} unavailable", addr)));
        }

        match timeout(self.config.sync_timeout, receiver).await {
            Ok(Ok(blocks)) => Ok(blocks),
            Ok(Err(_)) => Err(NodeError::network("peer disconnected during sync")),
            Err(_) => {
                self.pending_blocks.lock().remove(&addr);
                Err(NodeError::network("block request timed out"))
            }
        }
    }

    /// Periodic peer exchange, dedup-cache pruning, mempool expiry and
    /// catch-up with peers that got ahead
    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.peer_exchange_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let asked = self.broadcast(Message::GetPeers, None).await;
            let pruned = self.gossip.prune_seen();
            let expired = self.chain.expire_mempool();
            log::debug!(
                "Maintenance: asked {} peer(s) for addresses, pruned {} seen id(s), expired {} transaction(s)",
                asked,
                pruned,
                expired
            );

            let local = self.chain.height();
            let ahead = self
                .get_peers()
                .await
                .iter()
                .any(|peer| peer.best_height > local + self.config.sync_threshold);
            if ahead {
                let node = Arc::clone(&self);
                tokio::spawn(async move { node.sync().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::wallet::{KeyPair, TransactionBuilder};
    use std::time::Duration;

    fn config(seed: Option<SocketAddr>) -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            seed_peer: seed,
            sync_timeout: Duration::from_secs(5),
            params: ChainParams::regtest(),
            ..NodeConfig::default()
        }
    }

    fn chain() -> Arc<ChainManager> {
        Arc::new(ChainManager::new(ChainParams::regtest(), None).unwrap())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_node_creation() {
        let node = Node::start(config(None), chain()).await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.peer_count().await, 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_new_node_syncs_from_seed() {
        let miner = KeyPair::from_secret_bytes(&[1; 32]).unwrap();
        let seed_chain = chain();
        for _ in 0..3 {
            seed_chain.request_mine(&miner.script_pubkey()).unwrap();
        }
        let seed = Node::start(config(None), Arc::clone(&seed_chain)).await.unwrap();

        let fresh = Node::start(config(Some(seed.local_addr())), chain()).await.unwrap();
        let fresh_chain = Arc::clone(fresh.chain());
        assert!(wait_for(|| fresh_chain.height() == 3).await);
        assert_eq!(fresh_chain.tip(), seed_chain.tip());

        seed.shutdown();
        fresh.shutdown();
    }

    #[tokio::test]
    async fn test_orphan_from_peer_triggers_sync_from_it() {
        let miner = KeyPair::from_secret_bytes(&[1; 32]).unwrap();
        let a = Node::start(config(None), chain()).await.unwrap();
        let b = Node::start(config(None), chain()).await.unwrap();
        a.connect_to_peer(b.local_addr()).await.unwrap();

        // both were at genesis during the handshake
        a.chain().request_mine(&miner.script_pubkey()).unwrap();
        let (second, _) = a.chain().request_mine(&miner.script_pubkey()).unwrap();
        assert_eq!(a.broadcast_block(&second).await, 1);

        let b_chain = Arc::clone(b.chain());
        assert!(wait_for(|| b_chain.height() == 2).await);
        assert_eq!(b_chain.tip(), second.hash());
        assert_eq!(b_chain.orphan_count(), 0);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_blocks_and_transactions_propagate() {
        let alice = KeyPair::from_secret_bytes(&[1; 32]).unwrap();
        let bob = KeyPair::from_secret_bytes(&[2; 32]).unwrap();

        let a = Node::start(config(None), chain()).await.unwrap();
        let b = Node::start(config(None), chain()).await.unwrap();
        a.connect_to_peer(b.local_addr()).await.unwrap();
        assert_eq!(a.peer_count().await, 1);

        let (block, _) = a.chain().request_mine(&alice.script_pubkey()).unwrap();
        assert_eq!(a.broadcast_block(&block).await, 1);
        let b_chain = Arc::clone(b.chain());
        assert!(wait_for(|| b_chain.tip() == block.hash()).await);

        let coins = a.chain().spendable_utxos(&alice.address);
        let tx = TransactionBuilder::new(&alice, coins).build(&bob.address, 1_000, 100).unwrap();
        assert_eq!(a.submit_transaction(tx.clone()).await.unwrap(), SubmitStatus::Accepted);
        let txid = tx.txid();
        assert!(wait_for(|| b_chain.mempool_contains(&txid)).await);

        a.shutdown();
        b.shutdown();
    }
}
