// Network node - listener, peer sessions and action dispatch
//
// Every peer gets a reader loop and a writer task fed by an unbounded
// channel. Messages go through `Protocol`; the resulting actions are routed
// here. A persistence failure stops the whole node.

use crate::chain::ChainHandle;
use crate::config::{BAN_THRESHOLD, MAX_PEERS, MAX_RECONNECT_BACKOFF, NodeConfig, SOCKET_TIMEOUT};
use crate::core::Block;
use crate::mining::{Miner, MinerConfig, MinerHandle};
use crate::network::peer::{handshake, read_message, write_message};
use crate::network::{Action, Message, PeerInfo, Protocol, VersionMessage};
use crate::storage::PersistenceError;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::time::timeout;

/// Interval of orphan maintenance and keepalive pings
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Stopped,
    Failed(String),
}

/// A connected peer
struct PeerSlot {
    info: PeerInfo,
    sender: mpsc::UnboundedSender<Message>,
    ban_score: u32,
}

struct Inner {
    config: NodeConfig,
    protocol: Protocol,
    peers: RwLock<HashMap<SocketAddr, PeerSlot>>,
    /// Outbound dials in flight
    dialing: RwLock<HashSet<SocketAddr>>,
    banned: RwLock<HashSet<IpAddr>>,
    /// Handshake nonce for self-connection detection
    nonce: u64,
    listen_port: AtomicU16,
    status: watch::Sender<NodeStatus>,
    /// Addresses to dial, drained by the serve loop
    dial_tx: mpsc::UnboundedSender<SocketAddr>,
    dial_rx: Mutex<Option<mpsc::UnboundedReceiver<SocketAddr>>>,
}

/// Network node
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    pub fn new(config: NodeConfig, chain: ChainHandle) -> Self {
        let (status, _) = watch::channel(NodeStatus::Running);
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let listen_port = config.listen_addr.port();
        Self {
            inner: Arc::new(Inner {
                config,
                protocol: Protocol::new(chain),
                peers: RwLock::new(HashMap::new()),
                dialing: RwLock::new(HashSet::new()),
                banned: RwLock::new(HashSet::new()),
                nonce: rand::random(),
                listen_port: AtomicU16::new(listen_port),
                status,
                dial_tx,
                dial_rx: Mutex::new(Some(dial_rx)),
            }),
        }
    }

    pub fn chain(&self) -> &ChainHandle {
        self.inner.protocol.chain()
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.status.borrow().clone()
    }

    /// Bind the configured address and serve until stopped
    pub async fn run(&self) -> Result<(), String> {
        let listener = TcpListener::bind(self.inner.config.listen_addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", self.inner.config.listen_addr, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// Returns `Ok` after `shutdown` and `Err` when a block could not be persisted.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), String> {
        let mut dial_rx = self
            .inner
            .dial_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| "Node is already serving".to_string())?;
        let local = listener
            .local_addr()
            .map_err(|e| format!("Failed to read listen address: {}", e))?;
        self.inner.listen_port.store(local.port(), Ordering::SeqCst);
        log::info!("Node listening on {}", local);

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let _miner = self.start_miner(found_tx)?;

        for addr in self.inner.config.bootstrap_peers.clone() {
            let node = self.clone();
            tokio::spawn(async move { node.keep_connected(addr).await });
        }

        let mut status = self.inner.status.subscribe();
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr).await,
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                },
                Some(block) = found_rx.recv() => {
                    if let Err(e) = self.announce_block(block).await {
                        self.fail(e);
                    }
                }
                Some(addr) = dial_rx.recv() => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.connect_to_peer(addr).await {
                            log::debug!("Announced peer {}: {}", addr, e);
                        }
                    });
                }
                _ = ticker.tick() => self.maintenance().await,
                _ = status.changed() => {}
            }

            match self.status() {
                NodeStatus::Running => {}
                NodeStatus::Stopped => break,
                NodeStatus::Failed(e) => {
                    self.disconnect_all().await;
                    return Err(e);
                }
            }
        }

        self.disconnect_all().await;
        log::info!("Node stopped");
        Ok(())
    }

    /// Stop serving and drop every peer
    pub fn shutdown(&self) {
        self.inner.status.send_if_modified(|status| {
            if *status == NodeStatus::Running {
                *status = NodeStatus::Stopped;
                true
            } else {
                false
            }
        });
    }

    fn fail(&self, error: PersistenceError) {
        log::error!("Stopping node: {}", error);
        self.inner.status.send_replace(NodeStatus::Failed(error.to_string()));
    }

    fn start_miner(&self, found_tx: mpsc::UnboundedSender<Block>) -> Result<Option<MinerHandle>, String> {
        let Some(reward_address) = self.inner.config.reward_address else {
            return Ok(None);
        };
        let config = MinerConfig {
            threads: self.inner.config.mining_threads,
            ..MinerConfig::default()
        };
        let miner = Miner::new(
            self.chain().clone(),
            self.inner.config.strategy.build(),
            reward_address,
            config,
            found_tx,
        );
        miner.spawn().map(Some)
    }

    /// Submit a block produced by this process and relay it
    pub async fn announce_block(&self, block: Block) -> Result<(), PersistenceError> {
        let actions = self.blocking(move |protocol| protocol.submit_local(block)).await?;
        self.dispatch(None, actions).await;
        Ok(())
    }

    /// Run chain work on the blocking pool; block submission waits for disk writes
    async fn blocking<F>(&self, work: F) -> Result<Vec<Action>, PersistenceError>
    where
        F: FnOnce(&Protocol) -> Result<Vec<Action>, PersistenceError> + Send + 'static,
    {
        let protocol = self.inner.protocol.clone();
        tokio::task::spawn_blocking(move || work(&protocol))
            .await
            .map_err(|e| PersistenceError(format!("Chain task failed: {}", e)))?
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    pub async fn get_peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.read().await.values().map(|slot| slot.info.clone()).collect()
    }

    async fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if self.inner.banned.read().await.contains(&addr.ip()) {
            log::debug!("Refusing banned peer {}", addr);
            return;
        }
        if self.peer_count().await >= MAX_PEERS {
            log::debug!("Refusing {}: peer limit reached", addr);
            return;
        }

        log::info!("New connection from {}", addr);
        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.session(stream, addr, true).await {
                log::warn!("Peer {} error: {}", addr, e);
            }
        });
    }

    /// Dial a peer once, unless it is already connected or being dialed
    pub async fn connect_to_peer(&self, addr: SocketAddr) -> Result<(), String> {
        if self.inner.peers.read().await.contains_key(&addr) || self.is_own_address(addr) {
            return Ok(());
        }
        if self.peer_count().await >= MAX_PEERS {
            return Err("Peer limit reached".to_string());
        }
        if !self.inner.dialing.write().await.insert(addr) {
            return Ok(());
        }

        let result = self.dial(addr).await;
        self.inner.dialing.write().await.remove(&addr);
        result
    }

    async fn dial(&self, addr: SocketAddr) -> Result<(), String> {
        let stream = timeout(SOCKET_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| format!("Connection to {} timed out", addr))?
            .map_err(|e| format!("Failed to connect to {}: {}", addr, e))?;

        log::info!("Connected to peer {}", addr);
        self.session(stream, addr, false).await
    }

    /// Redial a bootstrap peer with exponential backoff for as long as the node runs
    async fn keep_connected(&self, addr: SocketAddr) {
        let mut backoff = INITIAL_BACKOFF;
        while self.status() == NodeStatus::Running {
            let started = Instant::now();
            match self.connect_to_peer(addr).await {
                Ok(()) => log::info!("Bootstrap peer {} disconnected", addr),
                Err(e) => log::warn!("Bootstrap peer {}: {}", addr, e),
            }
            if started.elapsed() > MAX_RECONNECT_BACKOFF {
                backoff = INITIAL_BACKOFF;
            }

            log::debug!("Redialing {} in {:?}", addr, backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
        }
    }

    fn is_own_address(&self, addr: SocketAddr) -> bool {
        let port = self.inner.listen_port.load(Ordering::SeqCst);
        addr.port() == port && (addr.ip().is_loopback() || addr.ip() == self.inner.config.listen_addr.ip())
    }

    fn version_message(&self) -> VersionMessage {
        let chain = self.chain();
        VersionMessage::new(
            chain.genesis_hash(),
            chain.tip_height(),
            self.inner.listen_port.load(Ordering::SeqCst),
            self.inner.nonce,
        )
    }

    /// Handshake, register and run the read loop until the peer goes away
    async fn session(&self, mut stream: TcpStream, addr: SocketAddr, inbound: bool) -> Result<(), String> {
        let info = handshake(&mut stream, addr, &self.version_message(), inbound).await?;
        log::info!(
            "Handshake completed with {} ({}, height {})",
            addr,
            info.user_agent,
            info.best_height
        );

        let (mut reader, mut writer) = stream.into_split();
        let (sender, mut outbox) = mpsc::unbounded_channel::<Message>();

        {
            let mut peers = self.inner.peers.write().await;
            if peers.len() >= MAX_PEERS || peers.contains_key(&addr) {
                return Err("Peer limit reached or already connected".to_string());
            }
            peers.insert(
                addr,
                PeerSlot {
                    info: info.clone(),
                    sender: sender.clone(),
                    ban_score: 0,
                },
            );
        }

        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    log::debug!("Write to {} failed: {}", addr, e);
                    break;
                }
            }
        });

        let known = self.known_addresses(addr).await;
        if !known.is_empty() {
            let _ = sender.send(Message::PeerAnnounce(known));
        }
        let greeting = self.inner.protocol.on_connect(&info);
        self.dispatch(Some(addr), greeting).await;
        drop(sender);

        let mut status = self.inner.status.subscribe();
        loop {
            let message = tokio::select! {
                message = read_message(&mut reader) => message,
                _ = status.changed() => break,
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("Peer {} closed: {}", addr, e);
                    break;
                }
            };

            let actions = match self.blocking(move |protocol| protocol.handle(addr, message)).await {
                Ok(actions) => actions,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            };
            if !self.dispatch(Some(addr), actions).await {
                break;
            }
        }

        self.inner.peers.write().await.remove(&addr);
        log::info!("Peer {} disconnected", addr);
        Ok(())
    }

    /// Listen addresses of every peer except `exclude`
    async fn known_addresses(&self, exclude: SocketAddr) -> Vec<SocketAddr> {
        self.inner
            .peers
            .read()
            .await
            .values()
            .filter(|slot| slot.info.addr != exclude)
            .filter_map(|slot| slot.info.listen_addr())
            .collect()
    }

    /// Route protocol actions. Returns false when the origin must be dropped.
    async fn dispatch(&self, origin: Option<SocketAddr>, actions: Vec<Action>) -> bool {
        let mut keep = true;
        for action in actions {
            match action {
                Action::Reply(message) => {
                    if let Some(addr) = origin {
                        self.send_to(addr, message).await;
                    }
                }
                Action::Broadcast(message) => self.broadcast(origin, message).await,
                Action::Connect(addr) => {
                    let _ = self.inner.dial_tx.send(addr);
                }
                Action::Penalize(score) => {
                    if let Some(addr) = origin {
                        keep &= !self.penalize(addr, score).await;
                    }
                }
            }
        }
        keep
    }

    async fn send_to(&self, addr: SocketAddr, message: Message) {
        if let Some(slot) = self.inner.peers.read().await.get(&addr) {
            let _ = slot.sender.send(message);
        }
    }

    async fn broadcast(&self, origin: Option<SocketAddr>, message: Message) {
        let peers = self.inner.peers.read().await;
        log::debug!("Broadcasting {} to {} peers", message.command(), peers.len());
        for (addr, slot) in peers.iter() {
            if Some(*addr) != origin {
                let _ = slot.sender.send(message.clone());
            }
        }
    }

    /// Raise a peer's misbehavior score; true if it is now banned
    async fn penalize(&self, addr: SocketAddr, score: u32) -> bool {
        let mut peers = self.inner.peers.write().await;
        let Some(slot) = peers.get_mut(&addr) else {
            return false;
        };
        slot.ban_score = slot.ban_score.saturating_add(score);
        log::debug!("Peer {} misbehavior score {}", addr, slot.ban_score);
        if slot.ban_score < BAN_THRESHOLD {
            return false;
        }

        peers.remove(&addr);
        drop(peers);
        log::warn!("Banning peer {}", addr);
        self.inner.banned.write().await.insert(addr.ip());
        true
    }

    async fn maintenance(&self) {
        let actions = self.inner.protocol.maintenance(Instant::now());
        self.dispatch(None, actions).await;
        self.broadcast(None, Message::Ping(rand::random())).await;
    }

    async fn disconnect_all(&self) {
        self.inner.peers.write().await.clear();
    }
}
