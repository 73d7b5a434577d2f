// Light client: talks to one node over the peer protocol
//
// The client downloads the canonical chain into an in-memory ChainHandle,
// which re-validates every block, and reads balances and nonces from there.
// Transfers are announced to the node as ordinary `NewTransaction` messages.

use crate::chain::{Account, ChainHandle};
use crate::config::{ConsensusParams, MAX_BLOCKS_PER_RESPONSE, SOCKET_TIMEOUT};
use crate::core::{Address, Hash256, Transaction};
use crate::network::peer::{handshake, read_message, write_message};
use crate::network::{ChainQuery, Message, PeerInfo, VersionMessage};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct LightClient {
    stream: TcpStream,
    peer: PeerInfo,
    chain: ChainHandle,
}

impl LightClient {
    /// Connect and handshake. The client announces no listen port.
    pub async fn connect(addr: SocketAddr, params: ConsensusParams) -> Result<Self, String> {
        let chain = ChainHandle::in_memory(params).map_err(|e| e.to_string())?;

        let mut stream = timeout(SOCKET_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| format!("Connection to {} timed out", addr))?
            .map_err(|e| format!("Failed to connect to {}: {}", addr, e))?;

        let ours = VersionMessage::new(chain.genesis_hash(), 0, 0, rand::random());
        let peer = handshake(&mut stream, addr, &ours, false).await?;
        log::info!("Connected to {} ({}, height {})", addr, peer.user_agent, peer.best_height);

        Ok(Self { stream, peer, chain })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn chain(&self) -> &ChainHandle {
        &self.chain
    }

    /// Download canonical blocks until the node has nothing newer. Returns the synced height.
    pub async fn sync(&mut self) -> Result<u64, String> {
        loop {
            let from_height = self.chain.tip_height() + 1;
            let request = Message::ChainRequest(ChainQuery::Range {
                from_height,
                count: MAX_BLOCKS_PER_RESPONSE as u32,
            });
            write_message(&mut self.stream, &request).await?;

            let blocks = self.await_chain_response().await?;
            let received = blocks.len();
            for block in blocks {
                let hash = block.hash();
                let submission = self.chain.submit_block(block).map_err(|e| e.to_string())?;
                if !submission.is_accepted() {
                    return Err(format!("Node sent unusable block {}: {:?}", hash.short(), submission.result));
                }
            }

            log::debug!("Synced {} blocks from height {}", received, from_height);
            if received < MAX_BLOCKS_PER_RESPONSE {
                return Ok(self.chain.tip_height());
            }
        }
    }

    async fn await_chain_response(&mut self) -> Result<Vec<crate::core::Block>, String> {
        loop {
            let message = timeout(SOCKET_TIMEOUT, read_message(&mut self.stream))
                .await
                .map_err(|_| "Timed out waiting for blocks".to_string())??;
            match message {
                Message::ChainResponse(blocks) => return Ok(blocks),
                Message::Ping(nonce) => write_message(&mut self.stream, &Message::Pong(nonce)).await?,
                other => log::debug!("Ignoring {} while syncing", other.command()),
            }
        }
    }

    /// Confirmed state of an address as of the last sync
    pub fn account(&self, address: &Address) -> Account {
        self.chain.read(|state| state.builder.ledger().account(address))
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.chain.balance_of(address)
    }

    /// Confirmed transactions touching `address`, oldest first, with their block height
    pub fn transactions_of(&self, address: &Address) -> Vec<(u64, Transaction)> {
        self.chain.read(|state| {
            let builder = &state.builder;
            (1..=builder.tip_height())
                .filter_map(|height| builder.block_at_height(height))
                .flat_map(|block| {
                    let height = block.height();
                    block
                        .transactions
                        .iter()
                        .filter(|tx| tx.recipient == *address || tx.sender_address() == Some(*address))
                        .map(|tx| (height, tx.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        })
    }

    /// Announce a transaction to the node
    pub async fn send_transaction(&mut self, tx: Transaction) -> Result<Hash256, String> {
        let txid = tx.txid();
        write_message(&mut self.stream, &Message::NewTransaction(tx)).await?;
        log::info!("Sent transaction {}", txid.short());
        Ok(txid)
    }
}
