// Message handling: turns peer messages into chain updates and replies
//
// The handler never touches sockets. It returns the actions the node should
// perform, which keeps it testable without a network.

use crate::chain::{AcceptResult, BlockId, ChainHandle, Submission, TxRejection};
use crate::config::MAX_BLOCKS_PER_RESPONSE;
use crate::consensus::BlockError;
use crate::core::{Block, Hash256, Serializable};
use crate::network::message::MAX_PAYLOAD_SIZE;
use crate::network::{ChainQuery, Message, PeerInfo};
use crate::storage::PersistenceError;
use std::net::SocketAddr;
use std::time::Instant;

/// Misbehavior score for a structurally invalid block
pub const INVALID_BLOCK_PENALTY: u32 = 50;
/// Misbehavior score for an invalid transaction
pub const INVALID_TX_PENALTY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send to the peer the message came from
    Reply(Message),
    /// Send to every connected peer except the origin
    Broadcast(Message),
    Connect(SocketAddr),
    /// Add to the origin's misbehavior score
    Penalize(u32),
}

#[derive(Clone)]
pub struct Protocol {
    chain: ChainHandle,
}

impl Protocol {
    pub fn new(chain: ChainHandle) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &ChainHandle {
        &self.chain
    }

    /// Messages to send right after a handshake
    pub fn on_connect(&self, peer: &PeerInfo) -> Vec<Action> {
        let mut actions = Vec::new();
        let tip = self.chain.tip();
        if peer.best_height > tip.height {
            actions.push(Action::Reply(range_request(tip.height + 1)));
        }
        if tip.height > 0 {
            if let Some(block) = self.chain.get_block(BlockId::Hash(tip.hash)) {
                actions.push(Action::Reply(Message::NewBlock(block.as_ref().clone())));
            }
        }
        actions
    }

    pub fn handle(&self, peer: SocketAddr, message: Message) -> Result<Vec<Action>, PersistenceError> {
        log::debug!("{} < {}", peer, message.command());

        let actions = match message {
            Message::Ping(nonce) => vec![Action::Reply(Message::Pong(nonce))],
            Message::Pong(_) | Message::Verack => Vec::new(),
            Message::Version(_) => {
                log::debug!("Ignoring repeated version from {}", peer);
                Vec::new()
            }
            Message::NewBlock(block) => self.handle_block(peer, block)?,
            Message::NewTransaction(tx) => match self.chain.submit_transaction(tx.clone()) {
                Ok(_) => vec![Action::Broadcast(Message::NewTransaction(tx))],
                Err(TxRejection::Invalid(e)) => {
                    log::debug!("Invalid transaction from {}: {}", peer, e);
                    vec![Action::Penalize(INVALID_TX_PENALTY)]
                }
                Err(e) => {
                    log::debug!("Transaction from {} not admitted: {}", peer, e);
                    Vec::new()
                }
            },
            Message::ChainRequest(query) => vec![Action::Reply(Message::ChainResponse(self.answer(query)))],
            Message::ChainResponse(blocks) => self.handle_chain_response(peer, blocks)?,
            Message::PeerAnnounce(addrs) => addrs.into_iter().map(Action::Connect).collect(),
            Message::Unknown(command) => {
                log::debug!("Ignoring unknown command {:?} from {}", command, peer);
                Vec::new()
            }
        };
        Ok(actions)
    }

    fn handle_block(&self, peer: SocketAddr, block: Block) -> Result<Vec<Action>, PersistenceError> {
        let hash = block.hash();
        let submission = self.chain.submit_block(block)?;
        Ok(match &submission.result {
            AcceptResult::Accepted | AcceptResult::AcceptedFork => relay(&submission),
            AcceptResult::Orphan => submission
                .missing
                .map(|missing| vec![Action::Reply(ancestors_request(missing))])
                .unwrap_or_default(),
            AcceptResult::Rejected(BlockError::Validation(e)) => {
                log::info!("Invalid block {} from {}: {}", hash.short(), peer, e);
                vec![Action::Penalize(INVALID_BLOCK_PENALTY)]
            }
            AcceptResult::Rejected(e) => {
                log::debug!("Rejected block {} from {}: {}", hash.short(), peer, e);
                Vec::new()
            }
            AcceptResult::AlreadyKnown => Vec::new(),
        })
    }

    fn handle_chain_response(&self, peer: SocketAddr, blocks: Vec<Block>) -> Result<Vec<Action>, PersistenceError> {
        let full = blocks.len() >= MAX_BLOCKS_PER_RESPONSE;
        let last_height = blocks.last().map(Block::height);

        let mut actions = Vec::new();
        let mut missing: Option<Hash256> = None;
        for block in blocks {
            for action in self.handle_block(peer, block)? {
                match action {
                    // One backfill request per response is enough
                    Action::Reply(Message::ChainRequest(ChainQuery::Ancestors { hash, .. })) => missing = Some(hash),
                    other => actions.push(other),
                }
            }
        }

        if let Some(hash) = missing.filter(|h| !self.chain.contains_block(h)) {
            actions.push(Action::Reply(ancestors_request(hash)));
        } else if let Some(height) = last_height.filter(|_| full) {
            actions.push(Action::Reply(range_request(height + 1)));
        }
        Ok(actions)
    }

    /// Blocks for a chain request, oldest first, bounded in count and size
    fn answer(&self, query: ChainQuery) -> Vec<Block> {
        let blocks = self.chain.read(|state| match query {
            ChainQuery::Range { from_height, count } => state
                .builder
                .blocks_in_range(from_height, (count as usize).min(MAX_BLOCKS_PER_RESPONSE)),
            ChainQuery::Ancestors { hash, count } => state
                .builder
                .ancestors(&hash, (count as usize).min(MAX_BLOCKS_PER_RESPONSE)),
        });

        let mut size = 16;
        blocks
            .into_iter()
            .take_while(|block| {
                size += block.serialize().len();
                size <= MAX_PAYLOAD_SIZE
            })
            .map(|block| block.as_ref().clone())
            .collect()
    }

    /// Submit a locally mined block and relay it if it connected
    pub fn submit_local(&self, block: Block) -> Result<Vec<Action>, PersistenceError> {
        let hash = block.hash();
        let submission = self.chain.submit_block(block)?;
        if submission.is_accepted() {
            Ok(relay(&submission))
        } else {
            log::warn!("Own block {} not accepted: {:?}", hash.short(), submission.result);
            Ok(Vec::new())
        }
    }

    /// Expire orphans and re-request missing ancestors that are due
    pub fn maintenance(&self, now: Instant) -> Vec<Action> {
        self.chain
            .orphan_maintenance(now)
            .into_iter()
            .map(|missing| Action::Broadcast(ancestors_request(missing)))
            .collect()
    }
}

fn relay(submission: &Submission) -> Vec<Action> {
    submission
        .connected
        .iter()
        .map(|block| Action::Broadcast(Message::NewBlock(block.as_ref().clone())))
        .collect()
}

fn range_request(from_height: u64) -> Message {
    Message::ChainRequest(ChainQuery::Range {
        from_height,
        count: MAX_BLOCKS_PER_RESPONSE as u32,
    })
}

fn ancestors_request(hash: Hash256) -> Message {
    Message::ChainRequest(ChainQuery::Ancestors {
        hash,
        count: MAX_BLOCKS_PER_RESPONSE as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::consensus::{CancelToken, ProofOfWork, Target};
    use crate::core::{KeyPair, Transaction};
    use crate::mining::StrategyKind;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn node() -> Protocol {
        Protocol::new(ChainHandle::in_memory(ConsensusParams::regtest()).unwrap())
    }

    fn mine_on(chain: &ChainHandle, miner: &KeyPair) -> Block {
        let strategy = StrategyKind::Fifo.build();
        let mut block = chain.build_template(strategy.as_ref(), miner.address, 100);
        let target = Target::from_bits(block.header.bits).unwrap();
        let result = ProofOfWork::new(target).search(&block, 0..u64::MAX, &CancelToken::new());
        block.header.nonce = result.nonce().unwrap();
        block
    }

    #[test]
    fn test_ping_and_unknown() {
        let node = node();
        assert_eq!(
            node.handle(peer(), Message::Ping(4)).unwrap(),
            vec![Action::Reply(Message::Pong(4))]
        );
        assert!(node.handle(peer(), Message::Unknown("alert".into())).unwrap().is_empty());
    }

    #[test]
    fn test_new_block_is_relayed_once() {
        let source = node();
        let node = node();
        let block = mine_on(source.chain(), &KeyPair::generate());

        let actions = node.handle(peer(), Message::NewBlock(block.clone())).unwrap();
        assert_eq!(actions, vec![Action::Broadcast(Message::NewBlock(block.clone()))]);
        assert!(node.handle(peer(), Message::NewBlock(block)).unwrap().is_empty());
        assert_eq!(node.chain().tip_height(), 1);
    }

    #[test]
    fn test_orphan_triggers_backfill() {
        let source = node();
        let miner = KeyPair::generate();
        let b1 = mine_on(source.chain(), &miner);
        source.chain().submit_block(b1.clone()).unwrap();
        let b2 = mine_on(source.chain(), &miner);

        let node = node();
        let actions = node.handle(peer(), Message::NewBlock(b2)).unwrap();
        assert_eq!(actions, vec![Action::Reply(ancestors_request(b1.hash()))]);
    }

    #[test]
    fn test_invalid_block_penalized() {
        let node = node();
        let mut block = mine_on(node.chain(), &KeyPair::generate());
        block.header.merkle_root = Hash256::new([9u8; 32]);
        assert_eq!(
            node.handle(peer(), Message::NewBlock(block)).unwrap(),
            vec![Action::Penalize(INVALID_BLOCK_PENALTY)]
        );
    }

    #[test]
    fn test_chain_request_and_response_sync() {
        let source = node();
        let miner = KeyPair::generate();
        for _ in 0..3 {
            let block = mine_on(source.chain(), &miner);
            source.chain().submit_block(block).unwrap();
        }

        let request = ChainQuery::Range { from_height: 1, count: 10 };
        let reply = source.handle(peer(), Message::ChainRequest(request)).unwrap();
        let [Action::Reply(Message::ChainResponse(blocks))] = reply.as_slice() else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!(blocks.len(), 3);

        let node = node();
        let actions = node.handle(peer(), Message::ChainResponse(blocks.clone())).unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(node.chain().tip(), source.chain().tip());
    }

    #[test]
    fn test_transactions_admitted_and_relayed() {
        let node = node();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let block = mine_on(node.chain(), &alice);
        node.chain().submit_block(block).unwrap();

        let tx = Transaction::create(&alice, bob.address, 10, 1, 0);
        let actions = node.handle(peer(), Message::NewTransaction(tx.clone())).unwrap();
        assert_eq!(actions, vec![Action::Broadcast(Message::NewTransaction(tx.clone()))]);
        assert!(node.handle(peer(), Message::NewTransaction(tx.clone())).unwrap().is_empty());

        let mut forged = tx;
        forged.amount = 20;
        assert_eq!(
            node.handle(peer(), Message::NewTransaction(forged)).unwrap(),
            vec![Action::Penalize(INVALID_TX_PENALTY)]
        );
    }

    #[test]
    fn test_peer_announce_connects() {
        let addr: SocketAddr = "10.1.1.1:8333".parse().unwrap();
        assert_eq!(
            node().handle(peer(), Message::PeerAnnounce(vec![addr])).unwrap(),
            vec![Action::Connect(addr)]
        );
    }
}
