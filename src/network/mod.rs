// P2P networking

pub mod message;
pub mod peer;
mod protocol;
mod node;

pub use message::{ChainQuery, Message, VersionMessage};
pub use peer::PeerInfo;
pub use protocol::{Action, INVALID_BLOCK_PENALTY, INVALID_TX_PENALTY, Protocol};
pub use node::{Node, NodeStatus};
