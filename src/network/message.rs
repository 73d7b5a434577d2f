// Network protocol messages
//
// Frame: magic (4) | command (12, NUL padded) | payload length (u32 LE) |
// checksum (first 4 bytes of hash256(payload)) | payload

use crate::config::{MAX_BLOCKS_PER_RESPONSE, NETWORK_MAGIC, PROTOCOL_VERSION};
use crate::core::serialize::{read_array, read_length, read_u32, read_u64, read_var_bytes, write_var_bytes, write_varint};
use crate::core::{Block, Hash256, Serializable, Transaction, hash256};
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;
pub const MAX_ANNOUNCED_PEERS: usize = 1000;
const MAX_USER_AGENT: usize = 256;
const COMMAND_SIZE: usize = 12;

/// Handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub genesis_hash: Hash256,
    pub best_height: u64,
    /// Port the sender accepts connections on; 0 if it does not listen
    pub listen_port: u16,
    /// Random per-process value used to detect connections to ourselves
    pub nonce: u64,
    pub user_agent: String,
}

impl VersionMessage {
    pub fn new(genesis_hash: Hash256, best_height: u64, listen_port: u16, nonce: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            genesis_hash,
            best_height,
            listen_port,
            nonce,
            user_agent: format!("powchain/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Which blocks a `ChainRequest` asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainQuery {
    /// Canonical blocks starting at a height
    Range { from_height: u64, count: u32 },
    /// A block and its ancestors, answered oldest first
    Ancestors { hash: Hash256, count: u32 },
}

/// Network message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    NewBlock(Block),
    NewTransaction(Transaction),
    ChainRequest(ChainQuery),
    ChainResponse(Vec<Block>),
    PeerAnnounce(Vec<SocketAddr>),
    /// A command this version does not know; ignored
    Unknown(String),
}

/// Parsed frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, String> {
        if bytes[0..4] != NETWORK_MAGIC {
            return Err(format!("Bad network magic: {}", hex::encode(&bytes[0..4])));
        }

        let command = std::str::from_utf8(&bytes[4..4 + COMMAND_SIZE])
            .map_err(|e| format!("Invalid message command: {}", e))?
            .trim_end_matches('\0')
            .to_string();

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[16..20]);
        let length = u32::from_le_bytes(len_bytes) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(format!("Payload of {} bytes exceeds limit", length));
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Ok(Self {
            command,
            length,
            checksum,
        })
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = hash256(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

impl Message {
    /// Wire command name
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::NewBlock(_) => "block",
            Message::NewTransaction(_) => "tx",
            Message::ChainRequest(_) => "getchain",
            Message::ChainResponse(_) => "chain",
            Message::PeerAnnounce(_) => "peers",
            Message::Unknown(command) => command.as_str(),
        }
    }

    /// Serialize to a complete frame
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.serialize_payload();

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&NETWORK_MAGIC);

        let mut command = [0u8; COMMAND_SIZE];
        let name = self.command().as_bytes();
        let len = name.len().min(COMMAND_SIZE);
        command[..len].copy_from_slice(&name[..len]);
        bytes.extend_from_slice(&command);

        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&checksum(&payload));
        bytes.extend_from_slice(&payload);
        bytes
    }

    fn serialize_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => {
                buf.extend_from_slice(&v.version.to_le_bytes());
                buf.extend_from_slice(v.genesis_hash.as_bytes());
                buf.extend_from_slice(&v.best_height.to_le_bytes());
                buf.extend_from_slice(&v.listen_port.to_le_bytes());
                buf.extend_from_slice(&v.nonce.to_le_bytes());
                write_var_bytes(&mut buf, v.user_agent.as_bytes());
            }
            Message::Verack | Message::Unknown(_) => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.extend_from_slice(&nonce.to_le_bytes()),
            Message::NewBlock(block) => block.encode(&mut buf),
            Message::NewTransaction(tx) => tx.encode(&mut buf),
            Message::ChainRequest(ChainQuery::Range { from_height, count }) => {
                buf.push(0);
                buf.extend_from_slice(&from_height.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
            Message::ChainRequest(ChainQuery::Ancestors { hash, count }) => {
                buf.push(1);
                buf.extend_from_slice(hash.as_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
            Message::ChainResponse(blocks) => {
                write_varint(&mut buf, blocks.len() as u64);
                for block in blocks {
                    block.encode(&mut buf);
                }
            }
            Message::PeerAnnounce(addrs) => {
                write_varint(&mut buf, addrs.len() as u64);
                for addr in addrs {
                    encode_addr(&mut buf, addr);
                }
            }
        }
        buf
    }

    /// Deserialize a complete frame
    pub fn deserialize(data: &[u8]) -> Result<Self, String> {
        let header_bytes: &[u8; HEADER_SIZE] = data
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| "Message too short".to_string())?;
        let header = FrameHeader::parse(header_bytes)?;

        let payload = &data[HEADER_SIZE..];
        if payload.len() != header.length {
            return Err(format!("Expected {} payload bytes, got {}", header.length, payload.len()));
        }
        Self::from_payload(&header, payload)
    }

    /// Check the payload against its header and decode it
    pub fn from_payload(header: &FrameHeader, payload: &[u8]) -> Result<Self, String> {
        if checksum(payload) != header.checksum {
            return Err(format!("Checksum mismatch for {} message", header.command));
        }

        let mut reader = Cursor::new(payload);
        let message = Self::decode_payload(&header.command, &mut reader)?;
        if (reader.position() as usize) != payload.len() && !matches!(message, Message::Unknown(_)) {
            return Err(format!("Trailing bytes in {} message", header.command));
        }
        Ok(message)
    }

    fn decode_payload(command: &str, reader: &mut Cursor<&[u8]>) -> Result<Self, String> {
        match command {
            "version" => {
                let version = read_u32(reader).map_err(field("version"))?;
                let genesis_hash = Hash256::new(read_array(reader).map_err(field("genesis hash"))?);
                let best_height = read_u64(reader).map_err(field("best height"))?;
                let listen_port = u16::from_le_bytes(read_array(reader).map_err(field("listen port"))?);
                let nonce = read_u64(reader).map_err(field("nonce"))?;
                let agent = read_var_bytes(reader, MAX_USER_AGENT).map_err(field("user agent"))?;
                let user_agent = String::from_utf8(agent).map_err(|e| format!("user agent: {}", e))?;
                Ok(Message::Version(VersionMessage {
                    version,
                    genesis_hash,
                    best_height,
                    listen_port,
                    nonce,
                    user_agent,
                }))
            }
            "verack" => Ok(Message::Verack),
            "ping" => Ok(Message::Ping(read_u64(reader).map_err(field("ping"))?)),
            "pong" => Ok(Message::Pong(read_u64(reader).map_err(field("pong"))?)),
            "block" => Ok(Message::NewBlock(Block::decode(reader)?)),
            "tx" => Ok(Message::NewTransaction(Transaction::decode(reader)?)),
            "getchain" => {
                let [kind] = read_array::<_, 1>(reader).map_err(field("query kind"))?;
                let query = match kind {
                    0 => ChainQuery::Range {
                        from_height: read_u64(reader).map_err(field("from height"))?,
                        count: read_u32(reader).map_err(field("count"))?,
                    },
                    1 => ChainQuery::Ancestors {
                        hash: Hash256::new(read_array(reader).map_err(field("hash"))?),
                        count: read_u32(reader).map_err(field("count"))?,
                    },
                    other => return Err(format!("Unknown chain query kind {}", other)),
                };
                Ok(Message::ChainRequest(query))
            }
            "chain" => {
                let count = read_length(reader, MAX_BLOCKS_PER_RESPONSE).map_err(field("block count"))?;
                let blocks = (0..count)
                    .map(|_| Block::decode(reader))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Message::ChainResponse(blocks))
            }
            "peers" => {
                let count = read_length(reader, MAX_ANNOUNCED_PEERS).map_err(field("peer count"))?;
                let addrs = (0..count)
                    .map(|_| decode_addr(reader))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Message::PeerAnnounce(addrs))
            }
            other => Ok(Message::Unknown(other.to_string())),
        }
    }
}

fn field(name: &'static str) -> impl Fn(std::io::Error) -> String {
    move |e| format!("{}: {}", name, e)
}

fn encode_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_le_bytes());
}

fn decode_addr<R: Read>(reader: &mut R) -> Result<SocketAddr, String> {
    let [family] = read_array::<_, 1>(reader).map_err(|e| format!("address family: {}", e))?;
    let ip = match family {
        4 => IpAddr::V4(Ipv4Addr::from(
            read_array::<_, 4>(reader).map_err(|e| format!("ipv4 address: {}", e))?,
        )),
        6 => IpAddr::V6(Ipv6Addr::from(
            read_array::<_, 16>(reader).map_err(|e| format!("ipv6 address: {}", e))?,
        )),
        other => return Err(format!("Unknown address family {}", other)),
    };
    let port = u16::from_le_bytes(read_array(reader).map_err(|e| format!("port: {}", e))?);
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::core::KeyPair;

    fn round_trip(message: Message) {
        let frame = message.serialize();
        assert_eq!(Message::deserialize(&frame).unwrap(), message);
    }

    #[test]
    fn test_control_messages() {
        let genesis = ConsensusParams::regtest().genesis_block().hash();
        round_trip(Message::Version(VersionMessage::new(genesis, 42, 8333, 7)));
        round_trip(Message::Verack);
        round_trip(Message::Ping(12345));
        round_trip(Message::Pong(u64::MAX));
    }

    #[test]
    fn test_chain_messages() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let genesis = ConsensusParams::regtest().genesis_block();
        let tx = Transaction::create(&alice, bob.address, 5, 1, 0);
        let block = Block::template(
            genesis.hash(),
            1,
            genesis.header.timestamp + 1,
            genesis.header.bits,
            vec![Transaction::coinbase(alice.address, 1001, 1), tx.clone()],
        );

        round_trip(Message::NewTransaction(tx));
        round_trip(Message::NewBlock(block.clone()));
        round_trip(Message::ChainResponse(vec![block]));
        round_trip(Message::ChainRequest(ChainQuery::Range { from_height: 3, count: 500 }));
        round_trip(Message::ChainRequest(ChainQuery::Ancestors {
            hash: genesis.hash(),
            count: 10,
        }));
        round_trip(Message::PeerAnnounce(vec![
            "127.0.0.1:8333".parse().unwrap(),
            "[::1]:9000".parse().unwrap(),
        ]));
    }

    #[test]
    fn test_unknown_command_is_decoded() {
        let frame = Message::Unknown("mempool".to_string()).serialize();
        assert_eq!(
            Message::deserialize(&frame).unwrap(),
            Message::Unknown("mempool".to_string())
        );
    }

    #[test]
    fn test_corrupted_frames_rejected() {
        let mut frame = Message::Ping(1).serialize();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(Message::deserialize(&frame).unwrap_err().contains("Checksum"));

        let mut frame = Message::Ping(1).serialize();
        frame[0] = b'X';
        assert!(Message::deserialize(&frame).unwrap_err().contains("magic"));

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&Message::Verack.serialize()[..HEADER_SIZE]);
        header[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        assert!(FrameHeader::parse(&header).is_err());
    }
}
