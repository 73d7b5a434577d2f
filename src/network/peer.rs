// Peer connection: framed reads and writes, handshake

use crate::config::{PROTOCOL_VERSION, SOCKET_TIMEOUT};
use crate::network::message::{FrameHeader, HEADER_SIZE};
use crate::network::{Message, VersionMessage};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Peer information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub version: u32,
    pub best_height: u64,
    pub listen_port: u16,
    pub user_agent: String,
    /// The peer dialed us
    pub inbound: bool,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, inbound: bool) -> Self {
        Self {
            addr,
            version: 0,
            best_height: 0,
            listen_port: 0,
            user_agent: String::new(),
            inbound,
        }
    }

    /// Address other nodes can dial to reach this peer
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        if self.inbound {
            (self.listen_port != 0).then(|| SocketAddr::new(self.addr.ip(), self.listen_port))
        } else {
            Some(self.addr)
        }
    }
}

/// Read one framed message
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, String> {
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| format!("Failed to read header: {}", e))?;
    let header = FrameHeader::parse(&header)?;

    let mut payload = vec![0u8; header.length];
    if header.length > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| format!("Failed to read payload: {}", e))?;
    }

    Message::from_payload(&header, &payload)
}

/// Write one framed message and flush it
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<(), String> {
    let data = message.serialize();

    writer
        .write_all(&data)
        .await
        .map_err(|e| format!("Failed to send message: {}", e))?;

    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush: {}", e))?;

    Ok(())
}

/// Exchange version and verack.
///
/// Both sides send their version first. Peers on another protocol version or
/// another genesis block are refused, as is a connection to ourselves.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    addr: SocketAddr,
    ours: &VersionMessage,
    inbound: bool,
) -> Result<PeerInfo, String> {
    timeout(SOCKET_TIMEOUT, exchange_versions(stream, addr, ours, inbound))
        .await
        .map_err(|_| format!("Handshake with {} timed out", addr))?
}

async fn exchange_versions<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    addr: SocketAddr,
    ours: &VersionMessage,
    inbound: bool,
) -> Result<PeerInfo, String> {
    write_message(stream, &Message::Version(ours.clone())).await?;

    let theirs = match read_message(stream).await? {
        Message::Version(v) => v,
        other => return Err(format!("Expected version message, got {}", other.command())),
    };

    if theirs.nonce == ours.nonce {
        return Err("Connected to ourselves".to_string());
    }
    if theirs.version != PROTOCOL_VERSION {
        return Err(format!("Unsupported protocol version {}", theirs.version));
    }
    if theirs.genesis_hash != ours.genesis_hash {
        return Err(format!("Peer is on another chain (genesis {})", theirs.genesis_hash.short()));
    }

    write_message(stream, &Message::Verack).await?;
    match read_message(stream).await? {
        Message::Verack => {}
        other => return Err(format!("Expected verack message, got {}", other.command())),
    }

    Ok(PeerInfo {
        addr,
        version: theirs.version,
        best_height: theirs.best_height,
        listen_port: theirs.listen_port,
        user_agent: theirs.user_agent,
        inbound,
    })
}
