// Network protocol messages

use crate::chain::unix_now;
use crate::core::{
    read_count, read_hash, read_u32, read_u64, read_var_bytes, write_var_bytes, write_varint, Block, Hash256,
    Serializable, Transaction,
};
use crate::error::{NodeError, RejectCode, Result};
use std::io::{Cursor, Read};
use std::net::SocketAddr;

/// Command field width in the envelope
pub const COMMAND_LEN: usize = 12;
/// Command plus little-endian payload length
pub const HEADER_LEN: usize = COMMAND_LEN + 4;
pub const MAX_PAYLOAD: usize = 32 * 1024 * 1024;
pub const PROTOCOL_VERSION: u32 = 1;
/// Blocks returned for one `GetBlocks` request
pub const MAX_BLOCKS_PER_MESSAGE: usize = 500;
pub const MAX_PEER_ADDRESSES: usize = 1000;
pub const MAX_REJECT_REASON: usize = 256;

/// Network message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Version,
    Verack,
    Ping,
    Pong,
    NewTransaction,
    NewBlock,
    GetPeers,
    Peers,
    GetBlocks,
    Blocks,
    Reject,
}

impl MessageType {
    pub fn command(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::Verack => "verack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::NewTransaction => "tx",
            MessageType::NewBlock => "block",
            MessageType::GetPeers => "getpeers",
            MessageType::Peers => "peers",
            MessageType::GetBlocks => "getblocks",
            MessageType::Blocks => "blocks",
            MessageType::Reject => "reject",
        }
    }

    pub fn from_command(s: &str) -> Option<Self> {
        match s {
            "version" => Some(MessageType::Version),
            "verack" => Some(MessageType::Verack),
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "tx" => Some(MessageType::NewTransaction),
            "block" => Some(MessageType::NewBlock),
            "getpeers" => Some(MessageType::GetPeers),
            "peers" => Some(MessageType::Peers),
            "getblocks" => Some(MessageType::GetBlocks),
            "blocks" => Some(MessageType::Blocks),
            "reject" => Some(MessageType::Reject),
            _ => None,
        }
    }
}

/// Version message, the first thing each side sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub timestamp: u64,
    /// Random per process; detects connections to ourselves
    pub nonce: u64,
    pub start_height: u64,
    /// Address the sender accepts connections on
    pub listen_addr: SocketAddr,
    pub user_agent: String,
}

impl VersionMessage {
    pub fn new(nonce: u64, start_height: u64, listen_addr: SocketAddr) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            timestamp: unix_now(),
            nonce,
            start_height,
            listen_addr,
            user_agent: concat!("ledger-node/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Why a transaction or block sent by a peer was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub code: RejectCode,
    /// Id of the refused transaction or block
    pub id: Hash256,
    pub reason: String,
}

impl RejectMessage {
    pub fn from_error(id: Hash256, err: &NodeError) -> Self {
        let mut reason = err.to_string();
        if reason.len() > MAX_REJECT_REASON {
            let mut cut = MAX_REJECT_REASON;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self {
            code: err.reject_code(),
            id,
            reason,
        }
    }
}

/// Network message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    NewTransaction(Transaction),
    NewBlock(Block),
    GetPeers,
    /// Listen addresses of known peers
    Peers(Vec<SocketAddr>),
    /// Request active-chain blocks starting at a height
    GetBlocks { from_height: u64 },
    Blocks(Vec<Block>),
    Reject(RejectMessage),
}

impl Message {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Version(_) => MessageType::Version,
            Message::Verack => MessageType::Verack,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::NewTransaction(_) => MessageType::NewTransaction,
            Message::NewBlock(_) => MessageType::NewBlock,
            Message::GetPeers => MessageType::GetPeers,
            Message::Peers(_) => MessageType::Peers,
            Message::GetBlocks { .. } => MessageType::GetBlocks,
            Message::Blocks(_) => MessageType::Blocks,
            Message::Reject(_) => MessageType::Reject,
        }
    }

    /// Envelope plus payload
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.serialize_payload();
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());

        // Command (12 bytes, padded with zeros)
        let mut command = [0u8; COMMAND_LEN];
        let name = self.message_type().command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        bytes.extend_from_slice(&command);

        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    fn serialize_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => {
                buf.extend_from_slice(&v.version.to_le_bytes());
                buf.extend_from_slice(&v.timestamp.to_le_bytes());
                buf.extend_from_slice(&v.nonce.to_le_bytes());
                buf.extend_from_slice(&v.start_height.to_le_bytes());
                write_var_bytes(&mut buf, v.listen_addr.to_string().as_bytes());
                write_var_bytes(&mut buf, v.user_agent.as_bytes());
            }
            Message::Verack | Message::GetPeers => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.extend_from_slice(&nonce.to_le_bytes()),
            Message::NewTransaction(tx) => tx.write_to(&mut buf),
            Message::NewBlock(block) => block.write_to(&mut buf),
            Message::Peers(addrs) => {
                write_varint(&mut buf, addrs.len() as u64);
                for addr in addrs {
                    write_var_bytes(&mut buf, addr.to_string().as_bytes());
                }
            }
            Message::GetBlocks { from_height } => buf.extend_from_slice(&from_height.to_le_bytes()),
            Message::Blocks(blocks) => {
                write_varint(&mut buf, blocks.len() as u64);
                for block in blocks {
                    block.write_to(&mut buf);
                }
            }
            Message::Reject(reject) => {
                buf.push(reject.code as u8);
                buf.extend_from_slice(reject.id.as_bytes());
                write_var_bytes(&mut buf, reject.reason.as_bytes());
            }
        }
        buf
    }

    /// Parse an envelope header into its command and payload length
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(MessageType, usize)> {
        let command = std::str::from_utf8(&header[..COMMAND_LEN])
            .map_err(|e| NodeError::malformed(format!("invalid command: {}", e)))?
            .trim_end_matches('\0');
        let msg_type = MessageType::from_command(command)
            .ok_or_else(|| NodeError::malformed(format!("unknown command: {}", command)))?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[COMMAND_LEN..]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_PAYLOAD {
            return Err(NodeError::malformed(format!("payload of {} bytes exceeds limit", len)));
        }
        Ok((msg_type, len))
    }

    /// Decode a payload of the given type; the payload must be consumed exactly
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let message = Self::read_payload(msg_type, &mut cursor)?;
        if cursor.position() as usize != payload.len() {
            return Err(NodeError::malformed(format!(
                "{} trailing bytes in {}",
                payload.len() - cursor.position() as usize,
                msg_type.command()
            )));
        }
        Ok(message)
    }

    fn read_payload<R: Read>(msg_type: MessageType, reader: &mut R) -> Result<Self> {
        let message = match msg_type {
            MessageType::Version => Message::Version(VersionMessage {
                version: read_u32(reader)?,
                timestamp: read_u64(reader)?,
                nonce: read_u64(reader)?,
                start_height: read_u64(reader)?,
                listen_addr: read_socket_addr(reader)?,
                user_agent: read_string(reader)?,
            }),
            MessageType::Verack => Message::Verack,
            MessageType::Ping => Message::Ping(read_u64(reader)?),
            MessageType::Pong => Message::Pong(read_u64(reader)?),
            MessageType::NewTransaction => Message::NewTransaction(Transaction::read_from(reader)?),
            MessageType::NewBlock => Message::NewBlock(Block::read_from(reader)?),
            MessageType::GetPeers => Message::GetPeers,
            MessageType::Peers => {
                let count = read_count(reader)?;
                if count > MAX_PEER_ADDRESSES {
                    return Err(NodeError::malformed(format!("{} peer addresses", count)));
                }
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(read_socket_addr(reader)?);
                }
                Message::Peers(addrs)
            }
            MessageType::GetBlocks => Message::GetBlocks {
                from_height: read_u64(reader)?,
            },
            MessageType::Blocks => {
                let count = read_count(reader)?;
                if count > MAX_BLOCKS_PER_MESSAGE {
                    return Err(NodeError::malformed(format!("{} blocks in one message", count)));
                }
                let mut blocks = Vec::with_capacity(count);
                for _ in 0..count {
                    blocks.push(Block::read_from(reader)?);
                }
                Message::Blocks(blocks)
            }
            MessageType::Reject => {
                let [byte] = crate::core::read_array::<R, 1>(reader)?;
                let code = RejectCode::from_byte(byte)
                    .ok_or_else(|| NodeError::malformed(format!("unknown reject code {:#04x}", byte)))?;
                Message::Reject(RejectMessage {
                    code,
                    id: read_hash(reader)?,
                    reason: read_string(reader)?,
                })
            }
        };
        Ok(message)
    }

    /// Deserialize a complete envelope
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(NodeError::malformed("message too short"));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&data[..HEADER_LEN]);
        let (msg_type, len) = Self::parse_header(&header)?;

        let payload = &data[HEADER_LEN..];
        if payload.len() != len {
            return Err(NodeError::malformed(format!(
                "payload length {} does not match header {}",
                payload.len(),
                len
            )));
        }
        Self::decode(msg_type, payload)
    }
}

fn read_string<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let bytes = read_var_bytes(reader)?;
    String::from_utf8(bytes).map_err(|e| NodeError::malformed(format!("invalid utf-8: {}", e)))
}

fn read_socket_addr<R: Read + ?Sized>(reader: &mut R) -> Result<SocketAddr> {
    let text = read_string(reader)?;
    text.parse()
        .map_err(|e| NodeError::malformed(format!("invalid address {:?}: {}", text, e)))
}
