// Peer connection management

use crate::chain::unix_now;
use crate::error::{NodeError, Result};
use crate::network::{Message, VersionMessage, HEADER_LEN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Peer information
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Socket address of the connection
    pub addr: SocketAddr,
    /// Address the peer accepts connections on, from its version message
    pub listen_addr: SocketAddr,
    pub version: u32,
    /// Best height we know the peer has
    pub best_height: u64,
    pub user_agent: String,
    pub nonce: u64,
    pub inbound: bool,
    pub last_seen: u64,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, inbound: bool) -> Self {
        Self {
            addr,
            listen_addr: addr,
            version: 0,
            best_height: 0,
            user_agent: String::new(),
            nonce: 0,
            inbound,
            last_seen: unix_now(),
        }
    }
}

/// Read one framed message
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| NodeError::network(format!("failed to read header: {}", e)))?;

    let (msg_type, payload_len) = Message::parse_header(&header)?;

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| NodeError::network(format!("failed to read payload: {}", e)))?;
    }

    Message::decode(msg_type, &payload)
}

/// Write one framed message
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let data = message.serialize();
    writer
        .write_all(&data)
        .await
        .map_err(|e| NodeError::network(format!("failed to send message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| NodeError::network(format!("failed to flush: {}", e)))?;
    Ok(())
}

/// Peer connection before it is split into reader and writer tasks
pub struct Peer {
    pub info: PeerInfo,
    stream: TcpStream,
}

impl Peer {
    /// Create a new peer from a TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr, inbound: bool) -> Self {
        Self {
            info: PeerInfo::new(addr, inbound),
            stream,
        }
    }

    /// Connect to a peer
    pub async fn connect(addr: SocketAddr, wait: Duration) -> Result<Self> {
        let stream = timeout(wait, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::network(format!("connection to {} timed out", addr)))?
            .map_err(|e| NodeError::network(format!("failed to connect to {}: {}", addr, e)))?;

        Ok(Self::new(stream, addr, false))
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    pub async fn receive_message(&mut self) -> Result<Message> {
        read_message(&mut self.stream).await
    }

    /// Exchange version and verack. Both sides send first, so the order is symmetric.
    pub async fn handshake(&mut self, ours: &VersionMessage, wait: Duration) -> Result<()> {
        self.send_message(&Message::Version(ours.clone())).await?;

        let theirs = timeout(wait, self.receive_message())
            .await
            .map_err(|_| NodeError::network("handshake timed out"))??;
        let v = match theirs {
            Message::Version(v) => v,
            other => {
                return Err(NodeError::network(format!(
                    "expected version, got {}",
                    other.message_type().command()
                )))
            }
        };
        if v.nonce == ours.nonce {
            return Err(NodeError::network("connected to self"));
        }
        self.info.version = v.version;
        self.info.best_height = v.start_height;
        self.info.listen_addr = v.listen_addr;
        self.info.user_agent = v.user_agent;
        self.info.nonce = v.nonce;

        self.send_message(&Message::Verack).await?;

        let verack = timeout(wait, self.receive_message())
            .await
            .map_err(|_| NodeError::network("handshake timed out"))??;
        if !matches!(verack, Message::Verack) {
            return Err(NodeError::network("expected verack"));
        }

        self.info.last_seen = unix_now();
        Ok(())
    }

    /// Get peer address
    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    pub fn into_split(self) -> (PeerInfo, OwnedReadHalf, OwnedWriteHalf) {
        let (reader, writer) = self.stream.into_split();
        (self.info, reader, writer)
    }
}

/// A connected peer as seen by the rest of the node: its info plus the
/// bounded queue feeding its writer task
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub info: PeerInfo,
    sender: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn new(info: PeerInfo, sender: mpsc::Sender<Message>) -> Self {
        Self { info, sender }
    }

    /// Queue a message without waiting. Returns false if the queue is full or closed.
    pub fn send(&self, message: Message) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropping message to {}: {}", self.info.addr, e);
                false
            }
        }
    }
}

/// Drain `outbox` onto the socket until either side closes
pub async fn run_writer(mut writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<Message>, addr: SocketAddr) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            log::warn!("Dropping peer {}: {}", addr, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_peer_info() {
        let addr: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let info = PeerInfo::new(addr, true);

        assert_eq!(info.addr, addr);
        assert_eq!(info.listen_addr, addr);
        assert_eq!(info.version, 0);
        assert!(info.inbound);
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let wait = Duration::from_secs(5);

        let server = tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            let mut peer = Peer::new(stream, addr, true);
            peer.handshake(&VersionMessage::new(1, 10, server_addr), wait).await.unwrap();
            assert_eq!(peer.receive_message().await.unwrap(), Message::Ping(42));
            peer.send_message(&Message::Pong(42)).await.unwrap();
            peer.info
        });

        let client_listen: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut client = Peer::connect(server_addr, wait).await.unwrap();
        client.handshake(&VersionMessage::new(2, 3, client_listen), wait).await.unwrap();
        assert_eq!(client.info.best_height, 10);
        assert_eq!(client.info.listen_addr, server_addr);

        client.send_message(&Message::Ping(42)).await.unwrap();
        assert_eq!(client.receive_message().await.unwrap(), Message::Pong(42));

        let server_view = server.await.unwrap();
        assert_eq!(server_view.best_height, 3);
        assert_eq!(server_view.listen_addr, client_listen);
    }

    #[tokio::test]
    async fn test_self_connection_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let wait = Duration::from_secs(5);

        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let mut peer = Peer::new(stream, remote, true);
            peer.handshake(&VersionMessage::new(5, 0, addr), wait).await
        });

        let mut client = Peer::connect(addr, wait).await.unwrap();
        let result = client.handshake(&VersionMessage::new(5, 0, addr), wait).await;
        assert!(matches!(result, Err(NodeError::Network(_))));
        assert!(server.await.unwrap().is_err());
    }
}
