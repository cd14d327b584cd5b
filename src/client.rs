//! Client side of the node protocol.
//!
//! A client connects to any ring member, presents itself with the reserved
//! client id and then issues uploads and downloads on the same connection.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::{Result, RingError};
use crate::membership::types::NodeId;
use crate::protocol::codec::{expect_ok, read_bulk, read_packet, write_bulk, write_packet};
use crate::protocol::packet::{FileCreation, FileRequest, Packet, PacketBody};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// What the ring reports back for a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReceipt {
    pub file_id: u64,
    pub size: u64,
    pub fragment_count: u32,
}

pub struct RingClient {
    stream: TcpStream,
    timeout: Duration,
}

impl RingClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_timeout(addr, CLIENT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_packet(&mut stream, &Packet::present(NodeId::CLIENT)).await?;
        expect_ok(&mut stream, timeout).await?;

        tracing::debug!("Client connected to {}", addr);
        Ok(Self { stream, timeout })
    }

    /// Uploads `bytes` as `name`. Returns once the index has planned the file.
    pub async fn upload(&mut self, name: &str, bytes: &[u8]) -> Result<FileReceipt> {
        let creation = FileCreation {
            name: name.to_string(),
            size: bytes.len() as u64,
        };
        write_packet(
            &mut self.stream,
            &Packet::new(NodeId::CLIENT, PacketBody::CreateFile(creation)),
        )
        .await?;
        expect_ok(&mut self.stream, self.timeout).await?;
        write_bulk(&mut self.stream, bytes).await?;

        match read_packet(&mut self.stream, self.timeout).await?.body {
            PacketBody::ResponseFile(response) => Ok(FileReceipt {
                file_id: response.file_id,
                size: response.size,
                fragment_count: response.fragment_count,
            }),
            PacketBody::NotOk => Err(RingError::HandshakeRejected),
            other => Err(RingError::ProtocolViolation(format!(
                "expected RESPONSE_FILE, got {:?}",
                other.kind()
            ))),
        }
    }

    pub async fn download(&mut self, name: &str) -> Result<Vec<u8>> {
        let request = FileRequest {
            name: name.to_string(),
        };
        write_packet(
            &mut self.stream,
            &Packet::new(NodeId::CLIENT, PacketBody::RequestFile(request)),
        )
        .await?;

        match read_packet(&mut self.stream, self.timeout).await?.body {
            PacketBody::ResponseFile(response) => {
                read_bulk(&mut self.stream, response.size, self.timeout).await
            }
            PacketBody::NotOk => Err(RingError::UnknownFile(name.to_string())),
            other => Err(RingError::ProtocolViolation(format!(
                "expected RESPONSE_FILE, got {:?}",
                other.kind()
            ))),
        }
    }
}
