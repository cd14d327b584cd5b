//! Connection helpers shared by every exchange a node starts or accepts.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use super::state::Peer;
use crate::error::{Result, RingError};
use crate::membership::types::NodeId;
use crate::protocol::codec::{expect_ok, read_packet, within, write_packet};
use crate::protocol::packet::{Packet, PacketBody};

const DIAL_ATTEMPTS: usize = 3;

pub async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    within("connect", timeout, async {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok::<_, RingError>(stream)
    })
    .await
}

/// Dials with exponential backoff and jitter.
pub async fn dial_with_retry(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let mut delay_ms = 20u64;

    for attempt in 0..DIAL_ATTEMPTS {
        match dial(addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt + 1 == DIAL_ATTEMPTS {
                    return Err(e);
                }
                tracing::debug!("Dial to {} failed ({}), retrying", addr, e);
                let jitter = rand::random::<u64>() % 20;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(400);
            }
        }
    }

    Err(RingError::Timeout {
        op: "connect",
        after: timeout,
    })
}

/// Opens a connection and completes the PRESENT_ITSELF / OK handshake.
pub async fn open_exchange(me: NodeId, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let mut stream = dial_with_retry(addr, timeout).await?;
    write_packet(&mut stream, &Packet::present(me)).await?;
    expect_ok(&mut stream, timeout).await?;
    Ok(stream)
}

/// Writes the two packets that ask `addr` to adopt this connection as its
/// backward link. The two OKs are read by the caller.
pub async fn start_attach(me: NodeId, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let mut stream = dial(addr, timeout).await?;
    write_packet(&mut stream, &Packet::present(me)).await?;
    write_packet(&mut stream, &Packet::new(me, PacketBody::RingAttach)).await?;
    Ok(stream)
}

/// Dials and attaches, waiting for both acknowledgements.
pub async fn attach(me: NodeId, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let mut stream = dial_with_retry(addr, timeout).await?;
    write_packet(&mut stream, &Packet::present(me)).await?;
    write_packet(&mut stream, &Packet::new(me, PacketBody::RingAttach)).await?;
    expect_ok(&mut stream, timeout).await?;
    expect_ok(&mut stream, timeout).await?;
    Ok(stream)
}

pub async fn accept_within(listener: &TcpListener, wait: Duration) -> Result<Option<TcpStream>> {
    match tokio::time::timeout(wait, listener.accept()).await {
        Err(_) => Ok(None),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok((stream, from))) => {
            tracing::debug!("Accepted connection from {}", from);
            stream.set_nodelay(true)?;
            Ok(Some(stream))
        }
    }
}

/// Answers the opening PRESENT_ITSELF of an accepted connection.
pub async fn greet(me: NodeId, mut stream: TcpStream, timeout: Duration) -> Result<Peer> {
    let packet = read_packet(&mut stream, timeout).await?;
    if packet.body != PacketBody::PresentItself {
        refuse(me, &mut stream).await;
        return Err(RingError::ProtocolViolation(format!(
            "expected PRESENT_ITSELF, got {:?}",
            packet.kind()
        )));
    }
    write_packet(&mut stream, &Packet::ok(me)).await?;
    Ok(Peer {
        id: packet.sender,
        stream,
    })
}

/// Best-effort refusal; the connection is usually dropped right after.
pub async fn refuse(me: NodeId, stream: &mut TcpStream) {
    if let Err(e) = write_packet(stream, &Packet::not_ok(me)).await {
        tracing::debug!("Could not send NOT_OK: {}", e);
    }
}
