//! Framed I/O over any async byte stream.
//!
//! Control packets are read and written as whole frames. Bulk payloads are
//! sliced into chunks of at most [`MAX_BODY_SIZE`] bytes, each with its own
//! length prefix and no acknowledgement; the receiver performs exactly
//! [`chunk_count`] reads and checks the total against the declared size.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::packet::{LENGTH_PREFIX_SIZE, MAX_BODY_SIZE, Packet, PacketBody};
use crate::error::{Result, RingError};

/// Runs `fut`, mapping an elapsed deadline to [`RingError::Timeout`].
pub async fn within<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(RingError::Timeout { op, after }),
    }
}

/// Number of chunks a bulk transfer of `size` bytes is split into.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(MAX_BODY_SIZE as u64)
}

/// Allocates a receive buffer, surfacing allocation failure instead of aborting.
pub fn allocate(size: u64) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let len = usize::try_from(size).map_err(|_| RingError::Allocation(size))?;
    buffer
        .try_reserve_exact(len)
        .map_err(|_| RingError::Allocation(size))?;
    Ok(buffer)
}

pub fn verify_length(expected: u64, received: u64) -> Result<()> {
    if expected != received {
        return Err(RingError::IntegrityError { expected, received });
    }
    Ok(())
}

/// Writes one packet frame and returns the number of bytes sent.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = packet.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    tracing::trace!("-> {:?} from {} ({} bytes)", packet.kind(), packet.sender, frame.len());
    Ok(frame.len())
}

async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = u16::from_le_bytes(prefix) as usize;
    if len > MAX_BODY_SIZE {
        return Err(RingError::ProtocolViolation(format!(
            "frame of {} bytes exceeds {}",
            len, MAX_BODY_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads one packet, returning it along with the number of bytes consumed.
pub async fn read_packet_counted<R>(reader: &mut R, timeout: Duration) -> Result<(Packet, usize)>
where
    R: AsyncRead + Unpin,
{
    let body = within("read packet", timeout, read_frame(reader)).await?;
    let packet = Packet::decode(&body)?;
    tracing::trace!("<- {:?} from {} ({} bytes)", packet.kind(), packet.sender, body.len());
    Ok((packet, LENGTH_PREFIX_SIZE + body.len()))
}

pub async fn read_packet<R>(reader: &mut R, timeout: Duration) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    read_packet_counted(reader, timeout)
        .await
        .map(|(packet, _)| packet)
}

/// Waits for the peer's verdict on the current exchange.
pub async fn expect_ok<R>(reader: &mut R, timeout: Duration) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let packet = read_packet(reader, timeout).await?;
    match packet.body {
        PacketBody::Ok => Ok(packet),
        PacketBody::NotOk => Err(RingError::HandshakeRejected),
        _ => Err(RingError::ProtocolViolation(format!(
            "expected OK, got {:?}",
            packet.kind()
        ))),
    }
}

/// Returns a packet if one starts arriving within `wait`.
///
/// Readiness is checked with a one-byte peek so nothing is consumed unless a
/// whole frame is then read under `timeout`. End of stream is reported as a
/// connection failure.
pub async fn poll_packet(
    stream: &mut TcpStream,
    wait: Duration,
    timeout: Duration,
) -> Result<Option<Packet>> {
    poll_packet_counted(stream, wait, timeout)
        .await
        .map(|polled| polled.map(|(packet, _)| packet))
}

/// [`poll_packet`] that also reports the frame size.
pub async fn poll_packet_counted(
    stream: &mut TcpStream,
    wait: Duration,
    timeout: Duration,
) -> Result<Option<(Packet, usize)>> {
    let mut probe = [0u8; 1];
    match tokio::time::timeout(wait, stream.peek(&mut probe)).await {
        Err(_) => Ok(None),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(0)) => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
        Ok(Ok(_)) => read_packet_counted(stream, timeout).await.map(Some),
    }
}

pub async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    if chunk.len() > MAX_BODY_SIZE {
        return Err(RingError::ProtocolViolation(format!(
            "chunk of {} bytes exceeds {}",
            chunk.len(),
            MAX_BODY_SIZE
        )));
    }
    writer.write_all(&(chunk.len() as u16).to_le_bytes()).await?;
    writer.write_all(chunk).await?;
    Ok(LENGTH_PREFIX_SIZE + chunk.len())
}

/// Streams `bytes` as ⌈len/4096⌉ chunks.
pub async fn write_bulk<W>(writer: &mut W, bytes: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    for chunk in bytes.chunks(MAX_BODY_SIZE) {
        written += write_chunk(writer, chunk).await?;
    }
    writer.flush().await?;
    Ok(written)
}

pub async fn read_chunk<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    within("read chunk", timeout, read_frame(reader)).await
}

/// Reads a complete bulk transfer of `size` bytes.
pub async fn read_bulk<R>(reader: &mut R, size: u64, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = allocate(size)?;
    for _ in 0..chunk_count(size) {
        let chunk = read_chunk(reader, timeout).await?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() as u64 > size {
            break;
        }
    }
    verify_length(size, buffer.len() as u64)?;
    Ok(buffer)
}
