//! Protocol Module Tests
//!
//! ## Test Scopes
//! - **Packet layout**: header bytes, tag mapping and rejection of malformed frames.
//! - **Framed I/O**: packets and bulk transfers over an in-memory duplex pipe.
//! - **Integrity**: short or oversized transfers never reassemble silently.

#[cfg(test)]
mod tests {
    use crate::error::RingError;
    use crate::membership::types::NodeId;
    use crate::protocol::codec::*;
    use crate::protocol::packet::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    // ============================================================
    // PACKET LAYOUT TESTS
    // ============================================================

    #[test]
    fn test_header_layout() {
        let frame = Packet::present(NodeId(3)).encode().unwrap();

        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + HEADER_SIZE);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]) as usize, HEADER_SIZE);
        assert_eq!(&frame[2..10], &3u64.to_le_bytes());
        assert_eq!(frame[10], PacketKind::PresentItself as u8);
    }

    #[test]
    fn test_client_sentinel_on_wire() {
        let frame = Packet::present(NodeId::CLIENT).encode().unwrap();
        let decoded = Packet::decode(&frame[LENGTH_PREFIX_SIZE..]).unwrap();

        assert!(decoded.sender.is_client());
        assert_eq!(decoded.body, PacketBody::PresentItself);
    }

    #[test]
    fn test_peer_is_dead_decodes() {
        let packet = Packet::new(
            NodeId(4),
            PacketBody::PeerIsDead(PeerIsDead {
                dead: NodeId(3),
                successor: NodeId(4),
                successor_addr: addr(7004),
            }),
        );
        let frame = packet.encode().unwrap();
        let decoded = Packet::decode(&frame[LENGTH_PREFIX_SIZE..]).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_fragment_store_decodes() {
        let packet = Packet::new(
            NodeId(4),
            PacketBody::StoreFragment(FragmentStore {
                file_id: 7,
                name: "a.bin".to_string(),
                file_size: 10_000,
                fragment_count: 4,
                fragment_id: 3,
                fragment_size: 2_500,
            }),
        );
        let frame = packet.encode().unwrap();

        assert!(frame.len() <= LENGTH_PREFIX_SIZE + MAX_BODY_SIZE);
        assert_eq!(Packet::decode(&frame[LENGTH_PREFIX_SIZE..]).unwrap(), packet);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = Packet::ok(NodeId(1)).encode().unwrap();
        frame[10] = 42;

        let err = Packet::decode(&frame[LENGTH_PREFIX_SIZE..]).unwrap_err();
        assert!(matches!(err, RingError::UnknownPacketType(42)));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_short_body_rejected() {
        let err = Packet::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, RingError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unit_packet_with_payload_rejected() {
        let mut frame = Packet::ok(NodeId(1)).encode().unwrap();
        frame.push(0xff);

        let err = Packet::decode(&frame[LENGTH_PREFIX_SIZE..]).unwrap_err();
        assert!(matches!(err, RingError::ProtocolViolation(_)));
    }

    #[test]
    fn test_long_file_name_rejected() {
        let packet = Packet::new(
            NodeId::CLIENT,
            PacketBody::CreateFile(FileCreation {
                name: "x".repeat(MAX_NAME_LEN + 1),
                size: 1,
            }),
        );

        assert!(matches!(
            packet.encode(),
            Err(RingError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_every_tag_maps_back() {
        for tag in [1u8, 2, 3, 4, 5, 10, 11, 15, 16, 17, 18, 19, 200, 220] {
            let kind = PacketKind::try_from(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert!(PacketKind::try_from(0).is_err());
    }

    // ============================================================
    // FRAMED I/O TESTS
    // ============================================================

    #[tokio::test]
    async fn test_packets_keep_boundaries_when_coalesced() {
        let (mut a, mut b) = tokio::io::duplex(8192);

        write_packet(&mut a, &Packet::present(NodeId(1))).await.unwrap();
        write_packet(&mut a, &Packet::new(NodeId(1), PacketBody::RingAttach))
            .await
            .unwrap();

        let first = read_packet(&mut b, TIMEOUT).await.unwrap();
        let second = read_packet(&mut b, TIMEOUT).await.unwrap();

        assert_eq!(first.body, PacketBody::PresentItself);
        assert_eq!(second.body, PacketBody::RingAttach);
    }

    #[tokio::test]
    async fn test_expect_ok_verdicts() {
        let (mut a, mut b) = tokio::io::duplex(8192);

        write_packet(&mut a, &Packet::ok(NodeId(2))).await.unwrap();
        write_packet(&mut a, &Packet::not_ok(NodeId(2))).await.unwrap();
        write_packet(&mut a, &Packet::present(NodeId(2))).await.unwrap();

        assert!(expect_ok(&mut b, TIMEOUT).await.is_ok());
        assert!(matches!(
            expect_ok(&mut b, TIMEOUT).await,
            Err(RingError::HandshakeRejected)
        ));
        assert!(matches!(
            expect_ok(&mut b, TIMEOUT).await,
            Err(RingError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);

        let err = read_packet(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RingError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_failure() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_packet(&mut b, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RingError::ConnectionFailure(_)));
    }

    // ============================================================
    // BULK TRANSFER TESTS
    // ============================================================

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(4095), 1);
        assert_eq!(chunk_count(4096), 1);
        assert_eq!(chunk_count(4097), 2);
        assert_eq!(chunk_count(1_000_000), 245);
    }

    #[tokio::test]
    async fn test_bulk_reassembles_exactly() {
        for size in [0usize, 1, 4095, 4096, 4097, 1_000_000] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let (mut a, mut b) = tokio::io::duplex(64 * 1024);

            let sent = data.clone();
            let writer = tokio::spawn(async move { write_bulk(&mut a, &sent).await });

            let received = read_bulk(&mut b, size as u64, TIMEOUT).await.unwrap();
            writer.await.unwrap().unwrap();

            assert_eq!(received.len(), size, "size {}", size);
            assert_eq!(received, data, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_short_transfer_is_integrity_error() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        write_chunk(&mut a, &[7u8; 4096]).await.unwrap();
        write_chunk(&mut a, &[7u8; 100]).await.unwrap();

        let err = read_bulk(&mut b, 5_000, TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            RingError::IntegrityError {
                expected: 5_000,
                received: 4_196
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        a.write_all(&5000u16.to_le_bytes()).await.unwrap();

        let err = read_chunk(&mut b, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RingError::ProtocolViolation(_)));
    }
}
