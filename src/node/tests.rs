//! Node State Machine Tests
//!
//! Runs real nodes on loopback listeners inside one runtime.
//!
//! ## Test Scopes
//! - **Bootstrap**: the ring links up, every node learns the index and registers.
//! - **Ingestion**: an upload through any node ends up as R copies of every fragment.
//! - **Retrieval**: a download through any node reassembles the original bytes.
//! - **Healing**: a dead node is routed around and forgotten by the index.
//! - **Refusals**: packets a state has no use for, and exchanges cut short by a
//!   ring change, are answered with NOT_OK.

#[cfg(test)]
mod tests {
    use crate::client::RingClient;
    use crate::config::{DEFAULT_REDUNDANCY, NodeConfig};
    use crate::error::RingError;
    use crate::membership::types::NodeId;
    use crate::node::machine::Node;
    use crate::node::retrieval::assemble;
    use crate::node::state::NodeStatus;
    use crate::protocol::codec::{expect_ok, read_packet, write_chunk, write_packet};
    use crate::protocol::packet::{FileCreation, FileResponse, Packet, PacketBody, UseLocal};
    use std::collections::{BTreeMap, HashMap};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    const SETTLE: Duration = Duration::from_secs(10);
    const EXCHANGE: Duration = Duration::from_secs(2);

    struct Member {
        addr: SocketAddr,
        status: watch::Receiver<NodeStatus>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<Node>,
    }

    struct Cluster {
        members: Vec<Member>,
    }

    impl Cluster {
        fn start(size: u64) -> Self {
            Self::start_with(size, DEFAULT_REDUNDANCY)
        }

        fn start_with(size: u64, redundancy: usize) -> Self {
            let listeners: Vec<std::net::TcpListener> = (0..size)
                .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
                .collect();
            let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

            let members = listeners
                .into_iter()
                .enumerate()
                .map(|(i, listener)| {
                    let id = i as u64 + 1;
                    let successor = id % size + 1;
                    let config = NodeConfig::new(
                        NodeId(id),
                        addrs[i],
                        NodeId(successor),
                        addrs[(successor - 1) as usize],
                        size,
                    )
                    .with_redundancy(redundancy)
                    .with_health_interval(Duration::from_millis(20))
                    .with_exchange_timeout(EXCHANGE);

                    let node = Node::with_listener(config, listener).unwrap();
                    let status = node.subscribe();
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let handle = tokio::spawn(node.run(shutdown_rx));

                    Member {
                        addr: addrs[i],
                        status,
                        shutdown,
                        handle,
                    }
                })
                .collect();

            Self { members }
        }

        fn member(&self, id: u64) -> &Member {
            &self.members[(id - 1) as usize]
        }

        async fn wait_for<F>(&self, id: u64, what: &str, check: F)
        where
            F: Fn(&NodeStatus) -> bool,
        {
            let mut status = self.member(id).status.clone();
            let reached = tokio::time::timeout(SETTLE, async {
                loop {
                    if check(&status.borrow_and_update()) {
                        return;
                    }
                    if status.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await;
            assert!(
                reached.is_ok() && check(&status.borrow()),
                "node {} never reached: {} (last {:?})",
                id,
                what,
                *status.borrow()
            );
        }

        async fn wait_all_idle(&self) {
            for id in 1..=self.members.len() as u64 {
                self.wait_for(id, "idle", |s| s.state == "Idle").await;
            }
        }

        fn total_fragments(&self) -> usize {
            self.members.iter().map(|m| m.status.borrow().fragments).sum()
        }

        async fn wait_fragments(&self, expected: usize) {
            let reached = tokio::time::timeout(SETTLE, async {
                while self.total_fragments() < expected {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            assert!(
                reached.is_ok(),
                "only {} of {} fragments stored",
                self.total_fragments(),
                expected
            );
        }

        async fn stop(self) -> HashMap<u64, Node> {
            for member in &self.members {
                let _ = member.shutdown.send(true);
            }
            let mut nodes = HashMap::new();
            for member in self.members {
                let node = member.handle.await.unwrap();
                nodes.insert(node.id().0, node);
            }
            nodes
        }
    }

    fn sample(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 251) as u8).collect()
    }

    /// Opens a connection to `addr` and presents it as `sender`.
    async fn present_as(addr: SocketAddr, sender: NodeId) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_packet(&mut stream, &Packet::present(sender)).await.unwrap();
        expect_ok(&mut stream, EXCHANGE).await.unwrap();
        stream
    }

    /// Shuts down the highest member and waits until the survivors run
    /// under the next highest.
    async fn kill_index(cluster: &mut Cluster) {
        let index = cluster.members.pop().unwrap();
        index.shutdown.send(true).unwrap();
        drop(index.handle.await.unwrap());

        let next = cluster.members.len() as u64;
        for id in 1..=next {
            cluster
                .wait_for(id, "following the new index", |s| {
                    s.index == Some(NodeId(next)) && s.state == "Idle"
                })
                .await;
        }
    }

    // ============================================================
    // BOOTSTRAP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_ring_bootstraps_and_registers() {
        let cluster = Cluster::start(4);
        cluster.wait_all_idle().await;

        for id in 1..=4u64 {
            let status = cluster.member(id).status.borrow().clone();
            assert_eq!(status.index, Some(NodeId(4)), "node {}", id);
            assert_eq!(status.forward, Some(NodeId(id % 4 + 1)));
            assert_eq!(status.network_size, 4);
            assert_eq!(status.pending_placements, 0);
        }

        // The presentation went out over 4 -> 1 and was relayed on from 1.
        let index = cluster.member(4).status.borrow().clone();
        let first = cluster.member(1).status.borrow().clone();
        assert!(index.forward_link.tx_bytes > 0);
        assert_eq!(first.backward_link.rx_bytes, index.forward_link.tx_bytes);
        assert!(first.forward_link.tx_bytes > 0);

        let nodes = cluster.stop().await;
        let peers = nodes[&4].peer_table().expect("node 4 is the index");
        assert_eq!(peers.known(), 3);
        for id in 1..=3u64 {
            assert!(peers.address(NodeId(id)).is_some());
        }
        assert!(nodes[&1].peer_table().is_none());
    }

    #[tokio::test]
    async fn test_single_node_ring() {
        let cluster = Cluster::start_with(1, 1);
        cluster.wait_all_idle().await;

        let mut client = RingClient::connect(cluster.member(1).addr).await.unwrap();
        let receipt = client.upload("solo.bin", &sample(3000)).await.unwrap();
        assert_eq!(receipt.fragment_count, 1);

        cluster.wait_fragments(1).await;
        assert_eq!(client.download("solo.bin").await.unwrap(), sample(3000));

        cluster.stop().await;
    }

    // ============================================================
    // INGESTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_upload_through_non_index_node() {
        let cluster = Cluster::start(4);
        cluster.wait_all_idle().await;

        let data = sample(10_000);
        let mut client = RingClient::connect(cluster.member(2).addr).await.unwrap();
        let receipt = client.upload("a.bin", &data).await.unwrap();

        assert_eq!(receipt.file_id, 1);
        assert_eq!(receipt.size, 10_000);
        assert_eq!(receipt.fragment_count, 4);

        cluster.wait_fragments(8).await;
        let nodes = cluster.stop().await;

        let mut copies: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        for (id, node) in &nodes {
            let record = node.store().file(1).expect("every node holds part of a.bin");
            assert!(record.held_count() <= 2, "node {} holds too much", id);
            assert_eq!(record.name, "a.bin");
            for fragment in record.fragments() {
                assert_eq!(fragment.size(), 2500);
                let start = fragment.fragment_id as usize * 2500;
                assert_eq!(fragment.bytes, data[start..start + 2500]);
                copies.entry(fragment.fragment_id).or_default().push(*id);
            }
        }

        assert_eq!(copies.len(), 4);
        for (fragment, holders) in &copies {
            assert_eq!(holders.len(), 2, "fragment {} on {:?}", fragment, holders);
        }
        assert_eq!(nodes[&4].catalogue().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_small_file_is_one_fragment() {
        let cluster = Cluster::start(3);
        cluster.wait_all_idle().await;

        let mut client = RingClient::connect(cluster.member(3).addr).await.unwrap();
        let receipt = client.upload("tiny.txt", b"hello ring").await.unwrap();

        assert_eq!(receipt.fragment_count, 1);
        cluster.wait_fragments(2).await;
        cluster.stop().await;
    }

    /// The client's second upload reaches node 2 while the index is still
    /// pushing fragments of the first one, some of them to node 2.
    #[tokio::test]
    async fn test_back_to_back_uploads_keep_every_replica() {
        let cluster = Cluster::start(4);
        cluster.wait_all_idle().await;

        let first = sample(1_000_000);
        let second: Vec<u8> = first.iter().rev().copied().collect();
        let mut client = RingClient::connect(cluster.member(2).addr).await.unwrap();
        let a = client.upload("a.bin", &first).await.unwrap();
        let b = client.upload("b.bin", &second).await.unwrap();

        assert_ne!(a.file_id, b.file_id);
        assert_eq!((a.fragment_count, b.fragment_count), (4, 4));

        cluster.wait_fragments(16).await;
        cluster
            .wait_for(4, "fanout drained", |s| s.pending_placements == 0)
            .await;
        assert!(client.download("b.bin").await.unwrap() == second);

        let nodes = cluster.stop().await;
        for receipt in [a, b] {
            let mut copies: BTreeMap<u32, usize> = BTreeMap::new();
            for node in nodes.values() {
                if let Some(record) = node.store().file(receipt.file_id) {
                    for fragment in record.fragments() {
                        *copies.entry(fragment.fragment_id).or_default() += 1;
                    }
                }
            }
            assert_eq!(copies.len(), 4, "file {}: {:?}", receipt.file_id, copies);
            assert!(
                copies.values().all(|&holders| holders == 2),
                "file {}: {:?}",
                receipt.file_id,
                copies
            );
        }
    }

    // ============================================================
    // RETRIEVAL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_download_round_trip_from_every_node() {
        let cluster = Cluster::start(4);
        cluster.wait_all_idle().await;

        let data = sample(50_000);
        let mut uploader = RingClient::connect(cluster.member(1).addr).await.unwrap();
        uploader.upload("b.bin", &data).await.unwrap();
        cluster.wait_fragments(8).await;

        for id in [1u64, 2, 3, 4] {
            let mut client = RingClient::connect(cluster.member(id).addr).await.unwrap();
            let received = client.download("b.bin").await.unwrap();
            assert_eq!(received.len(), data.len(), "via node {}", id);
            assert!(received == data, "corrupted download via node {}", id);
        }

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_download_unknown_file() {
        let cluster = Cluster::start(3);
        cluster.wait_all_idle().await;

        let mut client = RingClient::connect(cluster.member(1).addr).await.unwrap();
        let err = client.download("missing.bin").await.unwrap_err();
        assert!(matches!(err, RingError::UnknownFile(_)));

        cluster.stop().await;
    }

    #[test]
    fn test_assemble_requires_every_fragment() {
        let mut parts = BTreeMap::new();
        parts.insert(0, vec![1, 2]);
        parts.insert(2, vec![5]);

        let err = assemble(parts.clone(), 9, 5, 3).unwrap_err();
        assert!(matches!(
            err,
            RingError::UnknownFragment {
                file_id: 9,
                fragment_id: 1
            }
        ));

        parts.insert(1, vec![3, 4]);
        assert_eq!(assemble(parts.clone(), 9, 5, 3).unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(matches!(
            assemble(parts, 9, 6, 3),
            Err(RingError::IntegrityError {
                expected: 6,
                received: 5
            })
        ));
    }

    // ============================================================
    // HEALING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_dead_node_is_routed_around() {
        let mut cluster = Cluster::start(4);
        cluster.wait_all_idle().await;

        let dead = cluster.members.remove(2);
        dead.shutdown.send(true).unwrap();
        drop(dead.handle.await.unwrap());

        let survivors = [(1u64, 0usize), (2, 1), (4, 2)];
        for (id, slot) in survivors {
            let mut status = cluster.members[slot].status.clone();
            let reached = tokio::time::timeout(SETTLE, async {
                while status.borrow_and_update().network_size != 3 {
                    status.changed().await.unwrap();
                }
            })
            .await;
            assert!(reached.is_ok(), "node {} never saw the death", id);
        }

        let mut status = cluster.members[1].status.clone();
        let rewired = tokio::time::timeout(SETTLE, async {
            while status.borrow_and_update().forward != Some(NodeId(4)) {
                status.changed().await.unwrap();
            }
        })
        .await;
        assert!(rewired.is_ok(), "node 2 never redialed node 4");

        // Give a stray duplicate notice time to show up before counting.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let nodes = cluster.stop().await;
        for id in [1u64, 2, 4] {
            assert_eq!(nodes[&id].network_size(), 3, "node {}", id);
            assert_eq!(nodes[&id].deaths(), 1, "node {} applied the death twice", id);
        }
        let peers = nodes[&4].peer_table().unwrap();
        assert_eq!(peers.address(NodeId(3)), None);
        assert!(peers.address(NodeId(1)).is_some());
        assert!(peers.address(NodeId(2)).is_some());
    }

    #[tokio::test]
    async fn test_index_death_elects_next_highest() {
        let mut cluster = Cluster::start(3);
        cluster.wait_all_idle().await;

        let index = cluster.members.remove(2);
        index.shutdown.send(true).unwrap();
        drop(index.handle.await.unwrap());

        for slot in 0..2 {
            let mut status = cluster.members[slot].status.clone();
            let reached = tokio::time::timeout(SETTLE, async {
                loop {
                    {
                        let current = status.borrow_and_update();
                        if current.index == Some(NodeId(2)) && current.state == "Idle" {
                            return;
                        }
                    }
                    status.changed().await.unwrap();
                }
            })
            .await;
            assert!(reached.is_ok(), "node {} never followed the new index", slot + 1);
        }

        let mut client = RingClient::connect(cluster.members[0].addr).await.unwrap();
        let receipt = client.upload("after.bin", &sample(4000)).await.unwrap();
        assert_eq!(receipt.fragment_count, 2);

        let nodes = cluster.stop().await;
        assert!(nodes[&2].is_index());
        assert_eq!(nodes[&1].network_size(), 2);
    }

    #[tokio::test]
    async fn test_new_index_never_reuses_file_ids() {
        let mut cluster = Cluster::start(3);
        cluster.wait_all_idle().await;

        let mut client = RingClient::connect(cluster.member(1).addr).await.unwrap();
        let before = client.upload("before.bin", &sample(4000)).await.unwrap();
        cluster.wait_fragments(4).await;

        kill_index(&mut cluster).await;
        let held = cluster.total_fragments();

        let data: Vec<u8> = sample(4000).into_iter().map(|b| b ^ 0x5a).collect();
        let mut client = RingClient::connect(cluster.member(1).addr).await.unwrap();
        let after = client.upload("after.bin", &data).await.unwrap();
        assert!(
            after.file_id > before.file_id,
            "file id {} handed out again",
            after.file_id
        );
        assert_eq!(after.fragment_count, 2);

        cluster.wait_fragments(held + 4).await;
        let received = client.download("after.bin").await.unwrap();
        assert!(received == data, "after.bin came back corrupted");

        let nodes = cluster.stop().await;
        for id in [1u64, 2] {
            if let Some(record) = nodes[&id].store().file(before.file_id) {
                assert_eq!(record.name, "before.bin", "node {}", id);
            }
            let record = nodes[&id].store().file(after.file_id).unwrap();
            assert_eq!(record.name, "after.bin");
            assert_eq!(record.held_count(), 2);
        }
    }

    // ============================================================
    // REFUSAL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unexpected_packets_get_not_ok() {
        let cluster = Cluster::start(2);
        cluster.wait_all_idle().await;
        let addr = cluster.member(1).addr;

        let strays = [
            PacketBody::ResponseFile(FileResponse {
                file_id: 1,
                size: 10,
                fragment_count: 1,
            }),
            PacketBody::DeclareUseLocal(UseLocal {
                file_id: 1,
                fragment_id: 0,
            }),
        ];
        for body in strays {
            let kind = body.kind();
            let mut stream = present_as(addr, NodeId(2)).await;
            write_packet(&mut stream, &Packet::new(NodeId(2), body))
                .await
                .unwrap();
            let reply = read_packet(&mut stream, EXCHANGE).await.unwrap();
            assert_eq!(reply.body, PacketBody::NotOk, "{:?}", kind);
        }

        let mut stream = present_as(addr, NodeId(2)).await;
        let mut frame = Packet::ok(NodeId(2)).encode().unwrap();
        frame[10] = 42;
        stream.write_all(&frame).await.unwrap();
        let reply = read_packet(&mut stream, EXCHANGE).await.unwrap();
        assert_eq!(reply.body, PacketBody::NotOk, "unknown type tag");

        // A connection must open with PRESENT_ITSELF.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_packet(&mut stream, &Packet::ok(NodeId(2))).await.unwrap();
        let reply = read_packet(&mut stream, EXCHANGE).await.unwrap();
        assert_eq!(reply.body, PacketBody::NotOk, "missing PRESENT_ITSELF");

        cluster.wait_for(1, "idle", |s| s.state == "Idle").await;
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_upload_refused_when_index_dies() {
        let mut cluster = Cluster::start(3);
        cluster.wait_all_idle().await;

        let mut client = present_as(cluster.member(1).addr, NodeId::CLIENT).await;
        let creation = FileCreation {
            name: "cut.bin".to_string(),
            size: 100_000,
        };
        write_packet(&mut client, &Packet::new(NodeId::CLIENT, PacketBody::CreateFile(creation)))
            .await
            .unwrap();
        expect_ok(&mut client, EXCHANGE).await.unwrap();
        for chunk in sample(8192).chunks(4096) {
            write_chunk(&mut client, chunk).await.unwrap();
        }

        kill_index(&mut cluster).await;

        let verdict = read_packet(&mut client, SETTLE).await.unwrap();
        assert_eq!(verdict.body, PacketBody::NotOk);
        assert_eq!(cluster.total_fragments(), 0);

        cluster.stop().await;
    }
}
