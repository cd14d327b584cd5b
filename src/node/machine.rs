use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::state::{
    DeferredUpload, NodeState, NodeStatus, PendingAttach, PendingPlacement, Peer, RawPurpose,
    RawTransfer,
};
use super::transport::{accept_within, greet, open_exchange, refuse, start_attach};
use crate::config::NodeConfig;
use crate::error::{Result, RingError};
use crate::membership::gossip;
use crate::membership::health::{self, HealAction, Probe};
use crate::membership::ring::LiveRing;
use crate::membership::types::{IndexLink, NodeId, PeerLink};
use crate::protocol::codec::{
    allocate, chunk_count, expect_ok, poll_packet, read_chunk, read_packet, verify_length,
    write_chunk, write_packet,
};
use crate::protocol::packet::{
    FileCreation, FragmentStore, IndexPresentation, Packet, PacketBody, PeerIsDead, ReportSelf,
};
use crate::storage::catalogue::{FileCatalogue, IndexData, PeerTable};
use crate::storage::memory::LocalStore;
use crate::storage::partitioner::PartitionManager;

const INITIAL_DIAL_DELAY_MS: u64 = 10;
const MAX_DIAL_DELAY_MS: u64 = 500;
const MAX_MIRROR_ATTEMPTS: u32 = 8;
const MIRROR_RETRY_MS: u64 = 25;

/// Outcome of trying to open the mirror exchange of an upload.
enum Mirror {
    Open(TcpStream),
    /// Another connection arrived first and was accepted instead.
    Yielded(TcpStream),
}

/// One ring member and everything it owns.
///
/// The node is driven by [`Node::tick`]: every call performs one bounded unit
/// of work for the current [`NodeState`] and computes the next one. Nothing is
/// shared with other tasks; observers read the [`NodeStatus`] published after
/// each tick.
pub struct Node {
    pub(super) config: NodeConfig,
    pub(super) listener: TcpListener,
    pub(super) ring: LiveRing,
    pub(super) forward: PeerLink,
    pub(super) backward: PeerLink,
    pub(super) index: Option<IndexLink>,
    pub(super) index_data: Option<IndexData>,
    pub(super) store: LocalStore,
    pub(super) partitioner: PartitionManager,
    pub(super) parked: Vec<Peer>,
    /// Index only: placement entries not yet delivered.
    pub(super) fanout: VecDeque<PendingPlacement>,
    deferred: Vec<DeferredUpload>,
    deaths: u64,
    state: NodeState,
    last_health: Instant,
    next_dial: Instant,
    dial_delay_ms: u64,
    status: watch::Sender<NodeStatus>,
}

impl Node {
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.addr).await?;
        Self::from_listener(config, listener)
    }

    /// Builds a node on an already bound listener. Must be called inside a
    /// tokio runtime.
    pub fn with_listener(config: NodeConfig, listener: std::net::TcpListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Self::from_listener(config, TcpListener::from_std(listener)?)
    }

    fn from_listener(config: NodeConfig, listener: TcpListener) -> Result<Self> {
        config.validate()?;

        let ring = LiveRing::new(config.network_size);
        let forward = PeerLink::new(config.successor_id, Some(config.successor_addr));
        let backward = PeerLink::new(
            ring.predecessor(config.id).unwrap_or(config.id),
            None,
        );
        let store = LocalStore::new(config.redundancy);
        let partitioner = PartitionManager::new(config.redundancy, config.split_threshold);
        let state = NodeState::Booting;
        let (status, _) = watch::channel(NodeStatus {
            id: config.id,
            state: state.label(),
            network_size: ring.len(),
            deaths: 0,
            index: None,
            forward: None,
            backward: None,
            fragments: 0,
            files_indexed: 0,
            pending_placements: 0,
            forward_link: forward.stats,
            backward_link: backward.stats,
        });

        Ok(Self {
            config,
            listener,
            ring,
            forward,
            backward,
            index: None,
            index_data: None,
            store,
            partitioner,
            parked: Vec::new(),
            fanout: VecDeque::new(),
            deferred: Vec::new(),
            deaths: 0,
            state,
            last_health: Instant::now(),
            next_dial: Instant::now(),
            dial_delay_ms: INITIAL_DIAL_DELAY_MS,
            status,
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state_label(&self) -> &'static str {
        self.state.label()
    }

    pub fn network_size(&self) -> usize {
        self.ring.len()
    }

    pub fn deaths(&self) -> u64 {
        self.deaths
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn index_id(&self) -> Option<NodeId> {
        self.index.map(|index| index.id)
    }

    pub fn forward_id(&self) -> Option<NodeId> {
        self.forward.is_open().then_some(self.forward.id)
    }

    pub fn backward_id(&self) -> Option<NodeId> {
        self.backward.is_open().then_some(self.backward.id)
    }

    pub fn peer_table(&self) -> Option<&PeerTable> {
        self.index_data.as_ref().map(|data| &data.peers)
    }

    pub fn catalogue(&self) -> Option<&FileCatalogue> {
        self.index_data.as_ref().map(|data| &data.catalogue)
    }

    pub fn is_index(&self) -> bool {
        self.index_data.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    /// Ticks until `shutdown` turns true (or its sender is dropped), then
    /// hands the node back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        tracing::info!(
            "Node {} listening on {} (ring of {})",
            self.config.id,
            self.config.addr,
            self.config.network_size
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        tracing::info!("Node {} stopped in {}", self.config.id, self.state.label());
        self
    }

    pub async fn tick(&mut self) {
        let state = std::mem::replace(&mut self.state, NodeState::Idle);
        let from = state.label();

        let next = self.step(state).await;
        if next.label() != from {
            tracing::debug!("Node {}: {} -> {}", self.config.id, from, next.label());
        }

        self.state = next;
        self.publish();
    }

    async fn step(&mut self, state: NodeState) -> NodeState {
        match state {
            NodeState::Booting => {
                tracing::info!("Node {} booting", self.config.id);
                NodeState::connecting()
            }
            NodeState::Connecting { pending } => self.connect_ring(pending).await,
            NodeState::BeginOperation => self.begin_operation(),
            NodeState::IndexPresentItself => self.present_index().await,
            NodeState::IndexWaitingPeers => self.wait_peers().await,
            NodeState::WaitIndexGossip => self.wait_gossip().await,
            NodeState::ReportKnowledgeToIndex => self.report_to_index().await,
            NodeState::Idle => self.idle().await,
            NodeState::ReceivedPacket { packet, peer } => self.dispatch(packet, peer).await,
            NodeState::WaitingRawPackets(transfer) => self.receive_raw(transfer).await,
            NodeState::IndexHandleNewFile {
                name,
                bytes,
                origin,
            } => self.handle_new_file(name, bytes, origin).await,
            NodeState::IndexFanoutFragments => self.fanout_step().await,
            NodeState::ReceivedFragment {
                file_id,
                fragment_id,
                bytes,
                source,
            } => self.store_received(file_id, fragment_id, bytes, source).await,
            NodeState::CollectingFragments(collection) => self.collect_step(collection).await,
        }
    }

    fn publish(&self) {
        let status = NodeStatus {
            id: self.config.id,
            state: self.state.label(),
            network_size: self.ring.len(),
            deaths: self.deaths,
            index: self.index_id(),
            forward: self.forward_id(),
            backward: self.backward_id(),
            fragments: self.store.fragment_total(),
            files_indexed: self.catalogue().map_or(0, FileCatalogue::len),
            pending_placements: self.fanout.len(),
            forward_link: self.forward.stats,
            backward_link: self.backward.stats,
        };
        self.status.send_if_modified(move |current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    // ============================================================
    // BOOTSTRAP
    // ============================================================

    async fn connect_ring(&mut self, pending: Option<PendingAttach>) -> NodeState {
        if self.ring.len() <= 1 {
            return NodeState::BeginOperation;
        }

        if !self.backward.is_open() {
            self.serve_attach().await;
        }

        let pending = if self.forward.is_open() {
            None
        } else {
            self.advance_forward_dial(pending).await
        };

        if self.forward.is_open() && self.backward.is_open() {
            tracing::info!(
                "Node {} linked: forward {} backward {}",
                self.config.id,
                self.forward.id,
                self.backward.id
            );
            return NodeState::BeginOperation;
        }
        NodeState::Connecting { pending }
    }

    /// Accepts one connection and adopts it if it is a ring attach.
    async fn serve_attach(&mut self) {
        let me = self.config.id;
        match accept_within(&self.listener, self.config.accept_poll).await {
            Ok(Some(stream)) => {
                if let Err(e) = self.attach_inbound(stream).await {
                    tracing::debug!("Node {} rejected connection while linking: {}", me, e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Node {} accept failed: {}", me, e),
        }
    }

    async fn attach_inbound(&mut self, stream: TcpStream) -> Result<()> {
        let me = self.config.id;
        let mut peer = greet(me, stream, self.config.exchange_timeout).await?;
        let packet = read_packet(&mut peer.stream, self.config.exchange_timeout).await?;
        if packet.body != PacketBody::RingAttach {
            refuse(me, &mut peer.stream).await;
            return Err(RingError::ProtocolViolation(format!(
                "{:?} before the ring is linked",
                packet.kind()
            )));
        }
        self.adopt_backward(peer).await
    }

    /// Drives the forward dial without blocking: the attach packets are written
    /// once and the two OKs are collected over later ticks.
    async fn advance_forward_dial(&mut self, pending: Option<PendingAttach>) -> Option<PendingAttach> {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;

        let Some(mut pending) = pending else {
            if Instant::now() < self.next_dial {
                return None;
            }
            let addr = self.forward.addr?;
            return match start_attach(me, addr, timeout).await {
                Ok(stream) => Some(PendingAttach {
                    stream,
                    acks: 0,
                    deadline: Instant::now() + timeout,
                }),
                Err(e) => {
                    tracing::debug!("Node {} cannot reach successor {}: {}", me, self.forward.id, e);
                    self.back_off_dial();
                    None
                }
            };
        };

        match poll_packet(&mut pending.stream, Duration::ZERO, timeout).await {
            Ok(Some(packet)) if packet.body == PacketBody::Ok => {
                pending.acks += 1;
                if pending.acks < 2 {
                    return Some(pending);
                }
                let id = self.forward.id;
                self.forward.open(id, None, pending.stream);
                self.dial_delay_ms = INITIAL_DIAL_DELAY_MS;
                tracing::info!("Node {} forward link to {}", me, id);
                None
            }
            Ok(Some(packet)) => {
                tracing::warn!("Node {} attach refused by {}: {:?}", me, self.forward.id, packet.kind());
                self.back_off_dial();
                None
            }
            Ok(None) if Instant::now() >= pending.deadline => {
                tracing::warn!("Node {} attach to {} timed out", me, self.forward.id);
                self.back_off_dial();
                None
            }
            Ok(None) => Some(pending),
            Err(e) => {
                tracing::debug!("Node {} attach to {} failed: {}", me, self.forward.id, e);
                self.back_off_dial();
                None
            }
        }
    }

    fn back_off_dial(&mut self) {
        let jitter = rand::random::<u64>() % 20;
        self.next_dial = Instant::now() + Duration::from_millis(self.dial_delay_ms + jitter);
        self.dial_delay_ms = (self.dial_delay_ms * 2).min(MAX_DIAL_DELAY_MS);
    }

    fn begin_operation(&mut self) -> NodeState {
        match self.ring.index_id() {
            Some(index) if index == self.config.id => NodeState::IndexPresentItself,
            _ => NodeState::WaitIndexGossip,
        }
    }

    async fn present_index(&mut self) -> NodeState {
        let link = IndexLink {
            id: self.config.id,
            addr: self.config.addr,
        };
        self.index = Some(link);
        let mut data = IndexData::new(self.config.network_size);
        data.catalogue.observe(self.store.highest_file_id());
        self.index_data = Some(data);
        tracing::info!(
            "Node {} is the index of a ring of {}",
            self.config.id,
            self.ring.len()
        );

        if self.ring.len() > 1 {
            if let Err(e) = self.send_forward(&gossip::presentation(link)).await {
                tracing::warn!("Node {} could not announce itself: {}", self.config.id, e);
            }
        }
        NodeState::IndexWaitingPeers
    }

    fn registrations_done(&self) -> bool {
        self.peer_table()
            .is_some_and(|peers| gossip::registrations_complete(peers.known(), self.ring.len()))
    }

    async fn wait_peers(&mut self) -> NodeState {
        if let Some(next) = self.check_health(false).await {
            return next;
        }
        if self.registrations_done() {
            tracing::info!("Index {} ready: all peers registered", self.config.id);
            return NodeState::Idle;
        }

        let me = self.config.id;
        match accept_within(&self.listener, self.config.accept_poll).await {
            Ok(Some(stream)) => {
                if let Err(e) = self.accept_registration(stream).await {
                    tracing::debug!("Index {} rejected connection: {}", me, e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Index {} accept failed: {}", me, e),
        }

        if self.registrations_done() {
            tracing::info!("Index {} ready: all peers registered", me);
            return NodeState::Idle;
        }
        NodeState::IndexWaitingPeers
    }

    /// While registrations are pending the index only takes REPORT_SELF and
    /// ring attaches.
    async fn accept_registration(&mut self, stream: TcpStream) -> Result<()> {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;
        let mut peer = greet(me, stream, timeout).await?;
        let packet = read_packet(&mut peer.stream, timeout).await?;
        match packet.body {
            PacketBody::ReportSelf(report) => {
                self.register_peer(packet.sender, report, peer).await;
                Ok(())
            }
            PacketBody::RingAttach => self.adopt_backward(peer).await,
            other => {
                refuse(me, &mut peer.stream).await;
                Err(RingError::ProtocolViolation(format!(
                    "{:?} while waiting for registrations",
                    other.kind()
                )))
            }
        }
    }

    async fn wait_gossip(&mut self) -> NodeState {
        if let Some(next) = self.check_health(true).await {
            return next;
        }
        if !self.backward.is_open() {
            self.serve_attach().await;
        }
        NodeState::WaitIndexGossip
    }

    async fn report_to_index(&mut self) -> NodeState {
        if let Some(next) = self.check_health(false).await {
            return next;
        }
        let Some(index) = self.index else {
            return NodeState::WaitIndexGossip;
        };
        if Instant::now() < self.next_dial {
            return NodeState::ReportKnowledgeToIndex;
        }

        let me = self.config.id;
        let result = self.report_self(index).await;

        match result {
            Ok(()) => {
                tracing::info!("Node {} registered with index {}", me, index.id);
                self.dial_delay_ms = INITIAL_DIAL_DELAY_MS;
                NodeState::Idle
            }
            Err(e) => {
                tracing::warn!("Node {} could not register with index {}: {}", me, index.id, e);
                self.back_off_dial();
                NodeState::ReportKnowledgeToIndex
            }
        }
    }

    async fn report_self(&self, index: IndexLink) -> Result<()> {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;
        let mut stream = open_exchange(me, index.addr, timeout).await?;
        let report = gossip::report(me, self.config.addr, self.store.highest_file_id());
        write_packet(&mut stream, &report).await?;
        expect_ok(&mut stream, timeout).await?;
        Ok(())
    }

    // ============================================================
    // RING LINKS & HEALTH
    // ============================================================

    pub(super) async fn send_forward(&mut self, packet: &Packet) -> Result<()> {
        let stream = self
            .forward
            .stream
            .as_mut()
            .ok_or(RingError::UnknownPeer(self.forward.id))?;
        let sent = write_packet(stream, packet).await?;
        self.forward.stats.sent(sent);
        Ok(())
    }

    async fn relay_forward(&mut self, packet: Packet) {
        if let Err(e) = self.send_forward(&packet).await {
            tracing::warn!(
                "Node {} could not relay {:?} to {}: {}",
                self.config.id,
                packet.kind(),
                self.forward.id,
                e
            );
        }
    }

    pub(super) async fn adopt_backward(&mut self, mut peer: Peer) -> Result<()> {
        let sent = write_packet(&mut peer.stream, &Packet::ok(self.config.id)).await?;
        if self.backward.is_open() {
            tracing::info!(
                "Node {} replaces backward link {} with {}",
                self.config.id,
                self.backward.id,
                peer.id
            );
        } else {
            tracing::info!("Node {} backward link from {}", self.config.id, peer.id);
        }
        self.backward.open(peer.id, None, peer.stream);
        self.backward.stats.sent(sent);
        Ok(())
    }

    /// Looks at the backward link at most once per health interval, unless
    /// `force` is set. Returns a state to jump to when the ring changed under
    /// the current state.
    pub(super) async fn check_health(&mut self, force: bool) -> Option<NodeState> {
        if !force && self.last_health.elapsed() < self.config.health_interval {
            return None;
        }
        self.last_health = Instant::now();

        let stream = self.backward.stream.as_mut()?;
        match health::probe(stream, self.config.accept_poll, self.config.exchange_timeout).await {
            Probe::Quiet => None,
            Probe::Packet(packet, size) => {
                self.backward.stats.received(size);
                self.handle_ring_packet(packet).await
            }
            Probe::Closed(e) => {
                tracing::warn!(
                    "Node {} lost backward peer {}: {}",
                    self.config.id,
                    self.backward.id,
                    e
                );
                self.backward_died().await
            }
        }
    }

    async fn handle_ring_packet(&mut self, packet: Packet) -> Option<NodeState> {
        match packet.body {
            PacketBody::IndexPresentation(presentation) => self.learn_index(presentation).await,
            PacketBody::PeerIsDead(notice) => self.handle_death_notice(notice).await,
            other => {
                tracing::warn!(
                    "Node {} ignoring {:?} from {} on the ring",
                    self.config.id,
                    other.kind(),
                    packet.sender
                );
                None
            }
        }
    }

    async fn learn_index(&mut self, presentation: IndexPresentation) -> Option<NodeState> {
        let me = self.config.id;
        if presentation.index_id == me {
            tracing::debug!("Index {} heard its own presentation", me);
            return None;
        }

        self.index = Some(IndexLink {
            id: presentation.index_id,
            addr: presentation.index_addr,
        });
        self.index_data = None;
        self.drop_fanout();
        tracing::info!(
            "Node {} learned index {} at {}",
            me,
            presentation.index_id,
            presentation.index_addr
        );

        if gossip::should_relay(self.forward.id, presentation.index_id) {
            self.relay_forward(Packet::new(me, PacketBody::IndexPresentation(presentation)))
                .await;
        }
        Some(NodeState::ReportKnowledgeToIndex)
    }

    async fn backward_died(&mut self) -> Option<NodeState> {
        let me = self.config.id;
        let dead = self.backward.id;
        self.backward.close();

        let (notice, action) =
            health::detect(&mut self.ring, me, self.config.addr, dead, self.forward.id)?;
        self.record_death(dead);

        if action == HealAction::Detach {
            self.forward.close();
        } else {
            self.relay_forward(Packet::new(me, PacketBody::PeerIsDead(notice)))
                .await;
        }
        self.after_death(dead)
    }

    async fn handle_death_notice(&mut self, notice: PeerIsDead) -> Option<NodeState> {
        let me = self.config.id;
        match health::apply_notice(&mut self.ring, me, self.forward.id, &notice) {
            HealAction::Ignore => {
                tracing::debug!("Node {} already applied death of {}", me, notice.dead);
                return None;
            }
            HealAction::Relay => {
                self.record_death(notice.dead);
                self.relay_forward(Packet::new(me, PacketBody::PeerIsDead(notice)))
                    .await;
            }
            HealAction::Rewire { successor, addr } => {
                self.record_death(notice.dead);
                self.rewire(successor, addr).await;
            }
            HealAction::Detach => {
                self.record_death(notice.dead);
                self.forward.close();
            }
        }
        self.after_death(notice.dead)
    }

    fn record_death(&mut self, dead: NodeId) {
        self.deaths += 1;
        if let Some(data) = self.index_data.as_mut()
            && data.peers.clear(dead).is_some()
        {
            tracing::info!("Index {} forgot address of {}", self.config.id, dead);
        }
        tracing::info!(
            "Node {} applied death of {} (ring of {})",
            self.config.id,
            dead,
            self.ring.len()
        );
    }

    async fn rewire(&mut self, successor: NodeId, addr: std::net::SocketAddr) {
        let me = self.config.id;
        self.forward.close();
        self.forward = PeerLink::new(successor, Some(addr));

        match super::transport::attach(me, addr, self.config.exchange_timeout).await {
            Ok(stream) => {
                self.forward.open(successor, Some(addr), stream);
                tracing::info!("Node {} rewired forward link to {}", me, successor);
            }
            Err(e) => tracing::warn!("Node {} could not rewire to {}: {}", me, successor, e),
        }
    }

    /// Leaves the current state if the death broke an assumption it relies on.
    fn after_death(&mut self, dead: NodeId) -> Option<NodeState> {
        if self.index_id() == Some(dead) {
            tracing::warn!("Node {}: index {} died, restarting bootstrap", self.config.id, dead);
            self.index = None;
            self.index_data = None;
            self.drop_fanout();
            return Some(NodeState::connecting());
        }
        if !self.forward.is_open() && self.ring.len() > 1 {
            return Some(NodeState::connecting());
        }
        None
    }

    // ============================================================
    // IDLE & DISPATCH
    // ============================================================

    async fn idle(&mut self) -> NodeState {
        if let Some(next) = self.check_health(false).await {
            return next;
        }
        if let Some(next) = self.poll_parked().await {
            return next;
        }

        match accept_within(&self.listener, self.config.accept_poll).await {
            Ok(Some(stream)) => return self.accept_request(stream).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("Node {} accept failed: {}", self.config.id, e),
        }

        if let Some(upload) = self.take_due_upload() {
            return self
                .begin_upload(upload.creation, upload.peer, upload.attempts)
                .await;
        }
        if self.placement_due() {
            return NodeState::IndexFanoutFragments;
        }
        NodeState::Idle
    }

    fn take_due_upload(&mut self) -> Option<DeferredUpload> {
        let now = Instant::now();
        let position = self.deferred.iter().position(|upload| upload.retry_at <= now)?;
        Some(self.deferred.swap_remove(position))
    }

    fn defer_upload(&mut self, creation: FileCreation, peer: Peer, attempts: u32) {
        let jitter = rand::random::<u64>() % 20;
        let delay = Duration::from_millis(MIRROR_RETRY_MS * u64::from(attempts.max(1)) + jitter);
        self.deferred.push(DeferredUpload {
            creation,
            peer,
            attempts,
            retry_at: Instant::now() + delay,
        });
    }

    /// Returns the first parked client with a request waiting.
    async fn poll_parked(&mut self) -> Option<NodeState> {
        let timeout = self.config.exchange_timeout;
        let mut i = 0;
        while i < self.parked.len() {
            match poll_packet(&mut self.parked[i].stream, Duration::ZERO, timeout).await {
                Ok(None) => i += 1,
                Ok(Some(packet)) => {
                    let peer = self.parked.swap_remove(i);
                    return Some(NodeState::ReceivedPacket { packet, peer });
                }
                Err(e) => {
                    let mut peer = self.parked.swap_remove(i);
                    if e.is_protocol() {
                        refuse(self.config.id, &mut peer.stream).await;
                    }
                    tracing::debug!("Node {} dropped client: {}", self.config.id, e);
                }
            }
        }
        None
    }

    /// Keeps a client connection open for its next request; other peers are
    /// done after one exchange.
    pub(super) fn repark(&mut self, peer: Peer) {
        if peer.is_client() {
            self.parked.push(peer);
        }
    }

    pub(super) async fn reject(&mut self, mut peer: Peer) -> NodeState {
        refuse(self.config.id, &mut peer.stream).await;
        self.repark(peer);
        NodeState::Idle
    }

    async fn accept_request(&mut self, stream: TcpStream) -> NodeState {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;

        let mut peer = match greet(me, stream, timeout).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!("Node {} handshake failed: {}", me, e);
                return NodeState::Idle;
            }
        };
        if peer.is_client() {
            tracing::debug!("Node {} parked a client connection", me);
            self.parked.push(peer);
            return NodeState::Idle;
        }

        match read_packet(&mut peer.stream, timeout).await {
            Ok(packet) => NodeState::ReceivedPacket { packet, peer },
            Err(e) => {
                if e.is_protocol() {
                    refuse(me, &mut peer.stream).await;
                }
                tracing::warn!("Node {} bad request from {}: {}", me, peer.id, e);
                NodeState::Idle
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet, mut peer: Peer) -> NodeState {
        let me = self.config.id;
        let sender = packet.sender;
        tracing::debug!("Node {} handling {:?} from {}", me, packet.kind(), sender);

        match packet.body {
            PacketBody::CreateFile(creation) => self.begin_upload(creation, peer, 0).await,
            PacketBody::StoreFragment(header) => self.begin_fragment(header, peer).await,
            PacketBody::RingAttach => {
                if let Err(e) = self.adopt_backward(peer).await {
                    tracing::warn!("Node {} could not adopt {}: {}", me, sender, e);
                }
                NodeState::Idle
            }
            PacketBody::ReportSelf(report) => {
                self.register_peer(sender, report, peer).await;
                NodeState::Idle
            }
            PacketBody::RequestFile(request) => self.begin_retrieval(request, peer).await,
            PacketBody::RequestFragment(request) => {
                self.serve_fragment_request(request, peer).await;
                NodeState::Idle
            }
            body @ (PacketBody::PeerIsDead(_) | PacketBody::IndexPresentation(_)) => {
                if let Err(e) = write_packet(&mut peer.stream, &Packet::ok(me)).await {
                    tracing::debug!("Node {} could not acknowledge ring packet: {}", me, e);
                }
                self.handle_ring_packet(Packet::new(sender, body))
                    .await
                    .unwrap_or(NodeState::Idle)
            }
            other => {
                tracing::debug!("Node {} rejects {:?} from {}", me, other.kind(), sender);
                self.reject(peer).await
            }
        }
    }

    async fn register_peer(&mut self, sender: NodeId, report: ReportSelf, mut peer: Peer) {
        let me = self.config.id;
        let addr = report.addr;
        let live = self.ring.contains(sender);
        let registered = match self.index_data.as_mut() {
            Some(data) if live => {
                data.catalogue.observe(report.highest_file_id);
                data.peers.register(sender, addr)
            }
            _ => None,
        };

        match registered {
            Some(fresh) => {
                if fresh {
                    tracing::info!(
                        "Index {} registered {} at {} ({}/{})",
                        me,
                        sender,
                        addr,
                        self.peer_table().map_or(0, PeerTable::known),
                        self.ring.len().saturating_sub(1)
                    );
                } else {
                    tracing::debug!("Index {} refreshed address of {}", me, sender);
                }
                if let Err(e) = write_packet(&mut peer.stream, &Packet::ok(me)).await {
                    tracing::warn!("Index {} could not acknowledge {}: {}", me, sender, e);
                }
            }
            None => {
                tracing::warn!("Node {} refused registration from {}", me, sender);
                refuse(me, &mut peer.stream).await;
            }
        }
    }

    // ============================================================
    // BULK RECEIVE
    // ============================================================

    /// Starts receiving a client upload. A node that is not the index first
    /// opens the mirror exchange; when that cannot happen now the client is
    /// held back and the attempt repeated from `Idle`.
    async fn begin_upload(
        &mut self,
        creation: FileCreation,
        mut peer: Peer,
        attempts: u32,
    ) -> NodeState {
        let me = self.config.id;
        let buffer = match allocate(creation.size) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!("Node {} cannot accept {}: {}", me, creation.name, e);
                return self.reject(peer).await;
            }
        };

        let mirror = if self.is_index() {
            None
        } else {
            match self.open_mirror(&creation).await {
                Ok(Mirror::Open(stream)) => Some(stream),
                Ok(Mirror::Yielded(inbound)) => {
                    tracing::debug!(
                        "Node {} postpones {} for an incoming exchange",
                        me,
                        creation.name
                    );
                    self.defer_upload(creation, peer, attempts + 1);
                    return self.accept_request(inbound).await;
                }
                Err(e) if attempts + 1 < MAX_MIRROR_ATTEMPTS => {
                    tracing::warn!(
                        "Node {} cannot reach the index for {} (attempt {}): {}",
                        me,
                        creation.name,
                        attempts + 1,
                        e
                    );
                    self.defer_upload(creation, peer, attempts + 1);
                    return NodeState::Idle;
                }
                Err(e) => {
                    tracing::warn!("Node {} gives up on {}: {}", me, creation.name, e);
                    return self.reject(peer).await;
                }
            }
        };

        if let Err(e) = write_packet(&mut peer.stream, &Packet::ok(me)).await {
            tracing::warn!("Node {} lost uploader of {}: {}", me, creation.name, e);
            return NodeState::Idle;
        }
        tracing::info!(
            "Node {} receiving {} ({} bytes) from {}",
            me,
            creation.name,
            creation.size,
            peer.id
        );

        NodeState::WaitingRawPackets(RawTransfer {
            purpose: RawPurpose::NewFile {
                name: creation.name,
            },
            size: creation.size,
            buffer,
            chunks_left: chunk_count(creation.size),
            source: peer,
            mirror,
        })
    }

    /// Opens the exchange that copies an upload to the index as it arrives.
    ///
    /// The index may at the same moment be waiting for this node to accept a
    /// fragment, so a connection arriving meanwhile wins over the mirror.
    async fn open_mirror(&self, creation: &FileCreation) -> Result<Mirror> {
        let index = self
            .index
            .ok_or_else(|| RingError::ProtocolViolation("index not known yet".to_string()))?;

        tokio::select! {
            opened = self.mirror_exchange(index, creation) => opened.map(Mirror::Open),
            accepted = self.listener.accept() => {
                let (stream, from) = accepted?;
                tracing::debug!("Accepted connection from {}", from);
                stream.set_nodelay(true)?;
                Ok(Mirror::Yielded(stream))
            }
        }
    }

    async fn mirror_exchange(&self, index: IndexLink, creation: &FileCreation) -> Result<TcpStream> {
        let timeout = self.config.exchange_timeout;
        let mut stream = open_exchange(self.config.id, index.addr, timeout).await?;
        let packet = Packet::new(self.config.id, PacketBody::CreateFile(creation.clone()));
        write_packet(&mut stream, &packet).await?;
        expect_ok(&mut stream, timeout).await?;
        Ok(stream)
    }

    async fn begin_fragment(&mut self, header: FragmentStore, peer: Peer) -> NodeState {
        let me = self.config.id;
        let record = match self.store.ensure_file(
            header.file_id,
            &header.name,
            header.file_size,
            header.fragment_count,
        ) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Node {} refuses {} from {}: {}", me, header.name, peer.id, e);
                return self.reject(peer).await;
            }
        };

        if header.fragment_id >= record.fragment_count
            || record.fragment(header.fragment_id).is_some()
            || record.held_count() >= record.capacity()
        {
            tracing::warn!(
                "Node {} refuses fragment {} of file {}",
                me,
                header.fragment_id,
                header.file_id
            );
            return self.reject(peer).await;
        }

        let buffer = match allocate(header.fragment_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!("Node {} cannot accept fragment: {}", me, e);
                return self.reject(peer).await;
            }
        };

        let mut peer = peer;
        if let Err(e) = write_packet(&mut peer.stream, &Packet::ok(me)).await {
            tracing::warn!("Node {} lost fragment sender {}: {}", me, peer.id, e);
            return NodeState::Idle;
        }

        NodeState::WaitingRawPackets(RawTransfer {
            purpose: RawPurpose::Fragment {
                file_id: header.file_id,
                fragment_id: header.fragment_id,
            },
            size: header.fragment_size,
            buffer,
            chunks_left: chunk_count(header.fragment_size),
            source: peer,
            mirror: None,
        })
    }

    async fn receive_raw(&mut self, mut transfer: RawTransfer) -> NodeState {
        if let Some(next) = self.check_health(false).await {
            tracing::warn!(
                "Node {} abandoned {:?} from {}: ring changed",
                self.config.id,
                transfer.purpose,
                transfer.source.id
            );
            refuse(self.config.id, &mut transfer.source.stream).await;
            self.repark(transfer.source);
            return next;
        }

        let timeout = self.config.exchange_timeout;
        for _ in 0..self.config.chunks_per_tick {
            if transfer.chunks_left == 0 {
                break;
            }
            let chunk = match read_chunk(&mut transfer.source.stream, timeout).await {
                Ok(chunk) => chunk,
                Err(e) => return self.abort_transfer(transfer, e).await,
            };
            if let Some(mirror) = transfer.mirror.as_mut()
                && let Err(e) = write_chunk(mirror, &chunk).await
            {
                return self.abort_transfer(transfer, e).await;
            }

            transfer.buffer.extend_from_slice(&chunk);
            transfer.chunks_left -= 1;
            if transfer.buffer.len() as u64 > transfer.size {
                break;
            }
        }

        let received = transfer.buffer.len() as u64;
        if transfer.chunks_left > 0 && received <= transfer.size {
            return NodeState::WaitingRawPackets(transfer);
        }
        if let Err(e) = verify_length(transfer.size, received) {
            return self.abort_transfer(transfer, e).await;
        }

        match transfer.purpose {
            RawPurpose::NewFile { name } => match transfer.mirror {
                None => NodeState::IndexHandleNewFile {
                    name,
                    bytes: transfer.buffer,
                    origin: transfer.source,
                },
                Some(mirror) => self.finish_mirrored_upload(name, mirror, transfer.source).await,
            },
            RawPurpose::Fragment {
                file_id,
                fragment_id,
            } => NodeState::ReceivedFragment {
                file_id,
                fragment_id,
                bytes: transfer.buffer,
                source: transfer.source,
            },
        }
    }

    async fn abort_transfer(&mut self, transfer: RawTransfer, error: RingError) -> NodeState {
        tracing::warn!(
            "Node {} aborted {:?} from {}: {}",
            self.config.id,
            transfer.purpose,
            transfer.source.id,
            error
        );
        self.reject(transfer.source).await
    }

    /// Waits for the index's verdict on a mirrored upload and passes it on.
    async fn finish_mirrored_upload(
        &mut self,
        name: String,
        mut mirror: TcpStream,
        mut origin: Peer,
    ) -> NodeState {
        let me = self.config.id;
        match read_packet(&mut mirror, self.config.exchange_timeout).await {
            Ok(Packet {
                body: PacketBody::ResponseFile(response),
                ..
            }) => {
                tracing::info!(
                    "File {} stored as id {} ({} fragments)",
                    name,
                    response.file_id,
                    response.fragment_count
                );
                let reply = Packet::new(me, PacketBody::ResponseFile(response));
                match write_packet(&mut origin.stream, &reply).await {
                    Ok(_) => self.repark(origin),
                    Err(e) => tracing::warn!("Node {} lost uploader of {}: {}", me, name, e),
                }
                NodeState::Idle
            }
            Ok(other) => {
                tracing::warn!("Index refused {}: {:?}", name, other.kind());
                self.reject(origin).await
            }
            Err(e) => {
                tracing::warn!("Node {} got no verdict for {}: {}", me, name, e);
                self.reject(origin).await
            }
        }
    }

    async fn store_received(
        &mut self,
        file_id: u64,
        fragment_id: u32,
        bytes: Vec<u8>,
        mut source: Peer,
    ) -> NodeState {
        let me = self.config.id;
        match self.store.store_fragment(file_id, fragment_id, bytes) {
            Ok(_) => {
                if let Err(e) = write_packet(&mut source.stream, &Packet::ok(me)).await {
                    tracing::warn!("Node {} could not confirm fragment {}: {}", me, fragment_id, e);
                }
            }
            Err(e) => {
                tracing::warn!("Node {} could not store fragment {}: {}", me, fragment_id, e);
                refuse(me, &mut source.stream).await;
            }
        }
        NodeState::Idle
    }
}
