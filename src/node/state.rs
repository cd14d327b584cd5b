use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;

use crate::membership::types::{LinkStats, NodeId};
use crate::protocol::packet::{FileCreation, FragmentStore, Packet};
use crate::storage::partitioner::FragmentPlacement;

/// An accepted connection together with who opened it.
#[derive(Debug)]
pub struct Peer {
    pub id: NodeId,
    pub stream: TcpStream,
}

impl Peer {
    pub fn is_client(&self) -> bool {
        self.id.is_client()
    }
}

/// A forward dial whose acknowledgements have not all arrived yet.
#[derive(Debug)]
pub struct PendingAttach {
    pub stream: TcpStream,
    pub acks: u8,
    pub deadline: Instant,
}

#[derive(Debug)]
pub enum RawPurpose {
    /// A whole file uploaded by a client, possibly mirrored to the index.
    NewFile { name: String },
    /// One fragment pushed by the index during fanout.
    Fragment { file_id: u64, fragment_id: u32 },
}

/// Bulk receive in progress. Chunks are consumed a few per tick.
#[derive(Debug)]
pub struct RawTransfer {
    pub purpose: RawPurpose,
    pub size: u64,
    pub buffer: Vec<u8>,
    pub chunks_left: u64,
    pub source: Peer,
    /// Connection to the index that every chunk is copied to.
    pub mirror: Option<TcpStream>,
}

/// A client upload parked until its mirror exchange with the index can be
/// retried.
#[derive(Debug)]
pub struct DeferredUpload {
    pub creation: FileCreation,
    pub peer: Peer,
    pub attempts: u32,
    pub retry_at: Instant,
}

/// One placement entry the index still has to deliver.
#[derive(Debug, Clone)]
pub struct PendingPlacement {
    pub header: FragmentStore,
    pub entry: FragmentPlacement,
    /// The whole file, shared by every entry of its fanout.
    pub file: Arc<[u8]>,
    pub attempts: u32,
    pub not_before: Instant,
}

impl PendingPlacement {
    pub fn is_due(&self, now: Instant) -> bool {
        self.not_before <= now
    }
}

/// Fragments gathered for a client download.
#[derive(Debug)]
pub struct Collection {
    pub name: String,
    pub file_id: u64,
    pub size: u64,
    pub fragment_count: u32,
    pub parts: BTreeMap<u32, Vec<u8>>,
    /// Fragments the index still has to request from their owners when it
    /// collects for its own client. Routed one at a time.
    pub unrouted: VecDeque<u32>,
    pub awaiting: Option<u32>,
    pub client: Peer,
    pub deadline: Instant,
}

/// One variant per machine state, each carrying only the data that state works on.
#[derive(Debug)]
pub enum NodeState {
    Booting,
    Connecting { pending: Option<PendingAttach> },
    BeginOperation,
    IndexPresentItself,
    IndexWaitingPeers,
    WaitIndexGossip,
    ReportKnowledgeToIndex,
    Idle,
    ReceivedPacket { packet: Packet, peer: Peer },
    WaitingRawPackets(RawTransfer),
    IndexHandleNewFile { name: String, bytes: Vec<u8>, origin: Peer },
    /// Delivers the next due entry of the index's placement queue.
    IndexFanoutFragments,
    ReceivedFragment { file_id: u64, fragment_id: u32, bytes: Vec<u8>, source: Peer },
    CollectingFragments(Collection),
}

impl NodeState {
    pub fn label(&self) -> &'static str {
        match self {
            NodeState::Booting => "Booting",
            NodeState::Connecting { .. } => "Connecting",
            NodeState::BeginOperation => "BeginOperation",
            NodeState::IndexPresentItself => "IndexPresentItself",
            NodeState::IndexWaitingPeers => "IndexWaitingPeers",
            NodeState::WaitIndexGossip => "WaitIndexGossip",
            NodeState::ReportKnowledgeToIndex => "ReportKnowledgeToIndex",
            NodeState::Idle => "Idle",
            NodeState::ReceivedPacket { .. } => "ReceivedPacket",
            NodeState::WaitingRawPackets(_) => "WaitingRawPackets",
            NodeState::IndexHandleNewFile { .. } => "IndexHandleNewFile",
            NodeState::IndexFanoutFragments => "IndexFanoutFragments",
            NodeState::ReceivedFragment { .. } => "ReceivedFragment",
            NodeState::CollectingFragments(_) => "CollectingFragments",
        }
    }

    pub fn connecting() -> Self {
        NodeState::Connecting { pending: None }
    }
}

/// Snapshot published after every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: &'static str,
    pub network_size: usize,
    pub deaths: u64,
    pub index: Option<NodeId>,
    pub forward: Option<NodeId>,
    pub backward: Option<NodeId>,
    pub fragments: usize,
    pub files_indexed: usize,
    /// Placement entries the index has yet to deliver.
    pub pending_placements: usize,
    pub forward_link: LinkStats,
    pub backward_link: LinkStats,
}
