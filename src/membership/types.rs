use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Position of a node in the ring, 1..=N.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Sender id used by client connections; never a ring member.
    pub const CLIENT: NodeId = NodeId(u64::MAX);

    pub fn is_client(&self) -> bool {
        *self == Self::CLIENT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_client() {
            write!(f, "#client")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Bytes moved over a ring link since it was last opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl LinkStats {
    pub fn sent(&mut self, bytes: usize) {
        self.tx_bytes += bytes as u64;
    }

    pub fn received(&mut self, bytes: usize) {
        self.rx_bytes += bytes as u64;
    }
}

/// One of the two persistent ring links a node keeps.
///
/// The forward link points at the successor and is dialed by this node; the
/// backward link points at the predecessor and is accepted from it. `stream`
/// is `None` while the link is closed.
#[derive(Debug)]
pub struct PeerLink {
    pub id: NodeId,
    pub addr: Option<SocketAddr>,
    pub stream: Option<TcpStream>,
    pub stats: LinkStats,
}

impl PeerLink {
    pub fn new(id: NodeId, addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            addr,
            stream: None,
            stats: LinkStats::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn open(&mut self, id: NodeId, addr: Option<SocketAddr>, stream: TcpStream) {
        self.id = id;
        self.addr = addr.or(self.addr);
        self.stream = Some(stream);
        self.stats = LinkStats::default();
    }

    /// Drops the connection, keeping the last known identity for diagnostics.
    pub fn close(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }
}

/// Identity of the current index, learned through gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLink {
    pub id: NodeId,
    pub addr: SocketAddr,
}
