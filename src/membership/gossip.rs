//! Index discovery by ring relay and peer registration.

use super::types::{IndexLink, NodeId};
use crate::protocol::packet::{IndexPresentation, Packet, PacketBody, ReportSelf};
use std::net::SocketAddr;

/// The packet the index sends to its forward peer to announce itself.
pub fn presentation(index: IndexLink) -> Packet {
    Packet::new(
        index.id,
        PacketBody::IndexPresentation(IndexPresentation {
            index_id: index.id,
            index_addr: index.addr,
        }),
    )
}

/// A presentation is relayed onward unless the next hop is the index itself,
/// which stops the message after N-1 hops.
pub fn should_relay(forward: NodeId, index: NodeId) -> bool {
    forward != index
}

pub fn report(me: NodeId, addr: SocketAddr, highest_file_id: u64) -> Packet {
    Packet::new(
        me,
        PacketBody::ReportSelf(ReportSelf {
            addr,
            highest_file_id,
        }),
    )
}

/// The index is ready once every other live node has registered.
pub fn registrations_complete(known: usize, live: usize) -> bool {
    known + 1 >= live
}
