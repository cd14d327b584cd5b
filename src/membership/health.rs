//! Failure detection on the backward link and ring healing decisions.
//!
//! Only the backward link is watched. A node learns about any other death
//! through a `PEER_IS_DEAD` notice travelling forward from the detector.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

use super::ring::LiveRing;
use super::types::NodeId;
use crate::error::RingError;
use crate::protocol::codec::poll_packet_counted;
use crate::protocol::packet::{Packet, PeerIsDead};

/// Result of one look at the backward link.
#[derive(Debug)]
pub enum Probe {
    Quiet,
    /// A packet and the number of bytes it took on the wire.
    Packet(Packet, usize),
    Closed(RingError),
}

/// Reads at most one packet from the backward link.
///
/// A frame that decodes badly but was read whole is skipped. A failure part
/// way through a frame leaves the stream misaligned, so the link counts as
/// closed.
pub async fn probe(stream: &mut TcpStream, wait: Duration, timeout: Duration) -> Probe {
    match poll_packet_counted(stream, wait, timeout).await {
        Ok(None) => Probe::Quiet,
        Ok(Some((packet, size))) => Probe::Packet(packet, size),
        Err(e @ (RingError::UnknownPacketType(_) | RingError::Codec(_))) => {
            tracing::warn!("Unreadable packet on backward link: {}", e);
            Probe::Quiet
        }
        Err(e) => Probe::Closed(e),
    }
}

/// What a node does with its forward link after applying a death.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    /// The death was already applied; the notice stops here.
    Ignore,
    /// Pass the notice to the forward peer.
    Relay,
    /// The forward peer is the dead node: redial its former successor.
    Rewire { successor: NodeId, addr: SocketAddr },
    /// The forward peer is dead and no other node is left to link to.
    Detach,
}

/// Applies a death detected on this node's own backward link.
///
/// Returns the notice to send forward, or `None` if the node was already
/// removed from the live ring.
pub fn detect(
    ring: &mut LiveRing,
    me: NodeId,
    addr: SocketAddr,
    dead: NodeId,
    forward: NodeId,
) -> Option<(PeerIsDead, HealAction)> {
    if !ring.remove(dead) {
        return None;
    }

    let notice = PeerIsDead {
        dead,
        successor: me,
        successor_addr: addr,
    };
    let action = if forward == dead {
        HealAction::Detach
    } else {
        HealAction::Relay
    };
    Some((notice, action))
}

/// Applies a death notice received from the backward peer.
pub fn apply_notice(ring: &mut LiveRing, me: NodeId, forward: NodeId, notice: &PeerIsDead) -> HealAction {
    if !ring.remove(notice.dead) {
        return HealAction::Ignore;
    }
    if forward != notice.dead {
        return HealAction::Relay;
    }
    if notice.successor == me {
        return HealAction::Detach;
    }
    HealAction::Rewire {
        successor: notice.successor,
        addr: notice.successor_addr,
    }
}
