//! Error types shared by every ring subsystem.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::membership::types::NodeId;

/// Errors raised while driving ring exchanges, storing fragments or planning placements.
///
/// None of these are fatal to a node: the state machine logs them, aborts the
/// exchange that produced them and returns to `Idle`.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("handshake rejected by peer")]
    HandshakeRejected,

    #[error("connection failure: {0}")]
    ConnectionFailure(#[from] std::io::Error),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("integrity error: expected {expected} bytes, received {received}")]
    IntegrityError { expected: u64, received: u64 },

    #[error("placement exhausted: {live} live nodes, redundancy {redundancy}")]
    PlacementExhausted { live: usize, redundancy: usize },

    #[error("unknown file: {0}")]
    UnknownFile(String),

    #[error("unknown fragment {fragment_id} of file {file_id}")]
    UnknownFragment { file_id: u64, fragment_id: u32 },

    #[error("fragment {fragment_id} of file {file_id} already stored")]
    DuplicateFragment { file_id: u64, fragment_id: u32 },

    #[error("no free fragment slot for file {file_id} (capacity {capacity})")]
    SlotsExhausted { file_id: u64, capacity: usize },

    #[error("file id {file_id} already belongs to {held}")]
    FileIdConflict { file_id: u64, held: String },

    #[error("no address known for node {0}")]
    UnknownPeer(NodeId),

    #[error("could not allocate {0} bytes")]
    Allocation(u64),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl RingError {
    /// Errors a remote peer caused by sending something we cannot interpret.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RingError::ProtocolViolation(_) | RingError::UnknownPacketType(_) | RingError::Codec(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RingError>;
