//! Packet Layout
//!
//! Every control message travels as one length-prefixed frame:
//!
//! ```text
//! [body_len:2 LE][sender_id:8 LE][type:1][payload:body_len-9]
//! ```
//!
//! The header is hand-encoded so the one-byte type tag stays stable on the
//! wire; payloads are fixed-shape records serialized with `bincode`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Result, RingError};
use crate::membership::types::NodeId;

/// Largest frame body (and bulk chunk) accepted on the wire.
pub const MAX_BODY_SIZE: usize = 4096;
/// Size of the length prefix in front of every frame and chunk.
pub const LENGTH_PREFIX_SIZE: usize = 2;
/// Sender id + type tag.
pub const HEADER_SIZE: usize = 9;
/// File names are limited like the fixed 256-byte field of the reference client.
pub const MAX_NAME_LEN: usize = 255;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    PresentItself = 1,
    PeerIsDead = 2,
    ReportSelf = 3,
    IndexPresentation = 4,
    RingAttach = 5,
    CreateFile = 10,
    StoreFragment = 11,
    RequestFile = 15,
    ResponseFile = 16,
    RequestFragment = 17,
    DeclareFragment = 18,
    DeclareUseLocal = 19,
    Ok = 200,
    NotOk = 220,
}

impl TryFrom<u8> for PacketKind {
    type Error = RingError;

    fn try_from(tag: u8) -> Result<Self> {
        let kind = match tag {
            1 => PacketKind::PresentItself,
            2 => PacketKind::PeerIsDead,
            3 => PacketKind::ReportSelf,
            4 => PacketKind::IndexPresentation,
            5 => PacketKind::RingAttach,
            10 => PacketKind::CreateFile,
            11 => PacketKind::StoreFragment,
            15 => PacketKind::RequestFile,
            16 => PacketKind::ResponseFile,
            17 => PacketKind::RequestFragment,
            18 => PacketKind::DeclareFragment,
            19 => PacketKind::DeclareUseLocal,
            200 => PacketKind::Ok,
            220 => PacketKind::NotOk,
            other => return Err(RingError::UnknownPacketType(other)),
        };
        Ok(kind)
    }
}

/// A node noticed its backward peer is gone.
///
/// `successor` is the dead node's former successor (the node that detected
/// the death); the dead node's predecessor redials it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIsDead {
    pub dead: NodeId,
    pub successor: NodeId,
    pub successor_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSelf {
    pub addr: SocketAddr,
    /// Highest file id the reporter holds a record for, 0 if none. A new
    /// index allocates above it.
    pub highest_file_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexPresentation {
    pub index_id: NodeId,
    pub index_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCreation {
    pub name: String,
    pub size: u64,
}

/// Header of a fragment pushed by the index during fanout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentStore {
    pub file_id: u64,
    pub name: String,
    pub file_size: u64,
    pub fragment_count: u32,
    pub fragment_id: u32,
    pub fragment_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileResponse {
    pub file_id: u64,
    pub size: u64,
    pub fragment_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentRequest {
    pub file_id: u64,
    pub fragment_id: u32,
    pub deliver_to: SocketAddr,
}

/// Header of a fragment pushed peer-to-peer during retrieval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentDeclaration {
    pub file_id: u64,
    pub fragment_id: u32,
    pub fragment_size: u64,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UseLocal {
    pub file_id: u64,
    pub fragment_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    PresentItself,
    PeerIsDead(PeerIsDead),
    ReportSelf(ReportSelf),
    IndexPresentation(IndexPresentation),
    RingAttach,
    CreateFile(FileCreation),
    StoreFragment(FragmentStore),
    RequestFile(FileRequest),
    ResponseFile(FileResponse),
    RequestFragment(FragmentRequest),
    DeclareFragment(FragmentDeclaration),
    DeclareUseLocal(UseLocal),
    Ok,
    NotOk,
}

impl PacketBody {
    pub fn kind(&self) -> PacketKind {
        match self {
            PacketBody::PresentItself => PacketKind::PresentItself,
            PacketBody::PeerIsDead(_) => PacketKind::PeerIsDead,
            PacketBody::ReportSelf(_) => PacketKind::ReportSelf,
            PacketBody::IndexPresentation(_) => PacketKind::IndexPresentation,
            PacketBody::RingAttach => PacketKind::RingAttach,
            PacketBody::CreateFile(_) => PacketKind::CreateFile,
            PacketBody::StoreFragment(_) => PacketKind::StoreFragment,
            PacketBody::RequestFile(_) => PacketKind::RequestFile,
            PacketBody::ResponseFile(_) => PacketKind::ResponseFile,
            PacketBody::RequestFragment(_) => PacketKind::RequestFragment,
            PacketBody::DeclareFragment(_) => PacketKind::DeclareFragment,
            PacketBody::DeclareUseLocal(_) => PacketKind::DeclareUseLocal,
            PacketBody::Ok => PacketKind::Ok,
            PacketBody::NotOk => PacketKind::NotOk,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            PacketBody::CreateFile(c) => Some(&c.name),
            PacketBody::StoreFragment(s) => Some(&s.name),
            PacketBody::RequestFile(r) => Some(&r.name),
            _ => None,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            PacketBody::PresentItself
            | PacketBody::RingAttach
            | PacketBody::Ok
            | PacketBody::NotOk => Vec::new(),
            PacketBody::PeerIsDead(p) => bincode::serialize(p)?,
            PacketBody::ReportSelf(p) => bincode::serialize(p)?,
            PacketBody::IndexPresentation(p) => bincode::serialize(p)?,
            PacketBody::CreateFile(p) => bincode::serialize(p)?,
            PacketBody::StoreFragment(p) => bincode::serialize(p)?,
            PacketBody::RequestFile(p) => bincode::serialize(p)?,
            PacketBody::ResponseFile(p) => bincode::serialize(p)?,
            PacketBody::RequestFragment(p) => bincode::serialize(p)?,
            PacketBody::DeclareFragment(p) => bincode::serialize(p)?,
            PacketBody::DeclareUseLocal(p) => bincode::serialize(p)?,
        };
        Ok(payload)
    }

    fn decode_payload(kind: PacketKind, payload: &[u8]) -> Result<Self> {
        let body = match kind {
            PacketKind::PresentItself => unit(payload, PacketBody::PresentItself)?,
            PacketKind::RingAttach => unit(payload, PacketBody::RingAttach)?,
            PacketKind::Ok => unit(payload, PacketBody::Ok)?,
            PacketKind::NotOk => unit(payload, PacketBody::NotOk)?,
            PacketKind::PeerIsDead => PacketBody::PeerIsDead(record(payload)?),
            PacketKind::ReportSelf => PacketBody::ReportSelf(record(payload)?),
            PacketKind::IndexPresentation => PacketBody::IndexPresentation(record(payload)?),
            PacketKind::CreateFile => PacketBody::CreateFile(record(payload)?),
            PacketKind::StoreFragment => PacketBody::StoreFragment(record(payload)?),
            PacketKind::RequestFile => PacketBody::RequestFile(record(payload)?),
            PacketKind::ResponseFile => PacketBody::ResponseFile(record(payload)?),
            PacketKind::RequestFragment => PacketBody::RequestFragment(record(payload)?),
            PacketKind::DeclareFragment => PacketBody::DeclareFragment(record(payload)?),
            PacketKind::DeclareUseLocal => PacketBody::DeclareUseLocal(record(payload)?),
        };
        Ok(body)
    }
}

fn unit(payload: &[u8], body: PacketBody) -> Result<PacketBody> {
    if !payload.is_empty() {
        return Err(RingError::ProtocolViolation(format!(
            "{:?} carries {} unexpected payload bytes",
            body.kind(),
            payload.len()
        )));
    }
    Ok(body)
}

fn record<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(RingError::ProtocolViolation(format!(
            "file name must be 1..={} bytes, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sender: NodeId,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(sender: NodeId, body: PacketBody) -> Self {
        Self { sender, body }
    }

    pub fn ok(sender: NodeId) -> Self {
        Self::new(sender, PacketBody::Ok)
    }

    pub fn not_ok(sender: NodeId) -> Self {
        Self::new(sender, PacketBody::NotOk)
    }

    pub fn present(sender: NodeId) -> Self {
        Self::new(sender, PacketBody::PresentItself)
    }

    pub fn kind(&self) -> PacketKind {
        self.body.kind()
    }

    /// Encodes the complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if let Some(name) = self.body.name() {
            check_name(name)?;
        }

        let payload = self.body.encode_payload()?;
        let body_len = HEADER_SIZE + payload.len();
        if body_len > MAX_BODY_SIZE {
            return Err(RingError::ProtocolViolation(format!(
                "{:?} packet body of {} bytes exceeds {}",
                self.kind(),
                body_len,
                MAX_BODY_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
        frame.extend_from_slice(&(body_len as u16).to_le_bytes());
        frame.extend_from_slice(&self.sender.0.to_le_bytes());
        frame.push(self.kind() as u8);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes a frame body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < HEADER_SIZE {
            return Err(RingError::ProtocolViolation(format!(
                "packet body too short: expected at least {}, got {}",
                HEADER_SIZE,
                body.len()
            )));
        }
        if body.len() > MAX_BODY_SIZE {
            return Err(RingError::ProtocolViolation(format!(
                "packet body too long: max {}, got {}",
                MAX_BODY_SIZE,
                body.len()
            )));
        }

        let mut sender = [0u8; 8];
        sender.copy_from_slice(&body[..8]);
        let sender = NodeId(u64::from_le_bytes(sender));
        let kind = PacketKind::try_from(body[8])?;
        let body = PacketBody::decode_payload(kind, &body[HEADER_SIZE..])?;

        if let Some(name) = body.name() {
            check_name(name)?;
        }

        Ok(Self { sender, body })
    }
}
