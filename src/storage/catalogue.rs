//! Index-only bookkeeping: registered peer addresses and the placement of
//! every ingested file.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use super::partitioner::FilePlacement;
use crate::membership::types::NodeId;

/// Last known address of every ring member, indexed by node id.
#[derive(Debug, Clone)]
pub struct PeerTable {
    addrs: Vec<Option<SocketAddr>>,
}

impl PeerTable {
    pub fn new(network_size: u64) -> Self {
        Self {
            addrs: vec![None; network_size as usize],
        }
    }

    fn slot(&self, id: NodeId) -> Option<usize> {
        let idx = id.0.checked_sub(1)? as usize;
        (idx < self.addrs.len()).then_some(idx)
    }

    /// Records `addr` for `id`. Returns `true` if the node was not known before,
    /// `None` if the id is outside the ring.
    pub fn register(&mut self, id: NodeId, addr: SocketAddr) -> Option<bool> {
        let idx = self.slot(id)?;
        let fresh = self.addrs[idx].is_none();
        self.addrs[idx] = Some(addr);
        Some(fresh)
    }

    pub fn address(&self, id: NodeId) -> Option<SocketAddr> {
        self.slot(id).and_then(|idx| self.addrs[idx])
    }

    pub fn clear(&mut self, id: NodeId) -> Option<SocketAddr> {
        let idx = self.slot(id)?;
        self.addrs[idx].take()
    }

    pub fn known(&self) -> usize {
        self.addrs.iter().filter(|a| a.is_some()).count()
    }
}

/// Placements of every file ingested through this index, in ingestion order.
#[derive(Debug, Default)]
pub struct FileCatalogue {
    next_id: u64,
    files: BTreeMap<u64, FilePlacement>,
}

impl FileCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids are never reused, and stay above every id passed to [`observe`].
    ///
    /// [`observe`]: FileCatalogue::observe
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Records that `file_id` is already in use somewhere in the ring, e.g.
    /// handed out by an index that has since died.
    pub fn observe(&mut self, file_id: u64) {
        self.next_id = self.next_id.max(file_id);
    }

    pub fn insert(&mut self, placement: FilePlacement) {
        self.files.insert(placement.file_id, placement);
    }

    pub fn get(&self, file_id: u64) -> Option<&FilePlacement> {
        self.files.get(&file_id)
    }

    /// The most recently ingested file with this name.
    pub fn find_by_name(&self, name: &str) -> Option<&FilePlacement> {
        self.files.values().rev().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// State only the index keeps.
#[derive(Debug)]
pub struct IndexData {
    pub peers: PeerTable,
    pub catalogue: FileCatalogue,
}

impl IndexData {
    pub fn new(network_size: u64) -> Self {
        Self {
            peers: PeerTable::new(network_size),
            catalogue: FileCatalogue::new(),
        }
    }
}
