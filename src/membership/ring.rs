//! Live ring arithmetic.
//!
//! The ring is kept as an ordered set of live node ids. Successor and
//! predecessor are computed over that set, so dead nodes are skipped without
//! any offset bookkeeping.

use std::collections::BTreeSet;

use super::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRing {
    members: BTreeSet<NodeId>,
}

impl LiveRing {
    /// A full ring of nodes `1..=size`.
    pub fn new(size: u64) -> Self {
        Self {
            members: (1..=size).map(NodeId).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Removes a node. Returns `false` if it was already gone.
    pub fn remove(&mut self, id: NodeId) -> bool {
        self.members.remove(&id)
    }

    /// Live ids in ring order.
    pub fn members(&self) -> Vec<NodeId> {
        self.members.iter().copied().collect()
    }

    /// The index is the highest live id.
    pub fn index_id(&self) -> Option<NodeId> {
        self.members.last().copied()
    }

    /// Next live id after `id`, wrapping around. `id` itself need not be live.
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        self.members
            .range(NodeId(id.0.saturating_add(1))..)
            .next()
            .or_else(|| self.members.first())
            .copied()
            .filter(|next| *next != id || self.members.len() == 1)
    }

    /// Previous live id before `id`, wrapping around.
    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        self.members
            .range(..id)
            .next_back()
            .or_else(|| self.members.last())
            .copied()
            .filter(|prev| *prev != id || self.members.len() == 1)
    }
}
