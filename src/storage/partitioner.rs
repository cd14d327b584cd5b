use std::ops::Range;

use crate::error::{Result, RingError};
use crate::membership::ring::LiveRing;
use crate::membership::types::NodeId;

/// One (fragment, owner) assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPlacement {
    pub fragment_id: u32,
    pub offset: u64,
    pub size: u64,
    pub owner: NodeId,
}

impl FragmentPlacement {
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// Where every copy of every fragment of a file lives.
///
/// `entries` is ordered by fragment, then by redundancy slot, and holds
/// `fragment_count * redundancy` items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePlacement {
    pub file_id: u64,
    pub name: String,
    pub size: u64,
    pub fragment_count: u32,
    pub entries: Vec<FragmentPlacement>,
}

impl FilePlacement {
    pub fn owners(&self, fragment_id: u32) -> impl Iterator<Item = NodeId> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.fragment_id == fragment_id)
            .map(|e| e.owner)
    }

    pub fn fragment(&self, fragment_id: u32) -> Option<&FragmentPlacement> {
        self.entries.iter().find(|e| e.fragment_id == fragment_id)
    }
}

/// Splits `size` bytes into `count` equal ranges; the last absorbs the remainder.
pub fn fragment_ranges(size: u64, count: u32) -> Vec<Range<u64>> {
    let count = count.max(1) as u64;
    let width = size / count;
    (0..count)
        .map(|i| {
            let start = i * width;
            let end = if i + 1 == count { size } else { start + width };
            start..end
        })
        .collect()
}

/// Owner of redundancy slot `slot` of fragment `fragment` over the live ring order.
pub fn owner_of(live: &[NodeId], fragment: usize, slot: usize) -> NodeId {
    live[(fragment + slot) % live.len()]
}

/// Computes fragment counts and owners for newly ingested files.
#[derive(Debug, Clone, Copy)]
pub struct PartitionManager {
    redundancy: usize,
    split_threshold: u64,
}

impl PartitionManager {
    pub fn new(redundancy: usize, split_threshold: u64) -> Self {
        Self {
            redundancy,
            split_threshold,
        }
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    pub fn fragment_count(&self, size: u64, live: usize) -> u32 {
        if size <= self.split_threshold || size <= live as u64 {
            1
        } else {
            live as u32
        }
    }

    pub fn plan(&self, file_id: u64, name: &str, size: u64, ring: &LiveRing) -> Result<FilePlacement> {
        let live = ring.members();
        if live.len() < self.redundancy || live.is_empty() {
            return Err(RingError::PlacementExhausted {
                live: live.len(),
                redundancy: self.redundancy,
            });
        }

        let fragment_count = self.fragment_count(size, live.len());
        let mut entries = Vec::with_capacity(fragment_count as usize * self.redundancy);

        for (i, range) in fragment_ranges(size, fragment_count).into_iter().enumerate() {
            for slot in 0..self.redundancy {
                let owner = owner_of(&live, i, slot);
                tracing::debug!("Fragment {} of file {} -> node {}", i, file_id, owner);
                entries.push(FragmentPlacement {
                    fragment_id: i as u32,
                    offset: range.start,
                    size: range.end - range.start,
                    owner,
                });
            }
        }

        Ok(FilePlacement {
            file_id,
            name: name.to_string(),
            size,
            fragment_count,
            entries,
        })
    }
}
