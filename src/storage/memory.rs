use std::collections::BTreeMap;

use crate::error::{Result, RingError};

/// One fragment held by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFragment {
    pub fragment_id: u32,
    pub bytes: Vec<u8>,
}

impl StoredFragment {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Local view of a file: its metadata plus the fragments this node holds.
///
/// A node never holds more fragments of one file than the redundancy factor,
/// so the slot count is fixed at creation.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub name: String,
    pub file_id: u64,
    pub size: u64,
    pub fragment_count: u32,
    slots: Vec<Option<StoredFragment>>,
}

impl FileRecord {
    pub fn new(name: &str, file_id: u64, size: u64, fragment_count: u32, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            file_id,
            size,
            fragment_count,
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn describes(&self, name: &str, size: u64, fragment_count: u32) -> bool {
        self.name == name && self.size == size && self.fragment_count == fragment_count
    }

    /// Places a fragment in the first empty slot.
    ///
    /// Rejects fragment ids outside the file, fragments already held and
    /// inserts into a record whose slots are all taken.
    pub fn insert(&mut self, fragment_id: u32, bytes: Vec<u8>) -> Result<usize> {
        if fragment_id >= self.fragment_count {
            return Err(RingError::ProtocolViolation(format!(
                "fragment {} out of range for file {} with {} fragments",
                fragment_id, self.file_id, self.fragment_count
            )));
        }
        if self.fragment(fragment_id).is_some() {
            return Err(RingError::DuplicateFragment {
                file_id: self.file_id,
                fragment_id,
            });
        }

        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RingError::SlotsExhausted {
                file_id: self.file_id,
                capacity: self.slots.len(),
            })?;

        self.slots[slot] = Some(StoredFragment { fragment_id, bytes });
        Ok(slot)
    }

    pub fn fragment(&self, fragment_id: u32) -> Option<&StoredFragment> {
        self.fragments().find(|f| f.fragment_id == fragment_id)
    }

    pub fn fragments(&self) -> impl Iterator<Item = &StoredFragment> {
        self.slots.iter().flatten()
    }

    pub fn held_count(&self) -> usize {
        self.fragments().count()
    }
}

/// Per-node fragment store, keyed by file id.
pub struct LocalStore {
    redundancy: usize,
    files: BTreeMap<u64, FileRecord>,
}

impl LocalStore {
    pub fn new(redundancy: usize) -> Self {
        Self {
            redundancy,
            files: BTreeMap::new(),
        }
    }

    /// Returns the record for `file_id`, creating it on first reference.
    ///
    /// An existing record under the same id must describe the same file.
    pub fn ensure_file(
        &mut self,
        file_id: u64,
        name: &str,
        size: u64,
        fragment_count: u32,
    ) -> Result<&mut FileRecord> {
        let redundancy = self.redundancy;
        let record = self.files.entry(file_id).or_insert_with(|| {
            tracing::debug!("Created local record for file {} ({})", file_id, name);
            FileRecord::new(name, file_id, size, fragment_count, redundancy)
        });
        if !record.describes(name, size, fragment_count) {
            return Err(RingError::FileIdConflict {
                file_id,
                held: record.name.clone(),
            });
        }
        Ok(record)
    }

    pub fn store_fragment(&mut self, file_id: u64, fragment_id: u32, bytes: Vec<u8>) -> Result<usize> {
        let file = self
            .files
            .get_mut(&file_id)
            .ok_or_else(|| RingError::UnknownFile(file_id.to_string()))?;
        let size = bytes.len();
        let slot = file.insert(fragment_id, bytes)?;

        tracing::info!(
            "Stored fragment {} of file {} ({} bytes) in slot {}",
            fragment_id,
            file_id,
            size,
            slot
        );
        Ok(slot)
    }

    pub fn file(&self, file_id: u64) -> Option<&FileRecord> {
        self.files.get(&file_id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&FileRecord> {
        self.files.values().rev().find(|f| f.name == name)
    }

    pub fn fragment(&self, file_id: u64, fragment_id: u32) -> Result<&StoredFragment> {
        let file = self
            .files
            .get(&file_id)
            .ok_or_else(|| RingError::UnknownFile(file_id.to_string()))?;
        file.fragment(fragment_id).ok_or(RingError::UnknownFragment {
            file_id,
            fragment_id,
        })
    }

    pub fn holds(&self, file_id: u64, fragment_id: u32) -> bool {
        self.fragment(file_id, fragment_id).is_ok()
    }

    pub fn highest_file_id(&self) -> u64 {
        self.files.keys().next_back().copied().unwrap_or(0)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn fragment_total(&self) -> usize {
        self.files.values().map(FileRecord::held_count).sum()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }
}
