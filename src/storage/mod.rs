//! Fragment Storage Module
//!
//! Holds everything a node knows about file contents and where they live.
//!
//! ## Core Concepts
//! - **Local store**: `LocalStore` keeps, per file, at most R fragments this node owns.
//! - **Placement**: `PartitionManager` splits a file into fragments and assigns each
//!   one to R distinct live nodes, walking the live ring from the primary owner.
//! - **Catalogue**: the index keeps every placement (`FileCatalogue`) and the
//!   registered address of every peer (`PeerTable`) to route fanout and retrieval.

pub mod catalogue;
pub mod memory;
pub mod partitioner;
