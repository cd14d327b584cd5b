//! Fragment Ring Library
//!
//! A fixed-size ring of nodes that stores files by splitting them into
//! fragments and replicating each fragment on several nodes, coordinated by
//! one index node. The binary (`main.rs`) runs a single node.
//!
//! ## Architecture Modules
//! - **`protocol`**: Length-prefixed packets and chunked bulk transfers over TCP.
//! - **`membership`**: The live ring, index gossip and failure detection on the
//!   backward link.
//! - **`storage`**: Local fragment slots, the placement planner and the index's
//!   catalogue of files and peer addresses.
//! - **`node`**: The per-node state machine that sequences bootstrap, ingestion,
//!   fanout, retrieval and ring healing.
//! - **`client`**: Uploads and downloads against any ring member.

pub mod client;
pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod protocol;
pub mod storage;
