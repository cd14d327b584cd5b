//! Ring Membership Module
//!
//! Keeps a node's view of the ring: who is alive, who leads, and how the ring
//! closes again after a node disappears.
//!
//! ## Core Mechanisms
//! - **Live ring**: an ordered set of live ids. Successor, predecessor and the
//!   index (highest live id) are derived from it.
//! - **Index gossip**: the index announces itself to its forward peer and every
//!   node relays the announcement until the next hop would be the index.
//! - **Failure detection**: each node watches only its backward link. A closed
//!   link produces a `PEER_IS_DEAD` notice that travels forward until it reaches
//!   the dead node's predecessor, which redials the detector.

pub mod gossip;
pub mod health;
pub mod ring;
pub mod types;
