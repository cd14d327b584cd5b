//! Node State Machine Module
//!
//! Sequences everything a ring member does: linking the ring, learning the
//! index, ingesting and fanning out files, serving fragments and surviving
//! the death of its neighbours.
//!
//! ## Core Concepts
//! - **Single owner**: one task owns a [`Node`](machine::Node) and calls `tick`
//!   in a loop. Each tick does one bounded unit of work for the current state.
//! - **States as data**: every [`NodeState`](state::NodeState) variant carries
//!   only what that state needs, including resumption state for bulk transfers.
//! - **Bounded waits**: every socket wait is capped by the exchange timeout,
//!   and health checks run between bulk chunks so a stalled transfer cannot
//!   hide a dead peer.

pub mod fanout;
pub mod machine;
pub mod retrieval;
pub mod state;
pub mod transport;

#[cfg(test)]
mod tests;
