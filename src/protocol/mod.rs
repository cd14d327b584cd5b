//! Wire Protocol Module
//!
//! Defines the binary messages exchanged between ring nodes and clients, and
//! the framed I/O used to move them over TCP.
//!
//! ## Core Concepts
//! - **Framing**: every packet and every bulk chunk carries a 2-byte length
//!   prefix, so message boundaries never depend on how reads are split.
//! - **Handshake**: multi-step exchanges are request -> OK/NOT_OK -> proceed.
//! - **Bulk transfer**: large buffers move as unacknowledged 4096-byte chunks
//!   and are checked against the declared size on arrival.

pub mod codec;
pub mod packet;

#[cfg(test)]
mod tests;
