//! Index-side ingestion: plan a new file, answer the uploader, then deliver
//! the placement entries from a queue, one per tick.
//!
//! A failed delivery goes back to the end of the queue with a growing delay
//! and is dropped, with a warning, after [`MAX_PLACEMENT_ATTEMPTS`]. Between
//! two deliveries the index returns to `Idle`, so a peer that is itself
//! waiting on the index is never starved.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::machine::Node;
use super::state::{NodeState, PendingPlacement, Peer};
use super::transport::open_exchange;
use crate::error::{Result, RingError};
use crate::membership::types::NodeId;
use crate::protocol::codec::{expect_ok, write_bulk, write_packet};
use crate::protocol::packet::{FileResponse, FragmentStore, Packet, PacketBody};

pub const MAX_PLACEMENT_ATTEMPTS: u32 = 5;
const PLACEMENT_RETRY_MS: u64 = 50;

/// Delivers one fragment to `addr` as a fanout store.
pub async fn push_fragment(
    me: NodeId,
    addr: SocketAddr,
    header: FragmentStore,
    bytes: &[u8],
    timeout: Duration,
) -> Result<()> {
    let mut stream = open_exchange(me, addr, timeout).await?;
    let fragment_id = header.fragment_id;

    write_packet(&mut stream, &Packet::new(me, PacketBody::StoreFragment(header))).await?;
    expect_ok(&mut stream, timeout).await?;
    write_bulk(&mut stream, bytes).await?;
    expect_ok(&mut stream, timeout).await?;

    tracing::debug!("Pushed fragment {} ({} bytes) to {}", fragment_id, bytes.len(), addr);
    Ok(())
}

/// Delay before retry number `attempts`.
pub fn placement_backoff(attempts: u32) -> Duration {
    let jitter = rand::random::<u64>() % 20;
    Duration::from_millis((PLACEMENT_RETRY_MS << attempts.min(6)) + jitter)
}

impl Node {
    pub(super) async fn handle_new_file(
        &mut self,
        name: String,
        bytes: Vec<u8>,
        mut origin: Peer,
    ) -> NodeState {
        let me = self.config.id;
        let size = bytes.len() as u64;

        let Some(data) = self.index_data.as_mut() else {
            tracing::warn!("Node {} is not the index, cannot ingest {}", me, name);
            return self.reject(origin).await;
        };
        let file_id = data.catalogue.allocate_id();
        let placement = match self.partitioner.plan(file_id, &name, size, &self.ring) {
            Ok(placement) => placement,
            Err(e) => {
                tracing::warn!("Index {} cannot place {}: {}", me, name, e);
                return self.reject(origin).await;
            }
        };

        let response = FileResponse {
            file_id,
            size,
            fragment_count: placement.fragment_count,
        };
        tracing::info!(
            "Index {} ingested {} as file {} ({} bytes, {} fragments x {})",
            me,
            name,
            file_id,
            size,
            placement.fragment_count,
            self.partitioner.redundancy()
        );

        let file: Arc<[u8]> = bytes.into();
        let now = Instant::now();
        self.fanout
            .extend(placement.entries.iter().map(|entry| PendingPlacement {
                header: FragmentStore {
                    file_id,
                    name: name.clone(),
                    file_size: size,
                    fragment_count: placement.fragment_count,
                    fragment_id: entry.fragment_id,
                    fragment_size: entry.size,
                },
                entry: *entry,
                file: Arc::clone(&file),
                attempts: 0,
                not_before: now,
            }));
        data.catalogue.insert(placement);

        let reply = Packet::new(me, PacketBody::ResponseFile(response));
        match write_packet(&mut origin.stream, &reply).await {
            Ok(_) => self.repark(origin),
            Err(e) => tracing::warn!("Index {} lost uploader of {}: {}", me, name, e),
        }

        NodeState::IndexFanoutFragments
    }

    pub(super) fn placement_due(&self) -> bool {
        let now = Instant::now();
        self.fanout.iter().any(|pending| pending.is_due(now))
    }

    pub(super) async fn fanout_step(&mut self) -> NodeState {
        if let Some(next) = self.check_health(false).await {
            if !self.fanout.is_empty() {
                tracing::info!(
                    "Index {} pauses fanout with {} placements queued",
                    self.config.id,
                    self.fanout.len()
                );
            }
            return next;
        }

        let now = Instant::now();
        let Some(position) = self.fanout.iter().position(|pending| pending.is_due(now)) else {
            return NodeState::Idle;
        };
        let Some(mut pending) = self.fanout.remove(position) else {
            return NodeState::Idle;
        };

        let me = self.config.id;
        let (file_id, fragment_id, owner) =
            (pending.header.file_id, pending.entry.fragment_id, pending.entry.owner);

        match self.place_fragment(&pending).await {
            Ok(()) => {
                let left = self
                    .fanout
                    .iter()
                    .filter(|queued| queued.header.file_id == file_id)
                    .count();
                if left == 0 {
                    tracing::info!("Index {} finished fanout of file {}", me, file_id);
                }
            }
            Err(e) if !self.ring.contains(owner) => {
                tracing::warn!(
                    "Fragment {} of file {} dropped: owner {} left the ring ({})",
                    fragment_id,
                    file_id,
                    owner,
                    e
                );
            }
            Err(e) => {
                pending.attempts += 1;
                if pending.attempts >= MAX_PLACEMENT_ATTEMPTS {
                    tracing::error!(
                        "Fragment {} of file {} abandoned on {} after {} attempts: {}",
                        fragment_id,
                        file_id,
                        owner,
                        pending.attempts,
                        e
                    );
                } else {
                    tracing::warn!(
                        "Fragment {} of file {} not placed on {} (attempt {}): {}",
                        fragment_id,
                        file_id,
                        owner,
                        pending.attempts,
                        e
                    );
                    pending.not_before = Instant::now() + placement_backoff(pending.attempts);
                    self.fanout.push_back(pending);
                }
            }
        }

        NodeState::Idle
    }

    /// Forgets every queued placement, e.g. once this node stops being the
    /// index.
    pub(super) fn drop_fanout(&mut self) {
        if self.fanout.is_empty() {
            return;
        }
        let files: BTreeSet<u64> = self.fanout.iter().map(|p| p.header.file_id).collect();
        tracing::warn!(
            "Node {} abandoned {} queued placements of files {:?}",
            self.config.id,
            self.fanout.len(),
            files
        );
        self.fanout.clear();
    }

    async fn place_fragment(&mut self, pending: &PendingPlacement) -> Result<()> {
        let header = &pending.header;
        let entry = pending.entry;
        let slice = pending
            .file
            .get(entry.range())
            .ok_or(RingError::IntegrityError {
                expected: entry.offset + entry.size,
                received: pending.file.len() as u64,
            })?;

        if entry.owner == self.config.id {
            self.store.ensure_file(
                header.file_id,
                &header.name,
                header.file_size,
                header.fragment_count,
            )?;
            if self.store.holds(header.file_id, header.fragment_id) {
                return Ok(());
            }
            self.store
                .store_fragment(header.file_id, header.fragment_id, slice.to_vec())?;
            return Ok(());
        }

        let addr = self
            .peer_table()
            .and_then(|peers| peers.address(entry.owner))
            .ok_or(RingError::UnknownPeer(entry.owner))?;
        push_fragment(self.config.id, addr, header.clone(), slice, self.config.exchange_timeout).await
    }
}
