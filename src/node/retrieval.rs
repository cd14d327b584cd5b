//! File retrieval.
//!
//! The node a client asks (the collector) learns from the index which
//! fragments it already holds. The index then has one live owner push each
//! remaining fragment straight to the collector, which reassembles the file
//! and answers the client.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::machine::Node;
use super::state::{Collection, NodeState, Peer};
use super::transport::{accept_within, greet, open_exchange, refuse};
use crate::error::{Result, RingError};
use crate::membership::types::NodeId;
use crate::protocol::codec::{
    allocate, expect_ok, read_bulk, read_packet, verify_length, write_bulk, write_packet,
};
use crate::protocol::packet::{
    FileRequest, FileResponse, FragmentDeclaration, FragmentRequest, Packet, PacketBody, UseLocal,
};
use crate::storage::partitioner::FilePlacement;

/// Pushes one fragment to a collector.
pub async fn push_declared(
    me: NodeId,
    addr: SocketAddr,
    declaration: FragmentDeclaration,
    bytes: &[u8],
    timeout: Duration,
) -> Result<()> {
    let mut stream = open_exchange(me, addr, timeout).await?;
    write_packet(&mut stream, &Packet::new(me, PacketBody::DeclareFragment(declaration))).await?;
    expect_ok(&mut stream, timeout).await?;
    write_bulk(&mut stream, bytes).await?;
    expect_ok(&mut stream, timeout).await?;
    Ok(())
}

/// Concatenates collected fragments in id order.
pub fn assemble(parts: BTreeMap<u32, Vec<u8>>, file_id: u64, size: u64, fragment_count: u32) -> Result<Vec<u8>> {
    if let Some(missing) = (0..fragment_count).find(|id| !parts.contains_key(id)) {
        return Err(RingError::UnknownFragment {
            file_id,
            fragment_id: missing,
        });
    }

    let mut bytes = allocate(size)?;
    for part in parts.into_values() {
        bytes.extend_from_slice(&part);
    }
    verify_length(size, bytes.len() as u64)?;
    Ok(bytes)
}

impl Node {
    pub(super) async fn begin_retrieval(&mut self, request: FileRequest, mut peer: Peer) -> NodeState {
        let me = self.config.id;
        match (self.is_index(), peer.is_client()) {
            (true, false) => {
                if let Err(e) = self.serve_lookup(&request, peer.id, &mut peer.stream).await {
                    tracing::warn!("Index {} lookup of {} for {} failed: {}", me, request.name, peer.id, e);
                    refuse(me, &mut peer.stream).await;
                }
                NodeState::Idle
            }
            (true, true) => self.lookup_at_index(request, peer).await,
            (false, true) => match self.query_index(&request).await {
                Ok((response, local)) => {
                    NodeState::CollectingFragments(self.start_collection(request.name, response, local, peer))
                }
                Err(e) => {
                    tracing::warn!("Node {} cannot locate {}: {}", me, request.name, e);
                    self.reject(peer).await
                }
            },
            (false, false) => {
                tracing::warn!("Node {} is not the index, refusing lookup from {}", me, peer.id);
                self.reject(peer).await
            }
        }
    }

    /// Collector side of a lookup when the collector is not the index.
    async fn query_index(&self, request: &FileRequest) -> Result<(FileResponse, Vec<u32>)> {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;
        let index = self
            .index
            .ok_or_else(|| RingError::ProtocolViolation("index not known yet".to_string()))?;

        let mut stream = open_exchange(me, index.addr, timeout).await?;
        write_packet(&mut stream, &Packet::new(me, PacketBody::RequestFile(request.clone()))).await?;

        let response = match read_packet(&mut stream, timeout).await?.body {
            PacketBody::ResponseFile(response) => response,
            PacketBody::NotOk => return Err(RingError::UnknownFile(request.name.clone())),
            other => {
                return Err(RingError::ProtocolViolation(format!(
                    "expected RESPONSE_FILE, got {:?}",
                    other.kind()
                )));
            }
        };

        let mut local = Vec::new();
        loop {
            match read_packet(&mut stream, timeout).await?.body {
                PacketBody::DeclareUseLocal(use_local) if use_local.file_id == response.file_id => {
                    local.push(use_local.fragment_id)
                }
                PacketBody::Ok => break,
                other => {
                    return Err(RingError::ProtocolViolation(format!(
                        "unexpected {:?} in lookup reply",
                        other.kind()
                    )));
                }
            }
        }
        Ok((response, local))
    }

    /// Index side of a lookup forwarded by `requester`.
    async fn serve_lookup(&self, request: &FileRequest, requester: NodeId, stream: &mut TcpStream) -> Result<()> {
        let me = self.config.id;
        let placement = self
            .catalogue()
            .and_then(|catalogue| catalogue.find_by_name(&request.name))
            .cloned()
            .ok_or_else(|| RingError::UnknownFile(request.name.clone()))?;
        let deliver_to = self
            .peer_table()
            .and_then(|peers| peers.address(requester))
            .ok_or(RingError::UnknownPeer(requester))?;

        let response = response_for(&placement);
        write_packet(stream, &Packet::new(me, PacketBody::ResponseFile(response))).await?;

        let mut remote = Vec::new();
        for fragment_id in 0..placement.fragment_count {
            if placement.owners(fragment_id).any(|owner| owner == requester) {
                let use_local = UseLocal {
                    file_id: placement.file_id,
                    fragment_id,
                };
                write_packet(stream, &Packet::new(me, PacketBody::DeclareUseLocal(use_local))).await?;
            } else {
                remote.push(fragment_id);
            }
        }
        write_packet(stream, &Packet::ok(me)).await?;

        for fragment_id in remote {
            if let Err(e) = self.route_fragment(&placement, fragment_id, deliver_to).await {
                tracing::warn!(
                    "Index {} could not route fragment {} of {}: {}",
                    me,
                    fragment_id,
                    placement.name,
                    e
                );
            }
        }
        Ok(())
    }

    /// Lookup for a client connected to the index itself.
    async fn lookup_at_index(&mut self, request: FileRequest, client: Peer) -> NodeState {
        let me = self.config.id;
        let placement = self
            .catalogue()
            .and_then(|catalogue| catalogue.find_by_name(&request.name))
            .cloned();
        let Some(placement) = placement else {
            tracing::warn!("Index {} has no file named {}", me, request.name);
            return self.reject(client).await;
        };

        let (local, remote): (Vec<u32>, Vec<u32>) = (0..placement.fragment_count)
            .partition(|fragment_id| self.store.holds(placement.file_id, *fragment_id));

        let mut collection = self.start_collection(request.name, response_for(&placement), local, client);
        collection.unrouted = remote.into();
        NodeState::CollectingFragments(collection)
    }

    /// Requests the next unrouted fragment once the previous one has arrived,
    /// so an owner of several fragments is never asked again while its push
    /// to this node is still waiting to be accepted.
    async fn route_next(&mut self, collection: &mut Collection) {
        if let Some(fragment_id) = collection.awaiting
            && !collection.parts.contains_key(&fragment_id)
        {
            return;
        }
        collection.awaiting = None;

        let Some(fragment_id) = collection.unrouted.pop_front() else {
            return;
        };
        let placement = self
            .catalogue()
            .and_then(|catalogue| catalogue.get(collection.file_id))
            .cloned();
        let routed = match placement {
            Some(placement) => self.route_fragment(&placement, fragment_id, self.config.addr).await,
            None => Err(RingError::UnknownFile(collection.name.clone())),
        };
        match routed {
            Ok(()) => collection.awaiting = Some(fragment_id),
            Err(e) => tracing::warn!(
                "Index {} could not route fragment {}: {}",
                self.config.id,
                fragment_id,
                e
            ),
        }
    }

    /// Has the first live owner of a fragment push it to `deliver_to`.
    async fn route_fragment(&self, placement: &FilePlacement, fragment_id: u32, deliver_to: SocketAddr) -> Result<()> {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;
        let owner = placement
            .owners(fragment_id)
            .find(|owner| self.ring.contains(*owner))
            .ok_or(RingError::UnknownFragment {
                file_id: placement.file_id,
                fragment_id,
            })?;

        if owner == me {
            let fragment = self.store.fragment(placement.file_id, fragment_id)?;
            let declaration = FragmentDeclaration {
                file_id: placement.file_id,
                fragment_id,
                fragment_size: fragment.size(),
                file_size: placement.size,
            };
            return push_declared(me, deliver_to, declaration, &fragment.bytes, timeout).await;
        }

        let addr = self
            .peer_table()
            .and_then(|peers| peers.address(owner))
            .ok_or(RingError::UnknownPeer(owner))?;
        let request = FragmentRequest {
            file_id: placement.file_id,
            fragment_id,
            deliver_to,
        };

        let mut stream = open_exchange(me, addr, timeout).await?;
        write_packet(&mut stream, &Packet::new(me, PacketBody::RequestFragment(request))).await?;
        expect_ok(&mut stream, timeout).await?;
        tracing::debug!("Index {} asked {} for fragment {}", me, owner, fragment_id);
        Ok(())
    }

    /// Owner side: acknowledge the index, then push the fragment.
    pub(super) async fn serve_fragment_request(&self, request: FragmentRequest, mut peer: Peer) {
        let me = self.config.id;
        let file_size = self.store.file(request.file_id).map(|record| record.size);
        let fragment = match (self.store.fragment(request.file_id, request.fragment_id), file_size) {
            (Ok(fragment), Some(file_size)) => (fragment, file_size),
            (Err(e), _) => {
                tracing::warn!("Node {} cannot serve fragment: {}", me, e);
                refuse(me, &mut peer.stream).await;
                return;
            }
            (Ok(_), None) => {
                refuse(me, &mut peer.stream).await;
                return;
            }
        };
        if let Err(e) = write_packet(&mut peer.stream, &Packet::ok(me)).await {
            tracing::warn!("Node {} lost the index while serving a fragment: {}", me, e);
            return;
        }
        drop(peer);

        let (fragment, file_size) = fragment;
        let declaration = FragmentDeclaration {
            file_id: request.file_id,
            fragment_id: request.fragment_id,
            fragment_size: fragment.size(),
            file_size,
        };
        match push_declared(me, request.deliver_to, declaration, &fragment.bytes, self.config.exchange_timeout).await {
            Ok(()) => tracing::debug!(
                "Node {} delivered fragment {} of file {} to {}",
                me,
                request.fragment_id,
                request.file_id,
                request.deliver_to
            ),
            Err(e) => tracing::warn!("Node {} could not deliver fragment {}: {}", me, request.fragment_id, e),
        }
    }

    fn start_collection(&self, name: String, response: FileResponse, local: Vec<u32>, client: Peer) -> Collection {
        let mut parts = BTreeMap::new();
        for fragment_id in local {
            match self.store.fragment(response.file_id, fragment_id) {
                Ok(fragment) => {
                    parts.insert(fragment_id, fragment.bytes.clone());
                }
                Err(e) => tracing::warn!("Node {} lost a local fragment: {}", self.config.id, e),
            }
        }
        tracing::info!(
            "Node {} collecting {} ({} of {} fragments local)",
            self.config.id,
            name,
            parts.len(),
            response.fragment_count
        );

        Collection {
            name,
            file_id: response.file_id,
            size: response.size,
            fragment_count: response.fragment_count,
            parts,
            unrouted: VecDeque::new(),
            awaiting: None,
            client,
            deadline: Instant::now() + self.config.retrieval_deadline,
        }
    }

    pub(super) async fn collect_step(&mut self, mut collection: Collection) -> NodeState {
        if let Some(next) = self.check_health(false).await {
            tracing::warn!(
                "Node {} abandoned retrieval of {}: ring changed",
                self.config.id,
                collection.name
            );
            refuse(self.config.id, &mut collection.client.stream).await;
            self.repark(collection.client);
            return next;
        }
        if collection.parts.len() as u32 >= collection.fragment_count {
            return self.deliver(collection).await;
        }
        if Instant::now() >= collection.deadline {
            tracing::warn!(
                "Node {} gave up on {}: {} of {} fragments arrived",
                self.config.id,
                collection.name,
                collection.parts.len(),
                collection.fragment_count
            );
            return self.reject(collection.client).await;
        }

        self.route_next(&mut collection).await;
        match accept_within(&self.listener, self.config.accept_poll).await {
            Ok(Some(stream)) => {
                if let Err(e) = self.accept_push(&mut collection, stream).await {
                    tracing::warn!("Node {} rejected a push: {}", self.config.id, e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Node {} accept failed: {}", self.config.id, e),
        }

        if collection.parts.len() as u32 >= collection.fragment_count {
            return self.deliver(collection).await;
        }
        NodeState::CollectingFragments(collection)
    }

    async fn accept_push(&mut self, collection: &mut Collection, stream: TcpStream) -> Result<()> {
        let me = self.config.id;
        let timeout = self.config.exchange_timeout;
        let mut peer = greet(me, stream, timeout).await?;
        if peer.is_client() {
            self.parked.push(peer);
            return Ok(());
        }

        let packet = read_packet(&mut peer.stream, timeout).await?;
        match packet.body {
            PacketBody::DeclareFragment(declaration)
                if declaration.file_id == collection.file_id
                    && declaration.fragment_id < collection.fragment_count
                    && !collection.parts.contains_key(&declaration.fragment_id) =>
            {
                write_packet(&mut peer.stream, &Packet::ok(me)).await?;
                let bytes = read_bulk(&mut peer.stream, declaration.fragment_size, timeout).await?;
                write_packet(&mut peer.stream, &Packet::ok(me)).await?;
                tracing::debug!(
                    "Node {} collected fragment {} of {} from {}",
                    me,
                    declaration.fragment_id,
                    collection.name,
                    packet.sender
                );
                collection.parts.insert(declaration.fragment_id, bytes);
                Ok(())
            }
            PacketBody::RingAttach => self.adopt_backward(peer).await,
            other => {
                refuse(me, &mut peer.stream).await;
                Err(RingError::ProtocolViolation(format!(
                    "{:?} while collecting {}",
                    other.kind(),
                    collection.name
                )))
            }
        }
    }

    async fn deliver(&mut self, collection: Collection) -> NodeState {
        let me = self.config.id;
        let Collection {
            name,
            file_id,
            size,
            fragment_count,
            parts,
            mut client,
            ..
        } = collection;

        let bytes = match assemble(parts, file_id, size, fragment_count) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Node {} could not reassemble {}: {}", me, name, e);
                return self.reject(client).await;
            }
        };

        let response = FileResponse {
            file_id,
            size,
            fragment_count,
        };
        let mut sent = write_packet(&mut client.stream, &Packet::new(me, PacketBody::ResponseFile(response))).await;
        if sent.is_ok() {
            sent = write_bulk(&mut client.stream, &bytes).await;
        }

        match sent {
            Ok(_) => {
                tracing::info!("Node {} delivered {} ({} bytes)", me, name, size);
                self.repark(client);
            }
            Err(e) => tracing::warn!("Node {} lost the client for {}: {}", me, name, e),
        }
        NodeState::Idle
    }
}

fn response_for(placement: &FilePlacement) -> FileResponse {
    FileResponse {
        file_id: placement.file_id,
        size: placement.size,
        fragment_count: placement.fragment_count,
    }
}
