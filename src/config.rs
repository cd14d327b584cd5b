//! Node Configuration
//!
//! Everything a node needs to know at process start: its own identity, its
//! successor in the ring and the size of the ring. Tunables default to the
//! constants below and can be overridden with the `with_*` builders.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::membership::types::NodeId;

/// Number of distinct nodes every fragment is copied to.
pub const DEFAULT_REDUNDANCY: usize = 2;
/// Files at or below this size are never split.
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 1024;

const TICK_INTERVAL: Duration = Duration::from_millis(1);
const HEALTH_INTERVAL: Duration = Duration::from_millis(250);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(2);
const RETRIEVAL_DEADLINE: Duration = Duration::from_secs(10);
const CHUNKS_PER_TICK: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("node id must be in 1..={network_size}, got {id}")]
    InvalidId { id: u64, network_size: u64 },

    #[error("successor id must be in 1..={network_size}, got {id}")]
    InvalidSuccessor { id: u64, network_size: u64 },

    #[error("node {0} cannot be its own successor in a ring of more than one node")]
    SelfSuccessor(u64),

    #[error("network size must be at least 1")]
    EmptyNetwork,

    #[error("redundancy must be in 1..={network_size}, got {redundancy}")]
    InvalidRedundancy { redundancy: usize, network_size: u64 },
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub successor_id: NodeId,
    pub successor_addr: SocketAddr,
    pub network_size: u64,

    pub redundancy: usize,
    pub split_threshold: u64,
    pub tick_interval: Duration,
    pub health_interval: Duration,
    pub exchange_timeout: Duration,
    pub accept_poll: Duration,
    pub retrieval_deadline: Duration,
    pub chunks_per_tick: usize,
}

impl NodeConfig {
    pub fn new(
        id: NodeId,
        addr: SocketAddr,
        successor_id: NodeId,
        successor_addr: SocketAddr,
        network_size: u64,
    ) -> Self {
        Self {
            id,
            addr,
            successor_id,
            successor_addr,
            network_size,
            redundancy: DEFAULT_REDUNDANCY,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            tick_interval: TICK_INTERVAL,
            health_interval: HEALTH_INTERVAL,
            exchange_timeout: EXCHANGE_TIMEOUT,
            accept_poll: ACCEPT_POLL,
            retrieval_deadline: RETRIEVAL_DEADLINE,
            chunks_per_tick: CHUNKS_PER_TICK,
        }
    }

    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn with_split_threshold(mut self, threshold: u64) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// The node whose id equals the configured network size leads at boot.
    pub fn is_boot_index(&self) -> bool {
        self.id.0 == self.network_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let network_size = self.network_size;
        if network_size == 0 {
            return Err(ConfigError::EmptyNetwork);
        }
        if self.id.0 == 0 || self.id.0 > network_size {
            return Err(ConfigError::InvalidId {
                id: self.id.0,
                network_size,
            });
        }
        if self.successor_id.0 == 0 || self.successor_id.0 > network_size {
            return Err(ConfigError::InvalidSuccessor {
                id: self.successor_id.0,
                network_size,
            });
        }
        if network_size > 1 && self.successor_id == self.id {
            return Err(ConfigError::SelfSuccessor(self.id.0));
        }
        if self.redundancy == 0 || self.redundancy as u64 > network_size {
            return Err(ConfigError::InvalidRedundancy {
                redundancy: self.redundancy,
                network_size,
            });
        }
        Ok(())
    }
}
