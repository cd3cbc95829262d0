//! Cluster routing
//!
//! Everything needed to deliver a command to the node that owns its key:
//!
//! - [`slot`] - CRC16 key to slot hashing with hash-tag support
//! - [`endpoint`] - Node addresses
//! - [`command`] - Command builder and reply model
//! - [`pool`] - Bounded per-node connection pools
//! - [`topology`] - Slot map with single-flight rediscovery
//! - [`executor`] - Retry loop handling MOVED/ASK and connection failures

pub mod command;
pub mod endpoint;
pub mod executor;
pub mod pool;
pub mod slot;
pub mod topology;

pub use command::{Command, Reply};
pub use endpoint::Endpoint;
pub use executor::CommandExecutor;
pub use pool::{NodePool, PoolConfig, PoolStats, PooledConnection};
pub use slot::{hash_slot, SLOT_COUNT};
pub use topology::{SlotRange, SlotRoute, TopologyCache};
