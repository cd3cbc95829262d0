//! slotcache - Cluster-Aware Caching Client
//!
//! A client for sharded key-value clusters plus a managed cache built on top
//! of it. Commands are routed to the node owning the key's hash slot, follow
//! MOVED/ASK redirections, and fail over to fresh topology when nodes vanish.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ ManagedCache  (envelopes, regions, refresh, batch clear)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ KvStore       ClusterStore │ StandaloneStore │ SentinelStore    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ CommandExecutor ──▶ TopologyCache ──▶ NodePool (per endpoint)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Connector / Connection   (RESP over TCP, or in-memory cluster)  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Managed cache, region index, refresh and batch work
//! - [`cluster`] - Slot hashing, pools, topology and the redirect loop
//! - [`config`] - YAML client configuration
//! - [`error`] - Error types
//! - [`store`] - Cluster, standalone and sentinel stores
//! - [`transport`] - Connections: TCP and an in-memory simulator

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheEnvelope, CacheKey, ManagedCache, ProducerId, RefreshRegistry};
pub use config::{ClientConfig, Mode};
pub use error::{Error, Result};
pub use store::{connect, connect_tcp, KvStore, StoreRegistry};
