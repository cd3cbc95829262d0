//! Managed Cache Layer
//!
//! Typed, namespaced caching on top of a [`KvStore`](crate::store::KvStore).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          ManagedCache                             │
//! │   get / put / del / cached_call / refresh / clear_region          │
//! ├──────────────────────┬──────────────────────┬─────────────────────┤
//! │    EnvelopeCodec     │     RegionIndex      │   RefreshRegistry   │
//! │  flag byte + JSON    │  side record + zset  │  name / class  ->   │
//! │  deflate / lz4       │  + region catalog    │  Producer           │
//! ├──────────────────────┴──────────────────────┴─────────────────────┤
//! │          BatchRunner (inline or bounded fan-out, timeouts)        │
//! └───────────────────────────────────────────────────────────────────┘
//!                RefreshScheduler drives refresh_region
//! ```
//!
//! # Storage Layout
//!
//! With namespace `ns` (no prefix when empty):
//!
//! - `ns:key` - encoded envelope, or a hash whose fields hold envelopes
//! - `ns:$KEY:key[:field]` - side record naming the producer and its arguments
//! - `ns:Class:method` - sorted set of region members scored by expiry (ms)
//! - `ns:REGIONS` - catalog hash of region key to refresh flag and TTL

pub mod batch;
pub mod codec;
pub mod compression;
pub mod context;
pub mod envelope;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod refresh;
pub mod region;
pub mod scheduler;

mod proptest;

pub use batch::{BatchReport, BatchRunner};
pub use codec::EnvelopeCodec;
pub use compression::{CompressionAlgorithm, CompressionConfig};
pub use context::RequestContext;
pub use envelope::{now_ms, CacheEnvelope};
pub use key::CacheKey;
pub use manager::{ManagedCache, RefreshOutcome};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use refresh::{producer_fn, Producer, ProducerResolver, RefreshRegistry};
pub use region::{ProducerId, RegionEntry, RegionIndex, RegionPage, RegionSummary, SideRecord};
pub use scheduler::RefreshScheduler;
