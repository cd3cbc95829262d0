//! Error types for the slot-routed cache client

use std::time::Duration;

use thiserror::Error;

use crate::cluster::Endpoint;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the store or managing cached values
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// Connecting to or talking with a node failed
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// No pooled connection became available within the wait budget
    #[error("Connection pool for {endpoint} exhausted after {waited_ms} ms")]
    PoolExhausted { endpoint: String, waited_ms: u64 },

    /// A socket read or write exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Cluster Dispatch Errors
    // =========================================================================
    /// Slot ownership changed permanently
    #[error("Slot {slot} moved to {endpoint}")]
    Moved { slot: u16, endpoint: Endpoint },

    /// Slot is being migrated; retry once against the importing node
    #[error("Slot {slot} is migrating, ask {endpoint}")]
    Ask { slot: u16, endpoint: Endpoint },

    /// Redirection reply that is neither MOVED nor ASK
    #[error("Unsupported redirection: {0}")]
    UnknownRedirection(String),

    /// Multi-key command whose keys hash to different slots
    #[error("No way to dispatch this command: keys hash to different slots")]
    CrossSlot,

    /// Command carries no key to route by
    #[error("No way to dispatch this command: no key")]
    NoDispatchKey,

    /// Redirection and retry budget exhausted
    #[error("Too many cluster redirections")]
    TooManyRedirections,

    /// Every known node refused a connection
    #[error("No reachable node in cluster")]
    NoReachableNode,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed bytes on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reply returned by the server (WRONGTYPE, ERR, ...)
    #[error("Server error: {0}")]
    Server(String),

    /// Reply had a shape the caller did not expect
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Value could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Refresh Errors
    // =========================================================================
    /// Producer returned an error while computing a value
    #[error("Producer failed: {0}")]
    Producer(String),

    /// Background refresh of a key failed
    #[error("Refresh failed for {key}: {reason}")]
    RefreshFailed { key: String, reason: String },

    /// No invoker registered for a producer
    #[error("No refresh invoker for {owner}.{method}")]
    InvokerNotFound { owner: String, method: String },

    /// Client or pool has been shut down
    #[error("Client has been shut down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failures that say nothing about slot ownership: the node could not be
    /// reached or did not answer in time.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection { .. } | Error::PoolExhausted { .. } | Error::Timeout(_)
        )
    }

    /// MOVED or ASK
    pub fn is_redirection(&self) -> bool {
        matches!(self, Error::Moved { .. } | Error::Ask { .. })
    }

    /// Errors caused by the caller, which quiet mode never swallows.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Error::CrossSlot)
    }

    pub(crate) fn connection(endpoint: impl ToString, reason: impl ToString) -> Self {
        Error::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}
