//! Transport layer
//!
//! Abstracts a single connection to a store node. The cluster layer only
//! ever speaks [`Command`]/[`Reply`] through these traits, so the TCP client
//! and the in-memory cluster used by tests are interchangeable.
//!
//! - [`tcp`] - RESP2 over TCP
//! - [`memory`] - In-process cluster simulator with failure injection
//! - [`resp`] - Wire framing

pub mod memory;
pub mod resp;
pub mod tcp;

use async_trait::async_trait;

use crate::cluster::{Command, Endpoint, Reply};
use crate::error::Result;

pub use memory::{InMemoryCluster, InMemoryConnector};
pub use tcp::TcpConnector;

/// One open connection to a node
#[async_trait]
pub trait Connection: Send {
    /// Node this connection talks to
    fn endpoint(&self) -> &Endpoint;

    /// Send a command and read its reply.
    ///
    /// Error replies come back as [`Reply::Error`]; only transport failures
    /// are returned as `Err`.
    async fn send(&mut self, command: &Command) -> Result<Reply>;

    /// True once a transport failure left the connection unusable
    fn is_broken(&self) -> bool;

    /// Send a command and convert error replies (including redirections) into errors
    async fn execute(&mut self, command: &Command) -> Result<Reply> {
        self.send(command).await?.into_result()
    }

    /// Liveness probe
    async fn ping(&mut self) -> bool {
        matches!(self.execute(&Command::ping()).await, Ok(ref r) if r.is_ok_status())
    }
}

/// Opens connections to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>>;
}
