//! Key-value store capability
//!
//! A single [`KvStore`] trait covers every command the cache layer issues.
//! Three independent implementations are selected by [`Mode`]:
//!
//! - [`ClusterStore`]: slot routing with MOVED/ASK handling
//! - [`StandaloneStore`]: one pooled node
//! - [`SentinelStore`]: one pooled master located through sentinels
//!
//! Implementations only provide [`KvStore::run`]; the typed commands are
//! built on top of it. A `run` result of `Ok(None)` means the command was not
//! delivered and quiet mode suppressed the error, which the typed commands
//! report as "no data".

mod cluster;
mod registry;
mod sentinel;
mod standalone;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use crate::cluster::{Command, NodePool, Reply};
use crate::config::{ClientConfig, Mode};
use crate::error::{Error, Result};
use crate::transport::{Connector, TcpConnector};

pub use cluster::ClusterStore;
pub use registry::StoreRegistry;
pub use sentinel::SentinelStore;
pub use standalone::StandaloneStore;

// =============================================================================
// Store Trait
// =============================================================================

/// Commands the cache layer needs from a store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Deployment mode this store talks to
    fn mode(&self) -> Mode;

    /// Deliver a command.
    ///
    /// `Ok(None)` is only returned in quiet mode when delivery failed.
    async fn run(&self, command: Command) -> Result<Option<Reply>>;

    /// Close every pooled connection. Later commands fail with [`Error::Shutdown`].
    async fn close(&self);

    // -------------------------------------------------------------------------
    // Strings
    // -------------------------------------------------------------------------

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.run(Command::get(key)).await? {
            Some(reply) => reply.into_bytes(),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.run(Command::set(key, value)).await?;
        Ok(())
    }

    async fn setex(&self, key: &[u8], seconds: u64, value: &[u8]) -> Result<()> {
        self.run(Command::setex(key, seconds, value)).await?;
        Ok(())
    }

    /// Number of keys removed
    async fn del(&self, key: &[u8]) -> Result<i64> {
        int_or_zero(self.run(Command::del(key)).await?)
    }

    async fn incr(&self, key: &[u8]) -> Result<Option<i64>> {
        self.run(Command::incr(key))
            .await?
            .map(Reply::into_int)
            .transpose()
    }

    async fn decr(&self, key: &[u8]) -> Result<Option<i64>> {
        self.run(Command::decr(key))
            .await?
            .map(Reply::into_int)
            .transpose()
    }

    /// `true` when the key exists and its TTL was set
    async fn expire(&self, key: &[u8], seconds: u64) -> Result<bool> {
        Ok(int_or_zero(self.run(Command::expire(key, seconds)).await?)? == 1)
    }

    // -------------------------------------------------------------------------
    // Hashes
    // -------------------------------------------------------------------------

    async fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>> {
        match self.run(Command::hget(key, field)).await? {
            Some(reply) => reply.into_bytes(),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()> {
        self.run(Command::hset(key, field, value)).await?;
        Ok(())
    }

    async fn hdel(&self, key: &[u8], field: &[u8]) -> Result<i64> {
        int_or_zero(self.run(Command::hdel(key, field)).await?)
    }

    async fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let items = match self.run(Command::hgetall(key)).await? {
            Some(reply) => reply.into_bytes_vec()?,
            None => return Ok(Vec::new()),
        };
        if items.len() % 2 != 0 {
            return Err(Error::Protocol("HGETALL returned an odd number of items".into()));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((field, value));
        }
        Ok(pairs)
    }

    // -------------------------------------------------------------------------
    // Sorted sets
    // -------------------------------------------------------------------------

    async fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> Result<()> {
        self.run(Command::zadd(key, score, member)).await?;
        Ok(())
    }

    /// Members by rank, both ends inclusive
    async fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>> {
        match self.run(Command::zrange(key, start, stop)).await? {
            Some(reply) => reply.into_bytes_vec(),
            None => Ok(Vec::new()),
        }
    }

    async fn zrange_by_score(&self, key: &[u8], min: f64, max: f64) -> Result<Vec<Bytes>> {
        match self.run(Command::zrange_by_score(key, min, max)).await? {
            Some(reply) => reply.into_bytes_vec(),
            None => Ok(Vec::new()),
        }
    }

    async fn zrem(&self, key: &[u8], member: &[u8]) -> Result<i64> {
        int_or_zero(self.run(Command::zrem(key, member)).await?)
    }

    async fn zcard(&self, key: &[u8]) -> Result<u64> {
        Ok(int_or_zero(self.run(Command::zcard(key)).await?)?.max(0) as u64)
    }
}

fn int_or_zero(reply: Option<Reply>) -> Result<i64> {
    match reply {
        Some(reply) => reply.into_int(),
        None => Ok(0),
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Build the store selected by `config.mode` on top of `connector`
pub async fn connect(
    config: &ClientConfig,
    connector: Arc<dyn Connector>,
) -> Result<Arc<dyn KvStore>> {
    config.validate()?;
    let store: Arc<dyn KvStore> = match config.mode {
        Mode::Cluster => Arc::new(ClusterStore::connect(config, connector).await?),
        Mode::Standalone => Arc::new(StandaloneStore::new(config, connector)?),
        Mode::Sentinel => {
            Arc::new(SentinelStore::connect(config, connector.clone(), connector).await?)
        }
    };
    Ok(store)
}

/// Build the store selected by `config.mode` over TCP
pub async fn connect_tcp(config: &ClientConfig) -> Result<Arc<dyn KvStore>> {
    config.validate()?;
    let base = TcpConnector::new(config.connect_timeout(), config.socket_timeout())
        .with_password(config.connection.password.clone());
    let store: Arc<dyn KvStore> = match config.mode {
        // Cluster nodes only have database 0
        Mode::Cluster => Arc::new(ClusterStore::connect(config, Arc::new(base)).await?),
        Mode::Standalone => Arc::new(StandaloneStore::new(
            config,
            Arc::new(base.with_database(config.connection.database)),
        )?),
        Mode::Sentinel => {
            // Sentinels accept neither the data password nor SELECT
            let sentinel_connector =
                TcpConnector::new(config.connect_timeout(), config.socket_timeout());
            let master_connector = base.with_database(config.connection.database);
            Arc::new(
                SentinelStore::connect(
                    config,
                    Arc::new(master_connector),
                    Arc::new(sentinel_connector),
                )
                .await?,
            )
        }
    };
    Ok(store)
}

// =============================================================================
// Single-node delivery
// =============================================================================

/// Send one command through `pool` with no retries
pub(crate) async fn run_on_pool(pool: &Arc<NodePool>, command: &Command) -> Result<Reply> {
    let mut conn = pool.get().await?;
    let result = conn.execute(command).await;
    conn.release().await;
    result
}

/// Quiet mode turns connectivity failures into `Ok(None)`; server errors still surface
pub(crate) fn quiet_or(quiet: bool, command: &Command, e: Error) -> Result<Option<Reply>> {
    if quiet && (e.is_connection_failure() || matches!(e, Error::NoReachableNode)) {
        error!("Command {} failed (suppressed): {}", command, e);
        Ok(None)
    } else {
        Err(e)
    }
}
