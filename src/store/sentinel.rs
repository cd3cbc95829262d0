//! Sentinel-managed store
//!
//! The master address is looked up from the sentinels at startup. When the
//! master stops answering, the sentinels are asked again; if they name a new
//! master the pool is swapped and the command is retried once.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{quiet_or, run_on_pool, KvStore};
use crate::cluster::{Command, Endpoint, NodePool, PoolConfig, Reply};
use crate::config::{ClientConfig, Mode};
use crate::error::{Error, Result};
use crate::transport::Connector;

/// Store backed by the current master of a sentinel group
pub struct SentinelStore {
    master_name: String,
    sentinels: Vec<Endpoint>,
    sentinel_connector: Arc<dyn Connector>,
    master_connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    master: RwLock<Arc<NodePool>>,
    quiet: bool,
    shutdown: CancellationToken,
}

impl SentinelStore {
    pub async fn connect(
        config: &ClientConfig,
        master_connector: Arc<dyn Connector>,
        sentinel_connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let sentinels = config.sentinel_endpoints()?;
        let master_name = config.sentinel.master_name.clone();
        let address = resolve_master(&sentinel_connector, &sentinels, &master_name).await?;
        info!("Sentinel master '{}' is {}", master_name, address);

        let shutdown = CancellationToken::new();
        let pool_config = config.pool_config();
        let pool = NodePool::new(address, master_connector.clone(), pool_config.clone(), false);
        pool.spawn_evictor(shutdown.child_token());

        Ok(Self {
            master_name,
            sentinels,
            sentinel_connector,
            master_connector,
            pool_config,
            master: RwLock::new(pool),
            quiet: config.connection.quiet,
            shutdown,
        })
    }

    pub fn master(&self) -> Endpoint {
        self.master.read().endpoint().clone()
    }

    /// Ask the sentinels again and swap pools if the master changed.
    ///
    /// Returns `true` when a new master was installed.
    pub async fn failover(&self) -> Result<bool> {
        let address =
            resolve_master(&self.sentinel_connector, &self.sentinels, &self.master_name).await?;
        let old = {
            let mut master = self.master.write();
            if *master.endpoint() == address {
                return Ok(false);
            }
            let pool = NodePool::new(
                address.clone(),
                self.master_connector.clone(),
                self.pool_config.clone(),
                false,
            );
            pool.spawn_evictor(self.shutdown.child_token());
            std::mem::replace(&mut *master, pool)
        };
        warn!("Master '{}' moved from {} to {}", self.master_name, old.endpoint(), address);
        old.close();
        Ok(true)
    }
}

/// First sentinel that knows `master_name` wins
async fn resolve_master(
    connector: &Arc<dyn Connector>,
    sentinels: &[Endpoint],
    master_name: &str,
) -> Result<Endpoint> {
    for sentinel in sentinels {
        let reply: Result<Reply> = async {
            let mut conn = connector.connect(sentinel).await?;
            conn.execute(&Command::sentinel_master_addr(master_name)).await
        }
        .await;
        match reply.and_then(Reply::into_bytes_vec) {
            Ok(parts) if parts.len() == 2 => {
                let host = String::from_utf8_lossy(&parts[0]);
                let port = String::from_utf8_lossy(&parts[1]);
                match format!("{}:{}", host, port).parse::<Endpoint>() {
                    Ok(endpoint) => return Ok(endpoint),
                    Err(e) => debug!("Sentinel {} returned a bad address: {}", sentinel, e),
                }
            }
            Ok(_) => debug!("Sentinel {} does not know master '{}'", sentinel, master_name),
            Err(e) => debug!("Sentinel {} unavailable: {}", sentinel, e),
        }
    }
    Err(Error::Config(format!(
        "no sentinel could resolve master '{}'",
        master_name
    )))
}

#[async_trait]
impl KvStore for SentinelStore {
    fn mode(&self) -> Mode {
        Mode::Sentinel
    }

    async fn run(&self, command: Command) -> Result<Option<Reply>> {
        let pool = self.master.read().clone();
        let err = match run_on_pool(&pool, &command).await {
            Ok(reply) => return Ok(Some(reply)),
            Err(e) if e.is_connection_failure() && !self.shutdown.is_cancelled() => e,
            Err(e) => return quiet_or(self.quiet, &command, e),
        };

        match self.failover().await {
            Ok(true) => {
                let pool = self.master.read().clone();
                match run_on_pool(&pool, &command).await {
                    Ok(reply) => Ok(Some(reply)),
                    Err(e) => quiet_or(self.quiet, &command, e),
                }
            }
            Ok(false) => quiet_or(self.quiet, &command, err),
            Err(e) => {
                warn!("Sentinel lookup failed: {}", e);
                quiet_or(self.quiet, &command, err)
            }
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.master.read().close();
    }
}
