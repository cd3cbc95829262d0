//! Slot-routed command execution.
//!
//! Every command is dispatched to the node owning its slot and retried within
//! a bounded attempt budget:
//!
//! - connection failures retry against the current map; on the last attempt
//!   the map is rediscovered and the failure surfaces. A replica read that
//!   keeps failing falls back to the master on its second to last attempt.
//! - `MOVED` rediscovers the map (asking the redirect target first) and
//!   retries against the new owner.
//! - `ASK` retries once against the named node, prefixed with `ASKING`,
//!   without touching the map.
//! - a pool closed by a rediscovery while the command waited on it counts
//!   as a connection failure.
//!
//! In quiet mode operational failures are logged and reported as `Ok(None)`.
//! Programming errors (cross-slot commands) always surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};

use crate::cluster::pool::{NodePool, PooledConnection};
use crate::cluster::slot::common_slot;
use crate::cluster::topology::TopologyCache;
use crate::cluster::{Command, Endpoint, Reply};
use crate::error::{Error, Result};

/// Dispatches commands across the cluster
pub struct CommandExecutor {
    topology: Arc<TopologyCache>,
    max_attempts: usize,
    quiet: bool,
    slow_threshold: Duration,
}

impl CommandExecutor {
    pub fn new(
        topology: Arc<TopologyCache>,
        max_attempts: usize,
        quiet: bool,
        slow_threshold: Duration,
    ) -> Self {
        Self {
            topology,
            max_attempts: max_attempts.max(1),
            quiet,
            slow_threshold,
        }
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run a command (single or multi-key) against the slot owner.
    ///
    /// Returns `Ok(None)` only in quiet mode, when the command could not be
    /// delivered.
    #[instrument(level = "debug", skip(self, command), fields(command = %command))]
    pub async fn run(&self, command: &Command) -> Result<Option<Reply>> {
        if self.topology.is_closed() {
            return Err(Error::Shutdown);
        }
        let slot = match common_slot(command.keys()) {
            Ok(slot) => slot,
            Err(Error::CrossSlot) => {
                error!("Rejected cross-slot command {}", command);
                return Err(Error::CrossSlot);
            }
            Err(e) => return self.quiet_or(e),
        };

        let mut readonly = command.is_readonly();
        let mut ask_target: Option<Endpoint> = None;
        let mut attempts = self.max_attempts;

        loop {
            if attempts == 0 {
                return self.quiet_or(Error::TooManyRedirections);
            }

            let ask = ask_target.take();
            let asking = ask.is_some();
            let outcome = match self.acquire(slot, readonly, ask).await {
                Ok(conn) => self.execute_on(conn, asking, command).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) if e.is_connection_failure() => {
                    if attempts <= 1 {
                        self.topology.rediscover(None).await;
                        error!("Command {} failed after retries: {}", command, e);
                        return self.quiet_or(e);
                    }
                    if readonly && attempts == 2 {
                        warn!("Replica read of slot {} keeps failing, falling back to master", slot);
                        readonly = false;
                    }
                    debug!("Retrying {} after connection failure: {}", command, e);
                    attempts -= 1;
                    continue;
                }
                Err(Error::Moved { slot: moved, endpoint }) => {
                    debug!("Slot {} moved to {}, refreshing topology", moved, endpoint);
                    self.topology.rediscover(Some(&endpoint)).await;
                }
                Err(Error::Ask { slot: asked, endpoint }) => {
                    debug!("Slot {} migrating, asking {}", asked, endpoint);
                    ask_target = Some(endpoint);
                }
                Err(e @ Error::UnknownRedirection(_)) => return self.quiet_or(e),
                Err(Error::NoReachableNode) => return self.quiet_or(Error::NoReachableNode),
                Err(e) => return Err(e),
            }

            // Redirected: the last retry always goes to a master
            if attempts == 1 {
                readonly = false;
            }
            attempts -= 1;
        }
    }

    /// Connection for the next attempt.
    ///
    /// An ASK target wins; otherwise the slot's route is used, rediscovering
    /// once if the slot is unmapped and falling back to any reachable node.
    async fn acquire(
        &self,
        slot: u16,
        readonly: bool,
        ask: Option<Endpoint>,
    ) -> Result<PooledConnection> {
        if let Some(target) = ask {
            return self.checkout(&self.topology.node_pool(&target)).await;
        }
        if let Some(pool) = self.topology.route_for_slot(slot, readonly) {
            return self.checkout(&pool).await;
        }
        self.topology.rediscover(None).await;
        if let Some(pool) = self.topology.route_for_slot(slot, readonly) {
            return self.checkout(&pool).await;
        }
        warn!("No route for slot {}, trying any reachable node", slot);
        match self.topology.random_node().await {
            Err(Error::Shutdown) if !self.topology.is_closed() => Err(Error::Connection {
                endpoint: "any node".to_string(),
                reason: "pool closed by topology refresh".to_string(),
            }),
            other => other,
        }
    }

    /// Borrow from `pool`.
    ///
    /// A rediscovery closes the pools of departed nodes while commands may
    /// still be waiting on them. Unless the whole client is closed, that
    /// counts as a connection failure so the command retries on the new map.
    async fn checkout(&self, pool: &Arc<NodePool>) -> Result<PooledConnection> {
        match pool.get().await {
            Err(Error::Shutdown) if !self.topology.is_closed() => {
                debug!("Pool for {} closed under a waiting command", pool.endpoint());
                Err(Error::Connection {
                    endpoint: pool.endpoint().to_string(),
                    reason: "pool closed by topology refresh".to_string(),
                })
            }
            other => other,
        }
    }

    async fn execute_on(
        &self,
        mut conn: PooledConnection,
        asking: bool,
        command: &Command,
    ) -> Result<Reply> {
        let started = Instant::now();
        let result: Result<Reply> = async {
            if asking {
                conn.execute(&Command::asking()).await?;
            }
            conn.execute(command).await
        }
        .await;
        self.log_if_slow(conn.endpoint(), started.elapsed(), command, &result);
        conn.release().await;
        result
    }

    fn log_if_slow(
        &self,
        endpoint: &Endpoint,
        elapsed: Duration,
        command: &Command,
        result: &Result<Reply>,
    ) {
        if elapsed < self.slow_threshold {
            return;
        }
        let reply_len = match result {
            Ok(Reply::Bulk(b)) => b.len(),
            Ok(Reply::Array(items)) => items.len(),
            _ => 0,
        };
        warn!(
            node = %endpoint,
            elapsed_ms = elapsed.as_millis() as u64,
            reply_len,
            "Slow command {}",
            command
        );
    }

    fn quiet_or(&self, e: Error) -> Result<Option<Reply>> {
        if self.quiet && !e.is_programming_error() {
            error!("Command failed (suppressed): {}", e);
            Ok(None)
        } else {
            Err(e)
        }
    }
}
