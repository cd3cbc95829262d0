//! Per-node connection pool.
//!
//! A semaphore bounds the number of live connections; idle connections wait
//! in a LIFO stack. Borrowing hands out a [`PooledConnection`] guard that puts
//! the connection back when dropped, so a connection is returned exactly once
//! on every exit path, including cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::{Command, Endpoint, Reply};
use crate::error::{Error, Result};
use crate::transport::{Connection, Connector};

/// Pool sizing and validation knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    pub max_wait: Duration,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub min_evictable_idle: Duration,
    pub eviction_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 500,
            max_idle: 20,
            min_idle: 2,
            max_wait: Duration::from_millis(50),
            test_on_borrow: true,
            test_on_return: false,
            min_evictable_idle: Duration::from_millis(10_000),
            eviction_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub borrowed: usize,
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

/// Connection pool for a single node
pub struct NodePool {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    readonly: AtomicBool,
    closed: AtomicBool,
    borrowed: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl NodePool {
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
        readonly: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            connector,
            permits: Arc::new(Semaphore::new(config.max_total.max(1))),
            config,
            idle: Mutex::new(VecDeque::new()),
            readonly: AtomicBool::new(readonly),
            closed: AtomicBool::new(false),
            borrowed: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connections opened from now on issue READONLY so replicas serve reads
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::Release);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection, waiting at most `max_wait` for a free slot
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::Shutdown);
        }

        let permit = match timeout(self.config.max_wait, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => {
                return Err(Error::PoolExhausted {
                    endpoint: self.endpoint.to_string(),
                    waited_ms: self.config.max_wait.as_millis() as u64,
                })
            }
        };

        let conn = match self.take_idle().await {
            Some(conn) => conn,
            None => self.open().await?,
        };

        self.borrowed.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Pop idle connections until one passes validation
    async fn take_idle(&self) -> Option<Box<dyn Connection>> {
        loop {
            let candidate = self.idle.lock().pop_back()?;
            let mut conn = candidate.conn;
            if conn.is_broken() {
                self.discard(conn);
                continue;
            }
            if self.config.test_on_borrow && !conn.ping().await {
                debug!("Discarding idle connection to {} that failed validation", self.endpoint);
                self.discard(conn);
                continue;
            }
            return Some(conn);
        }
    }

    async fn open(&self) -> Result<Box<dyn Connection>> {
        let mut conn = self.connector.connect(&self.endpoint).await?;
        if self.is_readonly() {
            conn.execute(&Command::readonly_mode()).await?;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn discard(&self, conn: Box<dyn Connection>) {
        drop(conn);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a connection to the idle stack, or drop it
    fn put_back(&self, conn: Box<dyn Connection>) {
        self.borrowed.fetch_sub(1, Ordering::AcqRel);
        if conn.is_broken() || self.is_closed() {
            self.discard(conn);
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            drop(idle);
            self.discard(conn);
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    /// Drop connections idle longer than `min_evictable_idle`, keeping `min_idle`
    pub fn evict_idle(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut idle = self.idle.lock();
            while idle.len() > self.config.min_idle {
                // Oldest connections sit at the front
                match idle.front() {
                    Some(front) if front.since.elapsed() >= self.config.min_evictable_idle => {
                        if let Some(entry) = idle.pop_front() {
                            evicted.push(entry.conn);
                        }
                    }
                    _ => break,
                }
            }
        }
        let count = evicted.len();
        for conn in evicted {
            self.discard(conn);
        }
        if count > 0 {
            debug!("Evicted {} idle connections to {}", count, self.endpoint);
        }
        count
    }

    /// Run [`evict_idle`](Self::evict_idle) periodically until cancelled or the pool is dropped
    pub fn spawn_evictor(self: &Arc<Self>, shutdown: CancellationToken) {
        let Some(period) = self.config.eviction_interval else {
            return;
        };
        let pool: Weak<NodePool> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match pool.upgrade() {
                            Some(pool) if !pool.is_closed() => {
                                pool.evict_idle();
                            }
                            _ => break,
                        }
                    }
                }
            }
        });
    }

    /// Close the pool: idle connections are dropped, borrowed ones are
    /// dropped when returned and new borrows fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for entry in drained {
            self.discard(entry.conn);
        }
        debug!("Closed pool for {}", self.endpoint);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            borrowed: self.borrowed.load(Ordering::Acquire),
            idle: self.idle.lock().len(),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("endpoint", &self.endpoint)
            .field("readonly", &self.is_readonly())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Borrowed connection. Returned to its pool on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<NodePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }

    /// Send a command; error replies (including redirections) become errors
    pub async fn execute(&mut self, command: &Command) -> Result<Reply> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(command).await,
            None => Err(Error::Internal("connection already released".into())),
        }
    }

    /// Return the connection, validating it first when `test_on_return` is set
    pub async fn release(mut self) {
        if self.pool.config.test_on_return {
            if let Some(conn) = self.conn.as_mut() {
                if !conn.is_broken() && !conn.ping().await {
                    warn!("Connection to {} failed validation on return", self.pool.endpoint);
                    if let Some(conn) = self.conn.take() {
                        self.pool.borrowed.fetch_sub(1, Ordering::AcqRel);
                        self.pool.discard(conn);
                    }
                }
            }
        }
        // Drop puts it back
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", self.endpoint())
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryCluster;
    use assert_matches::assert_matches;

    fn setup(config: PoolConfig) -> (InMemoryCluster, Arc<NodePool>) {
        let node = Endpoint::new("127.0.0.1", 7000);
        let cluster = InMemoryCluster::standalone(&node);
        let pool = NodePool::new(node, cluster.connector(), config, false);
        (cluster, pool)
    }

    #[tokio::test]
    async fn test_borrow_and_return() {
        let (cluster, pool) = setup(PoolConfig::default());
        {
            let mut conn = pool.get().await.unwrap();
            conn.execute(&Command::set(b"a", b"1")).await.unwrap();
            assert_eq!(pool.stats().borrowed, 1);
        }
        assert_eq!(pool.stats().borrowed, 0);
        assert_eq!(pool.stats().idle, 1);

        // reused, not reopened
        let conn = pool.get().await.unwrap();
        conn.release().await;
        assert_eq!(cluster.connections_opened(), 1);
        assert_eq!(pool.stats().borrowed, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let config = PoolConfig {
            max_total: 1,
            max_wait: Duration::from_millis(20),
            ..Default::default()
        };
        let (_cluster, pool) = setup(config);
        let held = pool.get().await.unwrap();
        assert_matches!(pool.get().await, Err(Error::PoolExhausted { waited_ms: 20, .. }));
        drop(held);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_connection_not_reused() {
        let (cluster, pool) = setup(PoolConfig::default());
        let node = pool.endpoint().clone();
        {
            let mut conn = pool.get().await.unwrap();
            cluster.set_down(&node, true);
            assert!(conn.execute(&Command::ping()).await.is_err());
        }
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().destroyed, 1);

        cluster.set_down(&node, false);
        assert!(pool.get().await.is_ok());
        assert_eq!(cluster.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_validation_on_borrow_discards_dead_idle() {
        let (cluster, pool) = setup(PoolConfig::default());
        let node = pool.endpoint().clone();
        drop(pool.get().await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        cluster.set_down(&node, true);
        assert!(pool.get().await.is_err());
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().borrowed, 0);
    }

    #[tokio::test]
    async fn test_max_idle_caps_parked_connections() {
        let config = PoolConfig {
            max_idle: 1,
            ..Default::default()
        };
        let (_cluster, pool) = setup(config);
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_min_idle() {
        let config = PoolConfig {
            min_idle: 1,
            min_evictable_idle: Duration::ZERO,
            ..Default::default()
        };
        let (_cluster, pool) = setup(config);
        let held: Vec<_> = futures::future::join_all((0..3).map(|_| pool.get()))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        drop(held);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.evict_idle(), 2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_readonly_pool_sends_readonly() {
        let node = Endpoint::new("127.0.0.1", 7000);
        let replica = Endpoint::new("127.0.0.1", 7100);
        let cluster = InMemoryCluster::standalone(&node);
        cluster.add_replica(&node, &replica);
        let pool = NodePool::new(replica.clone(), cluster.connector(), PoolConfig::default(), true);

        let mut conn = pool.get().await.unwrap();
        assert_eq!(conn.execute(&Command::get(b"k")).await.unwrap(), Reply::Nil);
        assert_eq!(cluster.served(&replica, "READONLY"), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_new_borrows() {
        let (_cluster, pool) = setup(PoolConfig::default());
        let held = pool.get().await.unwrap();
        pool.close();
        assert_matches!(pool.get().await, Err(Error::Shutdown));
        drop(held);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().borrowed, 0);
    }
}
