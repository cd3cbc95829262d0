//! Single-node store

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{quiet_or, run_on_pool, KvStore};
use crate::cluster::{Command, Endpoint, NodePool, Reply};
use crate::config::{ClientConfig, Mode};
use crate::error::Result;
use crate::transport::Connector;

/// Store backed by one server, no slot routing
pub struct StandaloneStore {
    pool: Arc<NodePool>,
    quiet: bool,
    slow_threshold: std::time::Duration,
    shutdown: CancellationToken,
}

impl StandaloneStore {
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let endpoint: Endpoint = config.standalone.address.parse()?;
        let pool = NodePool::new(endpoint.clone(), connector, config.pool_config(), false);
        let shutdown = CancellationToken::new();
        pool.spawn_evictor(shutdown.child_token());
        info!("Standalone store for {}", endpoint);

        Ok(Self {
            pool,
            quiet: config.connection.quiet,
            slow_threshold: config.slow_threshold(),
            shutdown,
        })
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }
}

#[async_trait]
impl KvStore for StandaloneStore {
    fn mode(&self) -> Mode {
        Mode::Standalone
    }

    async fn run(&self, command: Command) -> Result<Option<Reply>> {
        let started = Instant::now();
        let result = run_on_pool(&self.pool, &command).await;
        let elapsed = started.elapsed();
        if elapsed >= self.slow_threshold {
            warn!(
                node = %self.pool.endpoint(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow command {}",
                command
            );
        }
        match result {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => quiet_or(self.quiet, &command, e),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::InMemoryCluster;
    use assert_matches::assert_matches;

    fn setup() -> (InMemoryCluster, Endpoint, StandaloneStore) {
        let node = Endpoint::new("127.0.0.1", 6379);
        let cluster = InMemoryCluster::standalone(&node);
        let mut config = ClientConfig::default();
        config.mode = Mode::Standalone;
        config.standalone.address = node.to_string();
        let store = StandaloneStore::new(&config, cluster.connector()).unwrap();
        (cluster, node, store)
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (cluster, _, store) = setup();
        for i in 0..10 {
            store.set(format!("k{}", i).as_bytes(), b"v").await.unwrap();
        }
        assert_eq!(cluster.connections_opened(), 1);
        assert_eq!(store.pool().stats().borrowed, 0);
    }

    #[tokio::test]
    async fn test_failure_surfaces_without_quiet() {
        let (cluster, node, store) = setup();
        cluster.set_down(&node, true);
        let err = store.get(b"k").await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(store.pool().stats().borrowed, 0);
    }

    #[tokio::test]
    async fn test_server_error_is_not_swallowed() {
        let (_, _, store) = setup();
        store.hset(b"h", b"f", b"v").await.unwrap();
        // String command on a hash
        assert_matches!(store.get(b"h").await, Err(Error::Server(_)));
    }
}
