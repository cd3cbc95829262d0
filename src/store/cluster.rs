//! Cluster mode store

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::KvStore;
use crate::cluster::{Command, CommandExecutor, Reply, TopologyCache};
use crate::config::{ClientConfig, Mode};
use crate::error::Result;
use crate::transport::Connector;

/// Store backed by a slot-partitioned cluster
pub struct ClusterStore {
    executor: CommandExecutor,
}

impl ClusterStore {
    /// Discover the slot map from the configured seeds.
    ///
    /// An unreachable cluster is an error unless quiet mode is on, in which
    /// case the store starts empty and rediscovers on first use.
    pub async fn connect(config: &ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let seeds = config.seed_endpoints()?;
        let topology = TopologyCache::new(seeds, connector, config.pool_config());
        match topology.discover().await {
            Ok(()) => info!(
                nodes = topology.known_nodes().len(),
                "Connected to cluster"
            ),
            Err(e) if config.connection.quiet => {
                warn!("Initial cluster discovery failed, continuing in quiet mode: {}", e)
            }
            Err(e) => return Err(e),
        }

        let executor = CommandExecutor::new(
            topology,
            config.max_attempts(),
            config.connection.quiet,
            config.slow_threshold(),
        );
        Ok(Self { executor })
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        self.executor.topology()
    }
}

#[async_trait]
impl KvStore for ClusterStore {
    fn mode(&self) -> Mode {
        Mode::Cluster
    }

    async fn run(&self, command: Command) -> Result<Option<Reply>> {
        self.executor.run(&command).await
    }

    async fn close(&self) {
        self.executor.topology().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{hash_slot, Endpoint};
    use crate::error::Error;
    use crate::transport::InMemoryCluster;
    use assert_matches::assert_matches;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn cluster_config(nodes: &[Endpoint]) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.cluster.nodes = nodes.iter().map(|n| n.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn test_commands_follow_slot_owner() {
        let nodes = [ep(7000), ep(7001), ep(7002)];
        let cluster = InMemoryCluster::with_masters(&nodes);
        let store = ClusterStore::connect(&cluster_config(&nodes), cluster.connector())
            .await
            .unwrap();

        store.set(b"alpha", b"1").await.unwrap();
        store.set(b"beta", b"2").await.unwrap();
        assert_eq!(store.get(b"alpha").await.unwrap().unwrap().as_ref(), b"1");

        let owner = cluster.slot_owner(hash_slot(b"alpha")).unwrap();
        assert_eq!(
            store.topology().slot_owner(hash_slot(b"alpha")),
            Some(owner)
        );

        store.close().await;
        assert_matches!(store.get(b"alpha").await, Err(Error::Shutdown));
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let nodes = [ep(7000)];
        let cluster = InMemoryCluster::with_masters(&nodes);
        cluster.set_down(&nodes[0], true);

        let config = cluster_config(&nodes);
        assert_matches!(
            ClusterStore::connect(&config, cluster.connector()).await.err(),
            Some(Error::NoReachableNode)
        );

        let mut quiet = config.clone();
        quiet.connection.quiet = true;
        let store = ClusterStore::connect(&quiet, cluster.connector())
            .await
            .unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), None);

        // Comes back: the next command rediscovers
        cluster.set_down(&nodes[0], false);
        store.set(b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap().unwrap().as_ref(), b"v");
    }
}
