//! Cluster topology cache.
//!
//! Maps each of the 16384 slots to a [`SlotRoute`] (master pool plus read
//! candidates) and keeps one [`NodePool`] per known node.
//!
//! # Concurrency
//!
//! The slot table is an immutable `Arc<Vec<_>>` that is replaced wholesale on
//! every discovery, so readers never observe a half-written map. Rediscovery is
//! single-flight: while one caller refreshes the map, concurrent callers wait
//! for it to finish and then use the new map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::pool::{NodePool, PoolConfig, PooledConnection};
use crate::cluster::slot::SLOT_COUNT;
use crate::cluster::{Command, Endpoint, Reply};
use crate::error::{Error, Result};
use crate::transport::Connector;

/// Owner and read candidates of a slot
pub struct SlotRoute {
    master: Arc<NodePool>,
    /// Replicas followed by the master
    readers: Vec<Arc<NodePool>>,
    seq: AtomicUsize,
}

impl SlotRoute {
    pub fn new(master: Arc<NodePool>, replicas: Vec<Arc<NodePool>>) -> Self {
        let mut readers = replicas;
        readers.push(master.clone());
        Self {
            master,
            readers,
            seq: AtomicUsize::new(0),
        }
    }

    pub fn master(&self) -> &Arc<NodePool> {
        &self.master
    }

    pub fn replicas(&self) -> &[Arc<NodePool>] {
        &self.readers[..self.readers.len() - 1]
    }

    /// Round-robin over replicas and master
    pub fn read_pool(&self) -> &Arc<NodePool> {
        let i = self.seq.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        &self.readers[i]
    }
}

/// Slot range as reported by a node
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub master: Endpoint,
    pub replicas: Vec<Endpoint>,
}

type SlotTable = Vec<Option<Arc<SlotRoute>>>;

struct TopologyState {
    slots: Arc<SlotTable>,
    nodes: HashMap<String, Arc<NodePool>>,
}

/// Slot map and node pools of one cluster
pub struct TopologyCache {
    seeds: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    state: RwLock<TopologyState>,
    rediscovering: AtomicBool,
    rediscovered: Notify,
    rotation: AtomicUsize,
    shutdown: CancellationToken,
}

impl TopologyCache {
    pub fn new(
        seeds: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        pool_config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            seeds,
            connector,
            pool_config,
            state: RwLock::new(TopologyState {
                slots: Arc::new(vec![None; SLOT_COUNT as usize]),
                nodes: HashMap::new(),
            }),
            rediscovering: AtomicBool::new(false),
            rediscovered: Notify::new(),
            rotation: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Build the slot map from the seed nodes.
    ///
    /// Seeds are tried in order; the first one that answers wins. If none
    /// answers the previous map is kept and [`Error::NoReachableNode`] is returned.
    pub async fn discover(&self) -> Result<()> {
        self.discover_from(self.seeds.clone()).await
    }

    /// Refresh the slot map after a redirection or connection failure.
    ///
    /// `hint` (typically the node that redirected us) is asked first, then
    /// every known node, then the seeds. Only one refresh runs at a time.
    pub async fn rediscover(&self, hint: Option<&Endpoint>) {
        if self
            .rediscovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let notified = self.rediscovered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.rediscovering.load(Ordering::Acquire) {
                notified.await;
            }
            return;
        }

        let _flight = FlightGuard { cache: self };
        let candidates = self.rediscovery_candidates(hint);
        if let Err(e) = self.discover_from(candidates).await {
            warn!("Topology rediscovery failed: {}", e);
        }
    }

    fn rediscovery_candidates(&self, hint: Option<&Endpoint>) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let known = self.pools_rotated().into_iter().map(|p| p.endpoint().clone());
        for node in hint.cloned().into_iter().chain(known).chain(self.seeds.iter().cloned()) {
            if seen.insert(node.clone()) {
                candidates.push(node);
            }
        }
        candidates
    }

    async fn discover_from(&self, candidates: Vec<Endpoint>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        for node in candidates {
            match self.fetch_slots(&node).await {
                Ok(ranges) if !ranges.is_empty() => {
                    let count = ranges.len();
                    self.install(ranges);
                    info!("Discovered {} slot ranges from {}", count, node);
                    return Ok(());
                }
                Ok(_) => debug!("{} reported an empty slot table", node),
                Err(e) => debug!("Topology query to {} failed: {}", node, e),
            }
        }
        Err(Error::NoReachableNode)
    }

    #[instrument(skip(self, node), fields(node = %node))]
    async fn fetch_slots(&self, node: &Endpoint) -> Result<Vec<SlotRange>> {
        let mut conn = self.connector.connect(node).await?;
        let reply = conn.execute(&Command::cluster_slots()).await?;
        parse_slots_reply(reply, node)
    }

    /// Swap in a new slot table and close pools no longer referenced
    fn install(&self, ranges: Vec<SlotRange>) {
        let mut table: SlotTable = vec![None; SLOT_COUNT as usize];
        let mut referenced = HashSet::new();

        for range in ranges {
            let master = self.register_node(&range.master, true);
            referenced.insert(range.master.node_key());
            let replicas = range
                .replicas
                .iter()
                .map(|r| {
                    referenced.insert(r.node_key());
                    self.register_node(r, false)
                })
                .collect();
            let route = Arc::new(SlotRoute::new(master, replicas));
            for slot in range.start..=range.end {
                table[slot as usize] = Some(route.clone());
            }
        }

        let orphans: Vec<Arc<NodePool>> = {
            let mut state = self.state.write();
            state.slots = Arc::new(table);
            let stale: Vec<String> = state
                .nodes
                .keys()
                .filter(|k| !referenced.contains(*k))
                .cloned()
                .collect();
            stale
                .iter()
                .filter_map(|k| state.nodes.remove(k))
                .collect()
        };
        for pool in orphans {
            debug!("Closing pool for departed node {}", pool.endpoint());
            pool.close();
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Pool for a slot: the master, or the next read candidate when `readonly`
    pub fn route_for_slot(&self, slot: u16, readonly: bool) -> Option<Arc<NodePool>> {
        let slots = self.state.read().slots.clone();
        let route = slots.get(slot as usize)?.as_ref()?;
        Some(if readonly {
            route.read_pool().clone()
        } else {
            route.master().clone()
        })
    }

    pub fn slot_owner(&self, slot: u16) -> Option<Endpoint> {
        self.route_for_slot(slot, false)
            .map(|p| p.endpoint().clone())
    }

    pub fn route(&self, slot: u16) -> Option<Arc<SlotRoute>> {
        self.state.read().slots.get(slot as usize)?.clone()
    }

    /// Pool for `endpoint`, created on first use.
    ///
    /// Replicas are marked read-eligible so their connections issue READONLY.
    pub fn register_node(&self, endpoint: &Endpoint, is_master: bool) -> Arc<NodePool> {
        let key = endpoint.node_key();
        if let Some(pool) = self.state.read().nodes.get(&key) {
            if !is_master {
                pool.set_readonly(true);
            }
            return pool.clone();
        }

        let mut state = self.state.write();
        if let Some(pool) = state.nodes.get(&key) {
            if !is_master {
                pool.set_readonly(true);
            }
            return pool.clone();
        }
        let pool = NodePool::new(
            endpoint.clone(),
            self.connector.clone(),
            self.pool_config.clone(),
            !is_master,
        );
        pool.spawn_evictor(self.shutdown.child_token());
        state.nodes.insert(key, pool.clone());
        pool
    }

    /// Pool for a redirection target
    pub fn node_pool(&self, endpoint: &Endpoint) -> Arc<NodePool> {
        self.register_node(endpoint, true)
    }

    pub fn known_nodes(&self) -> Vec<Endpoint> {
        let mut nodes: Vec<Endpoint> = self
            .state
            .read()
            .nodes
            .values()
            .map(|p| p.endpoint().clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn pools_rotated(&self) -> Vec<Arc<NodePool>> {
        let mut pools: Vec<Arc<NodePool>> = self.state.read().nodes.values().cloned().collect();
        if !pools.is_empty() {
            let shift = self.rotation.fetch_add(1, Ordering::Relaxed) % pools.len();
            pools.rotate_left(shift);
        }
        pools
    }

    /// Any node that answers a ping
    pub async fn random_node(&self) -> Result<PooledConnection> {
        for pool in self.pools_rotated() {
            match pool.get().await {
                Ok(mut conn) => match conn.execute(&Command::ping()).await {
                    Ok(_) => return Ok(conn),
                    Err(e) => debug!("{} failed ping: {}", pool.endpoint(), e),
                },
                Err(e) => debug!("{} unavailable: {}", pool.endpoint(), e),
            }
        }
        Err(Error::NoReachableNode)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every pool and forget the slot map
    pub fn close(&self) {
        self.shutdown.cancel();
        let pools: Vec<Arc<NodePool>> = {
            let mut state = self.state.write();
            state.slots = Arc::new(vec![None; SLOT_COUNT as usize]);
            state.nodes.drain().map(|(_, p)| p).collect()
        };
        for pool in pools {
            pool.close();
        }
        info!("Topology cache closed");
    }
}

/// Clears the single-flight flag and wakes waiters, even if the leader is cancelled
struct FlightGuard<'a> {
    cache: &'a TopologyCache,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.cache.rediscovering.store(false, Ordering::Release);
        self.cache.rediscovered.notify_waiters();
    }
}

/// Parse a `CLUSTER SLOTS` reply.
///
/// An empty host means "the node you asked", so `queried` supplies it.
pub fn parse_slots_reply(reply: Reply, queried: &Endpoint) -> Result<Vec<SlotRange>> {
    let mut ranges = Vec::new();
    for entry in reply.into_array()? {
        let mut parts = entry.into_array()?.into_iter();
        let (Some(start), Some(end), Some(master)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let start = start.into_int()?;
        let end = end.into_int()?;
        if start < 0 || end < start || end >= SLOT_COUNT as i64 {
            return Err(Error::Protocol(format!("invalid slot range {}-{}", start, end)));
        }
        let Some(master) = parse_node(master, queried)? else {
            continue;
        };
        let mut replicas = Vec::new();
        for replica in parts {
            if let Some(node) = parse_node(replica, queried)? {
                replicas.push(node);
            }
        }
        ranges.push(SlotRange {
            start: start as u16,
            end: end as u16,
            master,
            replicas,
        });
    }
    Ok(ranges)
}

fn parse_node(reply: Reply, queried: &Endpoint) -> Result<Option<Endpoint>> {
    let mut fields = reply.into_array()?.into_iter();
    let (Some(host), Some(port)) = (fields.next(), fields.next()) else {
        return Ok(None);
    };
    let host = match host.into_bytes()? {
        Some(h) if !h.is_empty() => String::from_utf8_lossy(&h).into_owned(),
        _ => queried.host().to_string(),
    };
    let port = u16::try_from(port.into_int()?)
        .map_err(|_| Error::Protocol("node port out of range".into()))?;
    Ok(Some(Endpoint::new(host, port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::slot::hash_slot;
    use crate::transport::InMemoryCluster;
    use bytes::Bytes;
    use std::time::Duration;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn topology_for(cluster: &InMemoryCluster, seeds: Vec<Endpoint>) -> Arc<TopologyCache> {
        TopologyCache::new(seeds, cluster.connector(), PoolConfig::default())
    }

    #[tokio::test]
    async fn test_discover_routes_slots() {
        let (a, b) = (ep(7000), ep(7001));
        let cluster = InMemoryCluster::with_masters(&[a.clone(), b.clone()]);
        let topology = topology_for(&cluster, vec![a.clone()]);
        topology.discover().await.unwrap();

        assert_eq!(topology.slot_owner(0), Some(a.clone()));
        assert_eq!(topology.slot_owner(16383), Some(b.clone()));
        assert_eq!(topology.known_nodes(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_discover_skips_dead_seed() {
        let (a, dead) = (ep(7000), ep(7999));
        let cluster = InMemoryCluster::standalone(&a);
        cluster.set_down(&dead, true);
        let topology = topology_for(&cluster, vec![dead, a.clone()]);
        topology.discover().await.unwrap();
        assert_eq!(topology.slot_owner(hash_slot(b"x")), Some(a));
    }

    #[tokio::test]
    async fn test_discover_all_seeds_down_keeps_previous_map() {
        let a = ep(7000);
        let cluster = InMemoryCluster::standalone(&a);
        let topology = topology_for(&cluster, vec![a.clone()]);
        topology.discover().await.unwrap();

        cluster.set_down(&a, true);
        assert!(matches!(topology.discover().await, Err(Error::NoReachableNode)));
        assert_eq!(topology.slot_owner(0), Some(a));
    }

    #[tokio::test]
    async fn test_read_selector_rotates_over_replicas_and_master() {
        let (m, r1, r2) = (ep(7000), ep(7100), ep(7101));
        let cluster = InMemoryCluster::standalone(&m);
        cluster.add_replica(&m, &r1);
        cluster.add_replica(&m, &r2);
        let topology = topology_for(&cluster, vec![m.clone()]);
        topology.discover().await.unwrap();

        let picks: Vec<Endpoint> = (0..6)
            .map(|_| topology.route_for_slot(42, true).unwrap().endpoint().clone())
            .collect();
        assert_eq!(picks, vec![r1.clone(), r2.clone(), m.clone(), r1, r2, m.clone()]);
        assert_eq!(topology.route_for_slot(42, false).unwrap().endpoint(), &m);

        let route = topology.route(42).unwrap();
        assert_eq!(route.replicas().len(), 2);
        assert!(route.replicas().iter().all(|p| p.is_readonly()));
        assert!(!route.master().is_readonly());
    }

    #[tokio::test]
    async fn test_rediscover_picks_up_moved_slot_and_closes_orphans() {
        let (a, b) = (ep(7000), ep(7001));
        let cluster = InMemoryCluster::with_masters(&[a.clone(), b.clone()]);
        let topology = topology_for(&cluster, vec![a.clone()]);
        topology.discover().await.unwrap();
        let old_b_pool = topology.route_for_slot(16383, false).unwrap();

        cluster.assign_slots(8192..=16383, &a);
        topology.rediscover(Some(&a)).await;

        assert_eq!(topology.slot_owner(16383), Some(a.clone()));
        assert_eq!(topology.known_nodes(), vec![a]);
        assert!(old_b_pool.is_closed());
    }

    #[tokio::test]
    async fn test_rediscovery_is_single_flight() {
        let a = ep(7000);
        let cluster = InMemoryCluster::standalone(&a);
        let topology = topology_for(&cluster, vec![a.clone()]);
        topology.discover().await.unwrap();
        cluster.clear_log();
        cluster.set_latency(&a, Duration::from_millis(50));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let topology = topology.clone();
                tokio::spawn(async move { topology.rediscover(None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cluster.served(&a, "CLUSTER"), 1);
    }

    #[tokio::test]
    async fn test_random_node_skips_unreachable() {
        let (a, b) = (ep(7000), ep(7001));
        let cluster = InMemoryCluster::with_masters(&[a.clone(), b.clone()]);
        let topology = topology_for(&cluster, vec![a.clone()]);
        topology.discover().await.unwrap();
        cluster.set_down(&a, true);

        for _ in 0..3 {
            let conn = topology.random_node().await.unwrap();
            assert_eq!(conn.endpoint(), &b);
        }
        cluster.set_down(&b, true);
        assert!(matches!(topology.random_node().await, Err(Error::NoReachableNode)));
    }

    #[test]
    fn test_parse_slots_reply_fills_empty_host() {
        let queried = ep(7000);
        let reply = Reply::Array(vec![Reply::Array(vec![
            Reply::Int(0),
            Reply::Int(100),
            Reply::Array(vec![Reply::Bulk(Bytes::new()), Reply::Int(7000)]),
            Reply::Array(vec![Reply::Bulk(Bytes::from_static(b"10.0.0.9")), Reply::Int(7100)]),
        ])]);
        let ranges = parse_slots_reply(reply, &queried).unwrap();
        assert_eq!(
            ranges,
            vec![SlotRange {
                start: 0,
                end: 100,
                master: queried.clone(),
                replicas: vec![Endpoint::new("10.0.0.9", 7100)],
            }]
        );
    }

    #[test]
    fn test_parse_slots_reply_rejects_bad_range() {
        let reply = Reply::Array(vec![Reply::Array(vec![
            Reply::Int(10),
            Reply::Int(5),
            Reply::Array(vec![Reply::Bulk(Bytes::from_static(b"h")), Reply::Int(1)]),
        ])]);
        assert!(parse_slots_reply(reply, &ep(1)).is_err());
    }
}
