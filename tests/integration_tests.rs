//! slotcache Integration Tests
//!
//! End-to-end scenarios against the in-memory cluster:
//! - Routing: resharding (MOVED), live migration (ASK), node failure
//! - Pooling: no leaked borrows under load and failures
//! - Managed cache: regions, paging, clearing, refresh sweeps

use std::sync::Arc;
use std::time::Duration;

use slotcache::cluster::{hash_slot, Endpoint};
use slotcache::store::ClusterStore;
use slotcache::transport::InMemoryCluster;
use slotcache::{ClientConfig, KvStore};

fn ep(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", port)
}

fn three_nodes() -> [Endpoint; 3] {
    [ep(7000), ep(7001), ep(7002)]
}

fn cluster_config(nodes: &[Endpoint]) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.cluster.nodes = nodes.iter().map(|n| n.to_string()).collect();
    config
}

/// A node of `nodes` other than `owner`
fn other_than(nodes: &[Endpoint], owner: &Endpoint) -> Endpoint {
    nodes
        .iter()
        .find(|n| *n != owner)
        .cloned()
        .expect("cluster has more than one node")
}

// =============================================================================
// Routing
// =============================================================================

mod routing_tests {
    use super::*;
    use assert_matches::assert_matches;
    use slotcache::cluster::{Command, Reply};
    use slotcache::Error;

    #[tokio::test]
    async fn test_resharded_slot_followed_via_moved() {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let store = ClusterStore::connect(&cluster_config(&nodes), cluster.connector())
            .await
            .unwrap();

        store.set(b"user:42", b"ada").await.unwrap();
        let slot = hash_slot(b"user:42");
        let old_owner = cluster.slot_owner(slot).unwrap();
        let new_owner = other_than(&nodes, &old_owner);

        cluster.move_slot(slot, &new_owner);
        cluster.clear_log();

        assert_eq!(store.get(b"user:42").await.unwrap().unwrap().as_ref(), b"ada");
        assert_eq!(cluster.served(&old_owner, "GET"), 1);
        assert_eq!(cluster.served(&new_owner, "GET"), 1);
        assert_eq!(store.topology().slot_owner(slot), Some(new_owner.clone()));

        // Map is current: no more redirects
        cluster.clear_log();
        store.get(b"user:42").await.unwrap();
        assert_eq!(cluster.served(&old_owner, "GET"), 0);
        assert_eq!(cluster.served(&new_owner, "GET"), 1);
    }

    #[tokio::test]
    async fn test_migrating_slot_answered_via_ask() {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let store = ClusterStore::connect(&cluster_config(&nodes), cluster.connector())
            .await
            .unwrap();

        let slot = hash_slot(b"{cart}:7");
        let owner = cluster.slot_owner(slot).unwrap();
        let target = other_than(&nodes, &owner);
        cluster.migrate_slot(slot, &target);

        store.set(b"{cart}:7", b"3 items").await.unwrap();
        assert_eq!(cluster.served(&target, "ASKING"), 1);
        assert_eq!(cluster.served(&target, "SET"), 1);
        // ASK does not change the slot map
        assert_eq!(store.topology().slot_owner(slot), Some(owner.clone()));

        cluster.finish_migration(slot);
        cluster.clear_log();
        assert_eq!(
            store.get(b"{cart}:7").await.unwrap().unwrap().as_ref(),
            b"3 items"
        );
        assert_eq!(store.topology().slot_owner(slot), Some(target.clone()));
        assert_eq!(cluster.served(&target, "ASKING"), 0);
    }

    #[tokio::test]
    async fn test_failed_master_replaced_after_rediscovery() {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let store = ClusterStore::connect(&cluster_config(&nodes), cluster.connector())
            .await
            .unwrap();
        store.set(b"session:1", b"token").await.unwrap();

        let slot = hash_slot(b"session:1");
        let owner = cluster.slot_owner(slot).unwrap();
        let promoted = other_than(&nodes, &owner);
        cluster.set_down(&owner, true);
        cluster.move_slot(slot, &promoted);

        // Retries against the dead node run out, then the map is refreshed
        let first = store.get(b"session:1").await;
        assert!(first.unwrap_err().is_connection_failure());
        assert_eq!(store.topology().slot_owner(slot), Some(promoted.clone()));

        assert_eq!(
            store.get(b"session:1").await.unwrap().unwrap().as_ref(),
            b"token"
        );
    }

    #[tokio::test]
    async fn test_multi_key_commands_need_one_slot() {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let store = ClusterStore::connect(&cluster_config(&nodes), cluster.connector())
            .await
            .unwrap();

        store.set(b"{order:1}:lines", b"2").await.unwrap();
        store.set(b"{order:1}:total", b"19.90").await.unwrap();
        let same_slot = Command::del_many(&["{order:1}:lines", "{order:1}:total"]);
        assert_matches!(store.run(same_slot).await, Ok(Some(Reply::Int(2))));

        assert_ne!(hash_slot(b"order:1"), hash_slot(b"order:2"));
        let cross = Command::del_many(&["order:1", "order:2"]);
        assert_matches!(store.run(cross).await, Err(Error::CrossSlot));
    }
}

// =============================================================================
// Pooling
// =============================================================================

mod pool_tests {
    use super::*;

    #[tokio::test]
    async fn test_no_borrow_leaks_under_load() {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let mut config = cluster_config(&nodes);
        config.pool.max_total = 4;
        config.pool.max_idle = 4;
        config.pool.max_wait_ms = 2000;
        let store = Arc::new(
            ClusterStore::connect(&config, cluster.connector())
                .await
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("k:{}", i);
                store.set(key.as_bytes(), b"v").await?;
                store.get(key.as_bytes()).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_some());
        }

        for node in &nodes {
            let stats = store.topology().node_pool(node).stats();
            assert_eq!(stats.borrowed, 0, "{} leaked a connection", node);
            assert!(stats.idle <= 4);
        }
    }

    #[tokio::test]
    async fn test_no_borrow_leaks_when_node_fails() {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let mut config = cluster_config(&nodes);
        config.connection.quiet = true;
        let store = ClusterStore::connect(&config, cluster.connector())
            .await
            .unwrap();

        cluster.set_down(&nodes[1], true);
        for i in 0..50 {
            let key = format!("k:{}", i);
            // Keys owned by the dead node read as "no data" in quiet mode
            store.set(key.as_bytes(), b"v").await.unwrap();
        }
        cluster.set_down(&nodes[1], false);

        for node in &nodes {
            assert_eq!(store.topology().node_pool(node).stats().borrowed, 0);
        }
    }
}

// =============================================================================
// Managed Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use slotcache::cache::{
        now_ms, producer_fn, CacheEnvelope, ManagedCache, ProducerId, RefreshRegistry,
        RefreshScheduler, RegionEntry,
    };

    async fn managed(config: ClientConfig) -> (InMemoryCluster, Arc<ManagedCache>) {
        let nodes = three_nodes();
        let cluster = InMemoryCluster::with_masters(&nodes);
        let mut config = config;
        config.cluster.nodes = nodes.iter().map(|n| n.to_string()).collect();
        if config.region.namespace.is_empty() {
            config.region.namespace = "shop".into();
        }
        let store = slotcache::connect(&config, cluster.connector())
            .await
            .unwrap();
        let cache = ManagedCache::new(store, &config, Arc::new(RefreshRegistry::new()));
        (cluster, cache)
    }

    fn items() -> ProducerId {
        ProducerId::new("Catalog", "item(u64)")
    }

    #[tokio::test]
    async fn test_region_paging_soonest_expiry_first() {
        let (_, cache) = managed(ClientConfig::default()).await;
        let entry = RegionEntry::new(items(), json!([]));
        let base = now_ms() - 100_000;
        for i in 0..12i64 {
            let key = cache.key(format!("item:{:02}", i));
            let envelope = CacheEnvelope::loaded_at(i, base + i * 1000, 3600);
            cache.put_with_region(&key, &envelope, &entry).await.unwrap();
        }

        let regions = cache.list_regions().await.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].producer, items());
        assert_eq!(regions[0].ttl_seconds, 3600);
        assert!(!regions[0].refresh);

        let first = cache.query(&items(), 1, 5).await.unwrap();
        assert_eq!(first.total, 12);
        let names: Vec<&str> = first.keys.iter().map(|k| k.key()).collect();
        assert_eq!(names, ["item:00", "item:01", "item:02", "item:03", "item:04"]);

        let last = cache.query(&items(), 3, 5).await.unwrap();
        assert_eq!(last.keys.len(), 2);
        assert_eq!(last.keys[1].key(), "item:11");

        // Oversized pages are capped
        let capped = cache.query(&items(), 1, 500).await.unwrap();
        assert_eq!(capped.page_size, 5);
        assert!(cache.query(&items(), 0, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_region_larger_than_one_pass() {
        let mut config = ClientConfig::default();
        config.region.concurrency = Some(16);
        let (cluster, cache) = managed(config).await;

        let entry = RegionEntry::new(items(), json!([]));
        let count = 6_010;
        for i in 0..count {
            let key = cache.key(format!("item:{}", i));
            cache
                .put_with_region(&key, &CacheEnvelope::new(i, 600), &entry)
                .await
                .unwrap();
        }
        assert_eq!(cache.index().cardinality(&items()).await.unwrap(), count as u64);

        let report = cache.clear_region(&items()).await.unwrap();
        assert_eq!(report.submitted, count);
        assert_eq!(report.succeeded, count);
        assert_eq!(cache.index().cardinality(&items()).await.unwrap(), 0);
        assert!(!cluster.contains_key(b"shop:item:0"));
        assert!(!cluster.contains_key(b"shop:item:6009"));
        assert!(!cluster.contains_key(b"shop:$KEY:item:6009"));
    }

    #[tokio::test]
    async fn test_hash_fields_share_a_slot() {
        let (cluster, cache) = managed(ClientConfig::default()).await;
        for sku in ["a", "b", "c"] {
            let key = cache.field_key("prices", sku);
            cache.put(&key, &CacheEnvelope::new(9.5, 60)).await.unwrap();
        }
        let owner = cluster.slot_owner(hash_slot(b"shop:prices")).unwrap();
        assert_eq!(cluster.served(&owner, "HSET"), 3);

        let price = cache
            .get::<f64>(&cache.field_key("prices", "b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(price.payload, 9.5);
    }

    #[tokio::test]
    async fn test_scheduler_refreshes_due_keys() {
        let (_, cache) = managed(ClientConfig::default()).await;
        cache.registry().register_class(
            items(),
            producer_fn(|key, _| {
                async move { Ok(json!(format!("fresh {}", key.key()))) }.boxed()
            }),
        );

        let entry = RegionEntry::new(items(), json!([])).refreshable(None);
        let now = now_ms();
        // Expires in 5s: due. Expires in 10 minutes: not due.
        let soon = cache.key("soon");
        let later = cache.key("later");
        cache
            .put_with_region(&soon, &CacheEnvelope::loaded_at("stale".to_string(), now - 55_000, 60), &entry)
            .await
            .unwrap();
        cache
            .put_with_region(&later, &CacheEnvelope::loaded_at("stale".to_string(), now, 600), &entry)
            .await
            .unwrap();
        // Indexed but its side record has lapsed: purged, not refreshed
        let orphan = cache.key("orphan");
        cache
            .put_with_region(&orphan, &CacheEnvelope::loaded_at("stale".to_string(), now - 55_000, 60), &entry)
            .await
            .unwrap();
        cache
            .store()
            .del(orphan.side_record_key().as_bytes())
            .await
            .unwrap();

        let scheduler = RefreshScheduler::new(cache.clone(), Duration::from_secs(10));
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.succeeded, 2);

        let refreshed = cache.get::<String>(&soon).await.unwrap().unwrap();
        assert_eq!(refreshed.payload, "fresh soon");
        let untouched = cache.get::<String>(&later).await.unwrap().unwrap();
        assert_eq!(untouched.payload, "stale");

        assert_eq!(cache.index().cardinality(&items()).await.unwrap(), 2);
        assert!(cache
            .index()
            .scan_due_for_refresh(&items(), 12)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(cache.metrics().snapshot().refreshes_ok, 1);
        assert_eq!(cache.metrics().snapshot().refreshes_skipped, 1);
    }

    #[tokio::test]
    async fn test_cached_call_across_cluster() {
        let (_, cache) = managed(ClientConfig::default()).await;
        let entry = RegionEntry::new(items(), json!([5]));
        let mut produced = 0;
        for _ in 0..2 {
            let value: Vec<u64> = cache
                .cached_call(&cache.key("item:5"), 60, Some(&entry), || {
                    produced += 1;
                    async { Ok(vec![5, 5, 5]) }
                })
                .await
                .unwrap();
            assert_eq!(value, vec![5, 5, 5]);
        }
        assert_eq!(produced, 1);
        let page = cache.query(&items(), 1, 5).await.unwrap();
        assert_eq!(page.keys, vec![cache.key("item:5")]);
    }
}
