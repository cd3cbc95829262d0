//! Background refresher
//!
//! Periodically walks the region catalog and refreshes entries of
//! refreshable regions that are about to expire.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::BatchReport;
use super::manager::ManagedCache;
use crate::error::Result;

pub struct RefreshScheduler {
    cache: Arc<ManagedCache>,
    interval: Duration,
}

impl RefreshScheduler {
    pub fn new(cache: Arc<ManagedCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// One sweep over every refreshable region.
    ///
    /// A region that cannot be scanned is skipped; the sweep continues.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        for region in self.cache.list_regions().await? {
            if !region.refresh {
                continue;
            }
            match self.cache.refresh_region(&region.producer, None).await {
                Ok(report) => total.absorb(report),
                Err(e) => warn!("Skipping region {}: {}", region.producer, e),
            }
        }
        if total.submitted > 0 {
            info!(
                refreshed = total.succeeded,
                failed = total.failed,
                timed_out = total.timed_out,
                "Refresh sweep finished"
            );
        }
        Ok(total)
    }

    /// Sweep every interval until cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Refresh scheduler started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!("Refresh sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("Refresh scheduler stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::envelope::{now_ms, CacheEnvelope};
    use crate::cache::refresh::{producer_fn, RefreshRegistry};
    use crate::cache::region::{ProducerId, RegionEntry};
    use crate::cluster::Endpoint;
    use crate::config::{ClientConfig, Mode};
    use crate::transport::InMemoryCluster;
    use futures::FutureExt;
    use serde_json::json;

    async fn cache() -> Arc<ManagedCache> {
        let node = Endpoint::new("127.0.0.1", 6379);
        let cluster = InMemoryCluster::standalone(&node);
        let mut config = ClientConfig::default();
        config.mode = Mode::Standalone;
        config.standalone.address = node.to_string();
        let store = crate::store::connect(&config, cluster.connector())
            .await
            .unwrap();
        ManagedCache::new(store, &config, Arc::new(RefreshRegistry::new()))
    }

    #[tokio::test]
    async fn test_sweep_skips_non_refreshable_regions() {
        let cache = cache().await;
        let live = ProducerId::new("Rates", "fx");
        let fixed = ProducerId::new("Rates", "static");
        cache.registry().register_class(
            live.clone(),
            producer_fn(|_, _| async { Ok(json!(1.1)) }.boxed()),
        );

        let loaded = now_ms() - 58_000;
        let refreshable = RegionEntry::new(live, json!([])).refreshable(None);
        cache
            .put_with_region(&cache.key("eur"), &CacheEnvelope::loaded_at(1.0, loaded, 60), &refreshable)
            .await
            .unwrap();
        let plain = RegionEntry::new(fixed, json!([]));
        cache
            .put_with_region(&cache.key("gbp"), &CacheEnvelope::loaded_at(1.2, loaded, 60), &plain)
            .await
            .unwrap();

        let scheduler = RefreshScheduler::new(cache.clone(), Duration::from_secs(10));
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.succeeded, 1);

        let eur = cache.get::<f64>(&cache.key("eur")).await.unwrap().unwrap();
        assert_eq!(eur.payload, 1.1);
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let cache = cache().await;
        let shutdown = CancellationToken::new();
        let handle = RefreshScheduler::new(cache, Duration::from_millis(10)).spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
