//! Managed Cache
//!
//! Cache-aside operations over a [`KvStore`]: envelope encoding, hash-field
//! expiry, region bookkeeping, producer-driven refresh and bulk clearing.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::batch::{BatchReport, BatchRunner};
use super::codec::EnvelopeCodec;
use super::envelope::CacheEnvelope;
use super::key::CacheKey;
use super::metrics::CacheMetrics;
use super::refresh::RefreshRegistry;
use super::region::{ProducerId, RegionEntry, RegionIndex, RegionPage, RegionSummary, SideRecord};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::store::KvStore;

/// Result of refreshing one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Recomputed and written back
    Refreshed,
    /// Side record missing or refresh disabled; nothing to do
    NotRefreshable,
    /// Producer missing or failing
    Failed(String),
}

/// Cache-aside layer with a region index
pub struct ManagedCache {
    store: Arc<dyn KvStore>,
    codec: EnvelopeCodec,
    index: RegionIndex,
    registry: Arc<RefreshRegistry>,
    runner: BatchRunner,
    metrics: Arc<CacheMetrics>,
    namespace: String,
    clear_batch: usize,
    refresh_threshold_secs: u64,
}

impl ManagedCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        config: &ClientConfig,
        registry: Arc<RefreshRegistry>,
    ) -> Arc<Self> {
        let region = &config.region;
        Arc::new(Self {
            codec: EnvelopeCodec::new(config.compression.to_config()),
            index: RegionIndex::new(
                store.clone(),
                region.namespace.clone(),
                region.page_size_cap,
                region.side_record_padding_secs,
            ),
            store,
            registry,
            runner: BatchRunner::new(region.concurrency, region.wait_timeout())
                .with_wait(region.wait_for_tasks),
            metrics: Arc::new(CacheMetrics::new()),
            namespace: region.namespace.clone(),
            clear_batch: region.clear_batch.max(1),
            refresh_threshold_secs: region.refresh_threshold_secs,
        })
    }

    /// Plain key in this cache's namespace
    pub fn key(&self, key: impl Into<String>) -> CacheKey {
        CacheKey::new(self.namespace.clone(), key)
    }

    /// Hash-field key in this cache's namespace
    pub fn field_key(&self, key: impl Into<String>, field: impl Into<String>) -> CacheKey {
        CacheKey::with_field(self.namespace.clone(), key, field)
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn index(&self) -> &RegionIndex {
        &self.index
    }

    pub fn registry(&self) -> &Arc<RefreshRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    // =========================================================================
    // Read / Write
    // =========================================================================

    /// Cached envelope for `key`.
    ///
    /// Unreadable values are misses. An expired hash-field entry is deleted
    /// and reported as a miss; plain keys expire through the store's TTL.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<CacheEnvelope<T>>> {
        let started = Instant::now();
        let storage_key = key.storage_key();
        let raw = match key.hfield() {
            Some(field) => {
                self.store
                    .hget(storage_key.as_bytes(), field.as_bytes())
                    .await?
            }
            None => self.store.get(storage_key.as_bytes()).await?,
        };
        self.metrics.record_read_latency(started.elapsed());

        let Some(raw) = raw else {
            self.metrics.record_miss();
            return Ok(None);
        };
        let envelope = match self.codec.try_decode::<T>(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Treating unreadable value at {} as a miss: {}", key, e);
                self.metrics.record_decode_failure();
                self.metrics.record_miss();
                return Ok(None);
            }
        };

        if let Some(field) = key.hfield() {
            if envelope.is_expired() {
                if let Err(e) = self
                    .store
                    .hdel(storage_key.as_bytes(), field.as_bytes())
                    .await
                {
                    warn!("Failed to drop expired field {}: {}", key, e);
                }
                self.metrics.record_expired_field();
                self.metrics.record_miss();
                return Ok(None);
            }
        }

        self.metrics.record_hit();
        Ok(Some(envelope))
    }

    /// Write an envelope.
    ///
    /// Returns `false` when the value could not be encoded and the write was
    /// skipped. Hash fields carry no TTL; expiry is checked on read.
    pub async fn put<T: Serialize>(&self, key: &CacheKey, envelope: &CacheEnvelope<T>) -> Result<bool> {
        let bytes = match self.codec.encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Skipping write of {}: {}", key, e);
                self.metrics.record_dropped_put();
                return Ok(false);
            }
        };

        let storage_key = key.storage_key();
        match key.hfield() {
            Some(field) => {
                self.store
                    .hset(storage_key.as_bytes(), field.as_bytes(), &bytes)
                    .await?
            }
            None if envelope.expires() => {
                self.store
                    .setex(storage_key.as_bytes(), envelope.ttl_seconds as u64, &bytes)
                    .await?
            }
            None => self.store.set(storage_key.as_bytes(), &bytes).await?,
        }
        self.metrics.record_put();
        Ok(true)
    }

    /// Write an envelope and index it under its producer when it expires
    pub async fn put_with_region<T: Serialize>(
        &self,
        key: &CacheKey,
        envelope: &CacheEnvelope<T>,
        entry: &RegionEntry,
    ) -> Result<bool> {
        if !self.put(key, envelope).await? {
            return Ok(false);
        }
        if envelope.expires() {
            let record = entry.side_record(envelope.ttl_seconds);
            self.index.record(key, &record, envelope.load_time).await?;
        }
        Ok(true)
    }

    /// Delete a value and its index entry. Deleting an absent key is a no-op.
    pub async fn del(&self, key: &CacheKey) -> Result<bool> {
        let storage_key = key.storage_key();
        let removed = match key.hfield() {
            Some(field) => {
                self.store
                    .hdel(storage_key.as_bytes(), field.as_bytes())
                    .await?
            }
            None => self.store.del(storage_key.as_bytes()).await?,
        };
        self.index.remove(key).await?;
        self.metrics.record_delete();
        Ok(removed > 0)
    }

    /// Increment a plain counter key; `None` for hash-field keys
    pub async fn incr(&self, key: &CacheKey) -> Result<Option<i64>> {
        if key.hfield().is_some() {
            return Ok(None);
        }
        self.store.incr(key.storage_key().as_bytes()).await
    }

    pub async fn decr(&self, key: &CacheKey) -> Result<Option<i64>> {
        if key.hfield().is_some() {
            return Ok(None);
        }
        self.store.decr(key.storage_key().as_bytes()).await
    }

    /// Reset a plain key's TTL; always `false` for hash-field keys
    pub async fn expire(&self, key: &CacheKey, seconds: u64) -> Result<bool> {
        if key.hfield().is_some() {
            return Ok(false);
        }
        self.store.expire(key.storage_key().as_bytes(), seconds).await
    }

    /// Cache-aside call: cached value if present, else `producer` and write back.
    ///
    /// A failed cache read still calls the producer but skips the write.
    /// Producer errors are returned unchanged.
    pub async fn cached_call<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl_seconds: i64,
        entry: Option<&RegionEntry>,
        producer: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let write_back = match self.get::<T>(key).await {
            Ok(Some(envelope)) => return Ok(envelope.into_payload()),
            Ok(None) => true,
            Err(e) => {
                warn!("Cache read of {} failed, bypassing cache: {}", key, e);
                false
            }
        };

        let value = producer().await?;
        if !write_back {
            return Ok(value);
        }

        let envelope = CacheEnvelope::new(value, ttl_seconds);
        let written = match entry {
            Some(entry) => self.put_with_region(key, &envelope, entry).await,
            None => self.put(key, &envelope).await,
        };
        if let Err(e) = written {
            warn!("Cache write of {} failed: {}", key, e);
        }
        Ok(envelope.into_payload())
    }

    // =========================================================================
    // Regions
    // =========================================================================

    pub async fn list_regions(&self) -> Result<Vec<RegionSummary>> {
        self.index.list_regions().await
    }

    pub async fn query(&self, producer: &ProducerId, page: usize, page_size: usize) -> Result<RegionPage> {
        self.index.query(producer, page, page_size).await
    }

    /// Recompute `key` with its recorded producer and write it back.
    ///
    /// Any key with a readable side record is refreshed; the record's
    /// `refresh` flag only selects regions for the background sweep.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn refresh(&self, key: &CacheKey) -> RefreshOutcome {
        let record = match self.index.load_side_record(key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                if let Err(e) = self.index.purge(key).await {
                    warn!("Failed to purge index entries of {}: {}", key, e);
                }
                self.metrics.record_refresh_skipped();
                return RefreshOutcome::NotRefreshable;
            }
            Err(e) => {
                self.metrics.record_refresh_failed();
                return RefreshOutcome::Failed(e.to_string());
            }
        };
        match self.recompute(key, record).await {
            Ok(()) => {
                self.metrics.record_refresh_ok();
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                warn!("Refresh of {} failed: {}", key, e);
                self.metrics.record_refresh_failed();
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }

    async fn recompute(&self, key: &CacheKey, record: SideRecord) -> Result<()> {
        let producer = self
            .registry
            .resolve(record.producer_ref.as_deref(), &record.producer)
            .ok_or_else(|| Error::InvokerNotFound {
                owner: record
                    .producer_ref
                    .clone()
                    .unwrap_or_else(|| record.producer.class.clone()),
                method: record.producer.method.clone(),
            })?;

        let value = producer
            .produce(key, &record.args)
            .await
            .map_err(|e| Error::RefreshFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let envelope = CacheEnvelope::new(value, record.ttl_seconds);
        let entry = RegionEntry::from(record);
        if !self.put_with_region(key, &envelope, &entry).await? {
            return Err(Error::Serialization(format!("refreshed value of {} not encodable", key)));
        }
        Ok(())
    }

    /// Refresh every key of a region expiring within `within_secs`
    /// (the configured threshold when `None`)
    #[instrument(skip(self), fields(region = %producer))]
    pub async fn refresh_region(
        self: &Arc<Self>,
        producer: &ProducerId,
        within_secs: Option<u64>,
    ) -> Result<BatchReport> {
        let window = within_secs.unwrap_or(self.refresh_threshold_secs);
        let due = self.index.scan_due_for_refresh(producer, window).await?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }
        debug!("{} keys of {} due for refresh", due.len(), producer);

        let cache = self.clone();
        let report = self
            .runner
            .run(due, move |key| {
                let cache = cache.clone();
                async move {
                    match cache.refresh(&key).await {
                        RefreshOutcome::Failed(reason) => Err(Error::RefreshFailed {
                            key: key.to_string(),
                            reason,
                        }),
                        _ => Ok(()),
                    }
                }
            })
            .await;
        Ok(report)
    }

    /// Delete every key of a region, draining it in bounded passes
    #[instrument(skip(self), fields(region = %producer))]
    pub async fn clear_region(self: &Arc<Self>, producer: &ProducerId) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        let mut progress = DrainProgress::default();
        loop {
            let before = self.index.cardinality(producer).await?;
            if before == 0 {
                break;
            }
            let members = self
                .index
                .members(producer, 0, self.clear_batch as i64 - 1)
                .await?;
            if members.is_empty() {
                break;
            }

            let keys: Vec<CacheKey> = members
                .iter()
                .filter_map(|m| CacheKey::from_member(m).ok())
                .collect();
            let cache = self.clone();
            let report = self
                .runner
                .run(keys, move |key| {
                    let cache = cache.clone();
                    async move { cache.del(&key).await.map(|_| ()) }
                })
                .await;
            total.absorb(report);

            // Members whose delete failed or timed out must not stall the drain
            self.index.remove_raw_members(producer, &members).await?;

            let after = self.index.cardinality(producer).await?;
            if progress.stalled_after(before, after) {
                warn!(
                    remaining = after,
                    "Region {} did not shrink in {} passes, stopping",
                    producer,
                    MAX_STALLED_CLEAR_PASSES
                );
                break;
            }
        }
        info!(
            deleted = total.succeeded,
            failed = total.failed + total.timed_out,
            "Cleared region {}",
            producer
        );
        Ok(total)
    }
}

/// Passes in a row that may leave a region no smaller before clearing stops
const MAX_STALLED_CLEAR_PASSES: usize = 3;

/// Tracks whether a region drain is keeping up with concurrent writers
#[derive(Debug, Default)]
struct DrainProgress {
    stalled: usize,
}

impl DrainProgress {
    /// Record one pass; true once too many passes in a row made no progress
    fn stalled_after(&mut self, before: u64, after: u64) -> bool {
        if after < before {
            self.stalled = 0;
            return false;
        }
        self.stalled += 1;
        self.stalled >= MAX_STALLED_CLEAR_PASSES
    }
}
