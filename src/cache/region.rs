//! Region index
//!
//! A region is every cached value produced by one producer (class + method
//! signature) within a namespace. Three structures track it in the store:
//!
//! ```text
//! {ns:}$KEY:{key}[:{field}]    side record  (ttl, refresh, ref, class, method, args)
//! {ns:}{class}:{method}        sorted set   member = key, score = expiry ms
//! {ns:}REGIONS                 hash         field = region key, value = [refresh][ttl u32 LE]
//! ```
//!
//! Only expiring values are indexed. Side records outlive their value by a
//! padding so a refresh scan near expiry can still find the producer args.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::envelope::now_ms;
use super::key::{prefixed, CacheKey};
use crate::error::{Error, Result};
use crate::store::KvStore;

/// Lower bound of refresh scans (2016-05-01T00:00:00Z)
pub const EPOCH_FLOOR_MS: i64 = 1_462_060_800_000;

const CATALOG_SUFFIX: &str = "REGIONS";

// =============================================================================
// Types
// =============================================================================

/// Identity of a producer: class and method signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub class: String,
    pub method: String,
}

impl ProducerId {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }
}

impl std::fmt::Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.class, self.method)
    }
}

/// Where a cached value came from, written next to the value
#[derive(Debug, Clone, PartialEq)]
pub struct SideRecord {
    pub ttl_seconds: i64,
    pub refresh: bool,
    /// Explicit producer name, preferred over the class when resolving
    pub producer_ref: Option<String>,
    pub producer: ProducerId,
    /// Arguments the producer was called with
    pub args: Value,
}

type SideRecordTuple = (i64, bool, Option<String>, String, String, Value);

impl SideRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let tuple: SideRecordTuple = (
            self.ttl_seconds,
            self.refresh,
            self.producer_ref.clone(),
            self.producer.class.clone(),
            self.producer.method.clone(),
            self.args.clone(),
        );
        Ok(serde_json::to_vec(&tuple)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let (ttl_seconds, refresh, producer_ref, class, method, args): SideRecordTuple =
            serde_json::from_slice(raw)?;
        Ok(Self {
            ttl_seconds,
            refresh,
            producer_ref,
            producer: ProducerId { class, method },
            args,
        })
    }
}

/// Producer details attached to a value when it is written
#[derive(Debug, Clone, PartialEq)]
pub struct RegionEntry {
    pub producer: ProducerId,
    pub refresh: bool,
    pub producer_ref: Option<String>,
    pub args: Value,
}

impl RegionEntry {
    /// Entry that is indexed but not refreshed in the background
    pub fn new(producer: ProducerId, args: Value) -> Self {
        Self {
            producer,
            refresh: false,
            producer_ref: None,
            args,
        }
    }

    /// Enable background refresh, optionally through a named producer
    pub fn refreshable(mut self, producer_ref: Option<String>) -> Self {
        self.refresh = true;
        self.producer_ref = producer_ref;
        self
    }

    pub fn side_record(&self, ttl_seconds: i64) -> SideRecord {
        SideRecord {
            ttl_seconds,
            refresh: self.refresh,
            producer_ref: self.producer_ref.clone(),
            producer: self.producer.clone(),
            args: self.args.clone(),
        }
    }
}

impl From<SideRecord> for RegionEntry {
    fn from(record: SideRecord) -> Self {
        Self {
            producer: record.producer,
            refresh: record.refresh,
            producer_ref: record.producer_ref,
            args: record.args,
        }
    }
}

/// One entry of the region catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionSummary {
    pub namespace: String,
    pub producer: ProducerId,
    pub refresh: bool,
    pub ttl_seconds: u32,
    /// Sorted set holding the region's keys
    pub region_key: String,
}

/// One page of a region query
#[derive(Debug, Clone, PartialEq)]
pub struct RegionPage {
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    pub keys: Vec<CacheKey>,
}

fn catalog_value(refresh: bool, ttl_seconds: i64) -> [u8; 5] {
    let ttl = ttl_seconds.clamp(0, u32::MAX as i64) as u32;
    let mut value = [0u8; 5];
    value[0] = refresh as u8;
    value[1..].copy_from_slice(&ttl.to_le_bytes());
    value
}

fn parse_catalog_value(raw: &[u8]) -> Option<(bool, u32)> {
    if raw.len() != 5 {
        return None;
    }
    let ttl = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
    Some((raw[0] != 0, ttl))
}

// =============================================================================
// Region Index
// =============================================================================

/// Secondary index over cached values, grouped by producer
pub struct RegionIndex {
    store: Arc<dyn KvStore>,
    namespace: String,
    page_size_cap: usize,
    side_record_padding_secs: u64,
}

impl RegionIndex {
    pub fn new(
        store: Arc<dyn KvStore>,
        namespace: impl Into<String>,
        page_size_cap: usize,
        side_record_padding_secs: u64,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            page_size_cap: page_size_cap.max(1),
            side_record_padding_secs,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `{ns:}{class}:{method}`
    pub fn region_key(&self, producer: &ProducerId) -> String {
        prefixed(&self.namespace, &producer.to_string())
    }

    /// `{ns:}REGIONS`
    pub fn catalog_key(&self) -> String {
        prefixed(&self.namespace, CATALOG_SUFFIX)
    }

    /// Index a freshly written value.
    ///
    /// Values that never expire are not indexed.
    pub async fn record(&self, key: &CacheKey, record: &SideRecord, load_time_ms: i64) -> Result<()> {
        if record.ttl_seconds <= 0 {
            return Ok(());
        }

        let side = record.to_bytes()?;
        let side_ttl = (record.ttl_seconds as u64).saturating_add(self.side_record_padding_secs);
        self.store
            .setex(key.side_record_key().as_bytes(), side_ttl, &side)
            .await?;

        let region_key = self.region_key(&record.producer);
        let score = load_time_ms.saturating_add(record.ttl_seconds.saturating_mul(1000)) as f64;
        self.store
            .zadd(region_key.as_bytes(), score, &key.to_member())
            .await?;

        self.store
            .hset(
                self.catalog_key().as_bytes(),
                region_key.as_bytes(),
                &catalog_value(record.refresh, record.ttl_seconds),
            )
            .await?;
        Ok(())
    }

    /// Side record of `key`; a malformed record reads as absent
    pub async fn load_side_record(&self, key: &CacheKey) -> Result<Option<SideRecord>> {
        let Some(raw) = self.store.get(key.side_record_key().as_bytes()).await? else {
            return Ok(None);
        };
        match SideRecord::from_bytes(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Malformed side record for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Drop `key` from its region. Returns `false` when it had no side record.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let record = self.load_side_record(key).await?;
        self.store.del(key.side_record_key().as_bytes()).await?;
        match record {
            Some(record) => {
                self.remove_member(&record.producer, key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn remove_member(&self, producer: &ProducerId, key: &CacheKey) -> Result<()> {
        self.store
            .zrem(self.region_key(producer).as_bytes(), &key.to_member())
            .await?;
        Ok(())
    }

    /// Remove `key` from every catalogued region, for when its side record is gone
    pub async fn purge(&self, key: &CacheKey) -> Result<usize> {
        let member = key.to_member();
        let mut removed = 0;
        for region in self.list_regions().await? {
            removed += self
                .store
                .zrem(region.region_key.as_bytes(), &member)
                .await? as usize;
        }
        if removed > 0 {
            debug!("Purged dangling index entries for {}", key);
        }
        Ok(removed)
    }

    /// Every region in the catalog, sorted by producer
    pub async fn list_regions(&self) -> Result<Vec<RegionSummary>> {
        let prefix = prefixed(&self.namespace, "");
        let mut regions = Vec::new();
        for (field, value) in self.store.hgetall(self.catalog_key().as_bytes()).await? {
            let region_key = String::from_utf8_lossy(&field).into_owned();
            let parsed = region_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.split_once(':'))
                .zip(parse_catalog_value(&value));
            match parsed {
                Some(((class, method), (refresh, ttl_seconds))) => regions.push(RegionSummary {
                    namespace: self.namespace.clone(),
                    producer: ProducerId::new(class, method),
                    refresh,
                    ttl_seconds,
                    region_key,
                }),
                None => warn!("Skipping unreadable catalog entry {}", region_key),
            }
        }
        regions.sort_by(|a, b| a.producer.cmp(&b.producer));
        Ok(regions)
    }

    pub async fn cardinality(&self, producer: &ProducerId) -> Result<u64> {
        self.store.zcard(self.region_key(producer).as_bytes()).await
    }

    /// Page through a region, soonest expiry first.
    ///
    /// `page` starts at 1; the page size is capped.
    pub async fn query(
        &self,
        producer: &ProducerId,
        page: usize,
        page_size: usize,
    ) -> Result<RegionPage> {
        if page == 0 {
            return Err(Error::Config("page numbers start at 1".into()));
        }
        let page_size = page_size.clamp(1, self.page_size_cap);
        let total = self.cardinality(producer).await?;
        // Pages past the end, or beyond what a rank can address, are empty
        let window = (page - 1)
            .checked_mul(page_size)
            .and_then(|start| i64::try_from(start).ok())
            .filter(|start| (*start as u64) < total)
            .map(|start| (start, start.saturating_add(page_size as i64 - 1)));
        let keys = match window {
            Some((start, stop)) => decode_members(self.members(producer, start, stop).await?),
            None => Vec::new(),
        };
        Ok(RegionPage {
            total,
            page,
            page_size,
            keys,
        })
    }

    /// Raw members by rank, both ends inclusive
    pub async fn members(&self, producer: &ProducerId, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        self.store
            .zrange(self.region_key(producer).as_bytes(), start, stop)
            .await
    }

    pub async fn remove_raw_members(&self, producer: &ProducerId, members: &[Bytes]) -> Result<()> {
        let region_key = self.region_key(producer);
        for member in members {
            self.store.zrem(region_key.as_bytes(), member).await?;
        }
        Ok(())
    }

    /// Keys expiring within `within_secs` from now
    pub async fn scan_due_for_refresh(
        &self,
        producer: &ProducerId,
        within_secs: u64,
    ) -> Result<Vec<CacheKey>> {
        let window_ms = i64::try_from(within_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let max = now_ms().saturating_add(window_ms);
        let members = self
            .store
            .zrange_by_score(
                self.region_key(producer).as_bytes(),
                EPOCH_FLOOR_MS as f64,
                max as f64,
            )
            .await?;
        Ok(decode_members(members))
    }
}

fn decode_members(members: Vec<Bytes>) -> Vec<CacheKey> {
    members
        .into_iter()
        .filter_map(|m| match CacheKey::from_member(&m) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Skipping unreadable region member: {}", e);
                None
            }
        })
        .collect()
}
