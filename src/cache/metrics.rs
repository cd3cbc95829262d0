//! Cache Metrics Collection
//!
//! Counters for monitoring the managed cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Reads
    hits: AtomicU64,
    misses: AtomicU64,
    decode_failures: AtomicU64,
    expired_field_evictions: AtomicU64,

    // Writes
    puts: AtomicU64,
    dropped_puts: AtomicU64,
    deletes: AtomicU64,

    // Refresh
    refreshes_ok: AtomicU64,
    refreshes_failed: AtomicU64,
    refreshes_skipped: AtomicU64,

    // Read latency (microseconds, exponential moving average)
    read_latency_us: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Stored bytes that could not be decoded (counted as a miss too)
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired_field(&self) {
        self.expired_field_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Write skipped because the value could not be encoded
    pub fn record_dropped_put(&self) {
        self.dropped_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_ok(&self) {
        self.refreshes_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failed(&self) {
        self.refreshes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_skipped(&self) {
        self.refreshes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.read_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .read_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            expired_field_evictions: self.expired_field_evictions.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            dropped_puts: self.dropped_puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            refreshes_ok: self.refreshes_ok.load(Ordering::Relaxed),
            refreshes_failed: self.refreshes_failed.load(Ordering::Relaxed),
            refreshes_skipped: self.refreshes_skipped.load(Ordering::Relaxed),
            read_latency_us: self.read_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.decode_failures,
            &self.expired_field_evictions,
            &self.puts,
            &self.dropped_puts,
            &self.deletes,
            &self.refreshes_ok,
            &self.refreshes_failed,
            &self.refreshes_skipped,
            &self.read_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub decode_failures: u64,
    pub expired_field_evictions: u64,
    pub puts: u64,
    pub dropped_puts: u64,
    pub deletes: u64,
    pub refreshes_ok: u64,
    pub refreshes_failed: u64,
    pub refreshes_skipped: u64,
    pub read_latency_us: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.read_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_read_latency(Duration::from_micros(200));
        let latency = metrics.read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_put();
        metrics.record_dropped_put();
        metrics.record_refresh_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.puts, 1);
        assert_eq!(snapshot.dropped_puts, 1);
        assert_eq!(snapshot.refreshes_failed, 1);
        assert_eq!(snapshot.hit_ratio, 0.0);

        metrics.reset();
        assert_eq!(metrics.snapshot().puts, 0);
    }
}
