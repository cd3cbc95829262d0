//! Stored value wrapper

use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A cached value with the time it was loaded and its lifetime.
///
/// `ttl_seconds <= 0` never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope<T> {
    pub payload: T,
    /// Epoch milliseconds
    pub load_time: i64,
    pub ttl_seconds: i64,
}

impl<T> CacheEnvelope<T> {
    /// Envelope loaded now
    pub fn new(payload: T, ttl_seconds: i64) -> Self {
        Self::loaded_at(payload, now_ms(), ttl_seconds)
    }

    pub fn loaded_at(payload: T, load_time: i64, ttl_seconds: i64) -> Self {
        Self {
            payload,
            load_time,
            ttl_seconds,
        }
    }

    pub fn expires(&self) -> bool {
        self.ttl_seconds > 0
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires() && now_ms.saturating_sub(self.load_time) >= self.ttl_ms()
    }

    fn ttl_ms(&self) -> i64 {
        self.ttl_seconds.saturating_mul(1000)
    }

    /// Region index score: expiry time in ms, or `+inf`
    pub fn expiry_score_ms(&self) -> f64 {
        if self.expires() {
            self.load_time.saturating_add(self.ttl_ms()) as f64
        } else {
            f64::INFINITY
        }
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}
