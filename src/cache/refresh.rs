//! Refresh invoker registry
//!
//! Producers register under an explicit name or under their class. A refresh
//! resolves the producer recorded in the side record, preferring the name,
//! and caches the outcome, including "not found".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::key::CacheKey;
use super::region::ProducerId;
use crate::error::Result;

/// Recomputes a cached value from the arguments it was first produced with
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, key: &CacheKey, args: &Value) -> Result<Value>;
}

struct FnProducer<F>(F);

#[async_trait]
impl<F> Producer for FnProducer<F>
where
    F: Fn(CacheKey, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    async fn produce(&self, key: &CacheKey, args: &Value) -> Result<Value> {
        (self.0)(key.clone(), args.clone()).await
    }
}

/// Wrap a closure as a [`Producer`]
///
/// ```
/// use futures::FutureExt;
/// use slotcache::cache::producer_fn;
///
/// let doubler = producer_fn(|_key, args| {
///     async move { Ok(serde_json::json!(args[0].as_i64().unwrap_or(0) * 2)) }.boxed()
/// });
/// # let _ = doubler;
/// ```
pub fn producer_fn<F>(f: F) -> Arc<dyn Producer>
where
    F: Fn(CacheKey, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
{
    Arc::new(FnProducer(f))
}

/// Lookup for producers that were not registered up front
pub trait ProducerResolver: Send + Sync {
    /// `name` is either a producer reference or a class name
    fn resolve(&self, name: &str, method: &str) -> Option<Arc<dyn Producer>>;
}

type ResolutionKey = (Option<String>, ProducerId);

/// Registered producers plus a cache of past resolutions
#[derive(Default)]
pub struct RefreshRegistry {
    by_ref: DashMap<(String, String), Arc<dyn Producer>>,
    by_class: DashMap<ProducerId, Arc<dyn Producer>>,
    resolvers: RwLock<Vec<Arc<dyn ProducerResolver>>>,
    resolved: DashMap<ResolutionKey, Option<Arc<dyn Producer>>>,
    lookups: AtomicU64,
}

impl RefreshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under an explicit producer name
    pub fn register(&self, name: impl Into<String>, method: impl Into<String>, producer: Arc<dyn Producer>) {
        self.by_ref.insert((name.into(), method.into()), producer);
        self.resolved.clear();
    }

    /// Register under the producer's class
    pub fn register_class(&self, id: ProducerId, producer: Arc<dyn Producer>) {
        self.by_class.insert(id, producer);
        self.resolved.clear();
    }

    pub fn register_resolver(&self, resolver: Arc<dyn ProducerResolver>) {
        self.resolvers.write().push(resolver);
        self.resolved.clear();
    }

    /// Producer for a side record's `(producer_ref, class, method)`
    pub fn resolve(&self, producer_ref: Option<&str>, id: &ProducerId) -> Option<Arc<dyn Producer>> {
        let cache_key = (producer_ref.map(str::to_string), id.clone());
        if let Some(hit) = self.resolved.get(&cache_key) {
            return hit.value().clone();
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = producer_ref
            .and_then(|name| self.lookup_named(name, &id.method))
            .or_else(|| self.lookup_class(id));
        if found.is_none() {
            debug!("No producer for {} (ref {:?})", id, producer_ref);
        }
        self.resolved.insert(cache_key, found.clone());
        found
    }

    fn lookup_named(&self, name: &str, method: &str) -> Option<Arc<dyn Producer>> {
        if let Some(p) = self.by_ref.get(&(name.to_string(), method.to_string())) {
            return Some(p.value().clone());
        }
        self.from_resolvers(name, method)
    }

    fn lookup_class(&self, id: &ProducerId) -> Option<Arc<dyn Producer>> {
        if let Some(p) = self.by_class.get(id) {
            return Some(p.value().clone());
        }
        self.from_resolvers(&id.class, &id.method)
    }

    fn from_resolvers(&self, name: &str, method: &str) -> Option<Arc<dyn Producer>> {
        self.resolvers
            .read()
            .iter()
            .find_map(|r| r.resolve(name, method))
    }

    /// Uncached resolutions performed so far
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}
