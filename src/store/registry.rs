//! Process-wide store registry
//!
//! Stores are shared by `name@mode`. The registry is explicitly shut down,
//! which closes every store and its pools.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::KvStore;
use crate::config::{ClientConfig, Mode};
use crate::error::Result;
use crate::transport::Connector;

static GLOBAL: Lazy<StoreRegistry> = Lazy::new(StoreRegistry::new);

/// Named stores, created on first use
#[derive(Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Arc<dyn KvStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process
    pub fn global() -> &'static StoreRegistry {
        &GLOBAL
    }

    fn registry_key(name: &str, mode: Mode) -> String {
        format!("{}@{}", name, mode)
    }

    pub fn get(&self, name: &str, mode: Mode) -> Option<Arc<dyn KvStore>> {
        self.stores
            .get(&Self::registry_key(name, mode))
            .map(|s| s.value().clone())
    }

    /// Existing store for `name`, or the one built by `init`.
    ///
    /// Two racing callers may both run `init`; the loser's store is closed
    /// and the winner's is returned to both.
    pub async fn get_or_init<F, Fut>(&self, name: &str, mode: Mode, init: F) -> Result<Arc<dyn KvStore>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn KvStore>>>,
    {
        let key = Self::registry_key(name, mode);
        if let Some(store) = self.stores.get(&key) {
            return Ok(store.value().clone());
        }

        let created = init().await?;
        let winner = self
            .stores
            .entry(key.clone())
            .or_insert_with(|| created.clone())
            .value()
            .clone();
        if !Arc::ptr_eq(&winner, &created) {
            debug!("Store {} initialised concurrently, dropping duplicate", key);
            created.close().await;
        } else {
            info!("Registered store {}", key);
        }
        Ok(winner)
    }

    /// [`get_or_init`](Self::get_or_init) with [`super::connect`]
    pub async fn get_or_connect(
        &self,
        name: &str,
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<dyn KvStore>> {
        self.get_or_init(name, config.mode, || super::connect(config, connector))
            .await
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Close and forget every store. Returns how many were closed.
    pub async fn shutdown(&self) -> usize {
        let keys: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, store)) = self.stores.remove(&key) {
                store.close().await;
                closed += 1;
            }
        }
        info!("Store registry shut down, {} stores closed", closed);
        closed
    }
}
