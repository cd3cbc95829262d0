//! Request-scoped cache context
//!
//! Carries per-request memoized loads and actions deferred until the request
//! succeeds. Pass it explicitly through the request; nothing is stored in
//! thread or task locals.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Deferred = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// State scoped to one request
#[derive(Default)]
pub struct RequestContext {
    memo: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    deferred: Mutex<Vec<Deferred>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `key` at most once per request.
    ///
    /// Failed loads are not memoized. Reusing a key with a different value
    /// type is an error.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, loader: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cached = self.memo.lock().get(key).cloned();
        if let Some(value) = cached {
            return value
                .downcast::<T>()
                .map_err(|_| Error::Internal(format!("request memo {} holds another type", key)));
        }

        let value = Arc::new(loader().await?);
        self.memo
            .lock()
            .insert(key.to_string(), value.clone() as Arc<dyn Any + Send + Sync>);
        Ok(value)
    }

    /// Queue an action to run once the request completes successfully
    pub fn defer<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.deferred
            .lock()
            .push(Box::new(move || action().boxed()));
    }

    pub fn memoized(&self) -> usize {
        self.memo.lock().len()
    }

    /// End the request. Deferred actions run in order only on success; their
    /// failures are logged. Returns how many actions succeeded.
    pub async fn finish(self, success: bool) -> usize {
        let actions = self.deferred.into_inner();
        if !success {
            if !actions.is_empty() {
                debug!("Request failed, dropping {} deferred actions", actions.len());
            }
            return 0;
        }

        let mut completed = 0;
        for action in actions {
            match action().await {
                Ok(()) => completed += 1,
                Err(e) => warn!("Deferred cache action failed: {}", e),
            }
        }
        completed
    }
}
