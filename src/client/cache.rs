//! Per-connection cache of `models.list`

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::ModelInfo;

struct Entry {
    generation: u64,
    models: Vec<ModelInfo>,
}

/// Holds the model list fetched on the current connection.
///
/// Every connection teardown bumps the generation, which makes any stored
/// entry stale without touching the lock. Concurrent callers share one fetch.
pub(crate) struct ModelsCache {
    entry: Mutex<Option<Entry>>,
    generation: AtomicU64,
}

impl ModelsCache {
    pub fn new() -> Self {
        Self {
            entry: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Drop whatever is cached
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Models cache invalidated (generation {})", generation);
    }

    /// Return a copy of the cached list, fetching it first if needed.
    /// A fetch that straddles an invalidation is returned but not stored.
    pub async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<Vec<ModelInfo>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ModelInfo>, E>>,
    {
        let mut entry = self.entry.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        if let Some(cached) = entry.as_ref()
            && cached.generation == generation
        {
            return Ok(cached.models.clone());
        }

        let models = fetch().await?;
        *entry = (self.generation.load(Ordering::SeqCst) == generation).then(|| Entry {
            generation,
            models: models.clone(),
        });
        Ok(models)
    }
}
