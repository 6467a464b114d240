use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::{fetch_collection, ApiError, ParkingApi};
use crate::cache::{CachePort, Snapshot};
use crate::types::CollectionKey;

/// Read-through access to cached collections. Stale or missing collections
/// are fetched through the request layer, one fetch per key at a time.
///
/// Background refreshes are coalesced: a key already being refreshed is
/// skipped, and a key whose last fetch failed waits for an explicit read.
pub struct Refresher {
    cache: Arc<dyn CachePort>,
    api: Arc<dyn ParkingApi>,
    semaphore: Arc<Semaphore>,
    refresh_locks: DashMap<CollectionKey, Arc<Mutex<()>>>,
    in_flight: DashSet<CollectionKey>,
    failed: DashSet<CollectionKey>,
}

impl Refresher {
    pub fn new(cache: Arc<dyn CachePort>, api: Arc<dyn ParkingApi>, concurrency: usize) -> Self {
        Self {
            cache,
            api,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            refresh_locks: DashMap::new(),
            in_flight: DashSet::new(),
            failed: DashSet::new(),
        }
    }

    pub async fn read(&self, key: &CollectionKey) -> Result<Snapshot, ApiError> {
        if let Some(snapshot) = self.fresh(key) {
            debug!(%key, "serving from cache");
            return Ok(snapshot);
        }

        self.fetch_and_cache(key).await
    }

    fn fresh(&self, key: &CollectionKey) -> Option<Snapshot> {
        if self.cache.is_stale(key) {
            return None;
        }
        self.cache.snapshot(key)
    }

    async fn fetch_and_cache(&self, key: &CollectionKey) -> Result<Snapshot, ApiError> {
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        // another reader may have refreshed it while we waited
        if let Some(snapshot) = self.fresh(key) {
            return Ok(snapshot);
        }

        let _permit = self.semaphore.acquire().await;
        let entities = match fetch_collection(self.api.as_ref(), key).await {
            Ok(entities) => entities,
            Err(e) => {
                self.failed.insert(key.clone());
                return Err(e);
            }
        };
        self.failed.remove(key);
        debug!(%key, count = entities.len(), "fetched collection");

        Ok(self.cache.put(key.clone(), entities))
    }

    /// Claims `key` for a background refresh. `false` when one is already
    /// running or the last fetch failed.
    fn claim(&self, key: &CollectionKey) -> bool {
        if self.failed.contains(key) {
            debug!(%key, "last fetch failed, waiting for a reader");
            return false;
        }
        self.in_flight.insert(key.clone())
    }

    /// Background refresh; failures are logged and left for the next read.
    pub async fn refresh(&self, key: &CollectionKey) {
        if let Err(e) = self.fetch_and_cache(key).await {
            warn!(%key, error = %e, "failed to refresh collection");
        }
        self.in_flight.remove(key);
    }
}

pub async fn run_refresh_loop(
    refresher: Arc<Refresher>,
    mut rx: mpsc::UnboundedReceiver<CollectionKey>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            key = rx.recv() => match key {
                Some(key) => {
                    if refresher.claim(&key) {
                        let refresher = refresher.clone();
                        tasks.spawn(async move { refresher.refresh(&key).await });
                    } else {
                        debug!(%key, "refresh coalesced");
                    }
                }
                None => break,
            },
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "refresh task panicked");
                }
            }
        }
    }

    info!("refresh loop stopped");
}
