use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

struct Snapshot<T> {
    taken_at: Instant,
    value: Arc<T>,
}

/// Holds the latest catalog or guide for a while so the api doesn't refetch a multi megabyte
/// guide on every page load.
///
/// A refresh swaps the whole value in one go, readers either see the old snapshot or the new
/// one, never a mix. A failed refresh leaves the old snapshot in place and returns the error.
pub struct SnapshotCache<T> {
    ttl: Duration,
    current: RwLock<Option<Snapshot<T>>>,
    // one refresh at a time, late arrivals pick up the fresh value
    refreshing: Mutex<()>,
}

impl<T: Send + Sync> SnapshotCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            current: RwLock::new(None),
            refreshing: Mutex::new(()),
        }
    }

    async fn fresh(&self) -> Option<Arc<T>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|s| s.taken_at.elapsed() < self.ttl)
            .map(|s| s.value.clone())
    }

    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.fresh().await {
            return Ok(value);
        }

        let _guard = self.refreshing.lock().await;
        if let Some(value) = self.fresh().await {
            return Ok(value);
        }

        debug!("snapshot stale, rebuilding");
        let value = Arc::new(refresh().await?);
        *self.current.write().await = Some(Snapshot {
            taken_at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }

    /// how old the held snapshot is, stale or not
    pub async fn age(&self) -> Option<Duration> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| s.taken_at.elapsed())
    }
}
