//! Time-to-live keyed cache.
//!
//! Entries expire lazily: a read of an expired entry reports a miss without
//! touching the map. Physical removal happens only in [`TtlCache::sweep`],
//! which a supervised background task runs on a fixed period.
//!
//! The same type backs credential memoization, identity-handle resolution and
//! playback session tracking.

use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default period between background sweeps.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expired_at: Instant,
}

/// A concurrent map whose entries expire `ttl` after they were written.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache whose writes live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// The lifetime given to every write.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The value for `key`, unless it is absent or expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| Instant::now() < entry.expired_at)
            .map(|entry| entry.value.clone())
    }

    /// Insert or overwrite `key`, expiring `ttl` from now.
    pub fn set(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            expired_at: Instant::now() + self.ttl,
        };
        self.entries.write().insert(key, entry);
    }

    /// Remove `key` if present.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.write().remove(key);
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expired_at);
        before - entries.len()
    }

    /// Number of physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Start sweeping this cache every `period` on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, name: &'static str, period: Duration) -> SweeperHandle {
        let cache = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(cache = name, removed, "swept expired entries");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        SweeperHandle {
            stop_tx,
            task: Some(task),
        }
    }
}

/// Handle to a running sweeper task.
///
/// Dropping the handle without calling [`SweeperHandle::stop`] aborts the task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the sweeper to exit and wait for it.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
