//! TTL cache for signaled session state.
//!
//! Signaling installs a pending session here and the data plane collects it
//! when the first connectivity check arrives. Lookups and inserts both
//! refresh the entry; a sweeper task deletes entries whose last touch is
//! older than their TTL. Readers take the shared lock; the timestamp refresh
//! is an atomic store, which is safe because the clock is monotonic and a
//! stale read can at worst postpone eviction by one sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::stats::now_ms;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Upper bound on a caller-supplied TTL.
pub const MAX_TTL: Duration = Duration::from_secs(600);

/// Cadence of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry<V> {
    value: V,
    touched_ms: AtomicU64,
    ttl_ms: u64,
}

impl<V> Entry<V> {
    fn touch(&self) {
        self.touched_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn expired(&self, now: u64) -> bool {
        now >= self.touched_ms.load(Ordering::Relaxed) + self.ttl_ms
    }
}

/// String-keyed TTL cache.
pub struct Cache<V> {
    items: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(default_ttl: Duration) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Fetch a value, refreshing its timer.
    pub async fn get(&self, key: &str) -> Option<V> {
        let items = self.items.read().await;
        items.get(key).map(|entry| {
            entry.touch();
            entry.value.clone()
        })
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with an explicit TTL, clamped to [`MAX_TTL`].
    pub async fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let ttl = if ttl.is_zero() || ttl > MAX_TTL {
            self.default_ttl
        } else {
            ttl
        };
        let entry = Entry {
            value,
            touched_ms: AtomicU64::new(now_ms()),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.items.write().await.insert(key.into(), entry);
    }

    /// Refresh an entry's timer without reading it.
    pub async fn touch(&self, key: &str) -> bool {
        let items = self.items.read().await;
        match items.get(key) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, key: &str) -> Option<V> {
        self.items.write().await.remove(key).map(|e| e.value)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Delete every expired entry. Candidates are collected under the shared
    /// lock; the exclusive lock re-checks before deleting.
    pub async fn sweep(&self) {
        let now = now_ms();
        let expired: Vec<String> = {
            let items = self.items.read().await;
            items
                .iter()
                .filter(|(_, entry)| entry.expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let mut items = self.items.write().await;
        let mut dropped = 0usize;
        for key in expired {
            if items.get(&key).is_some_and(|entry| entry.expired(now)) {
                items.remove(&key);
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(dropped, "cache sweep dropped expired entries");
        }
    }

    /// Run the periodic sweeper until `shutdown` flips.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    debug!("cache sweeper exiting");
                    return;
                }
            }
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_what_set_stored() {
        let cache = Cache::new();
        cache.set("s1:c1", 42u32).await;
        assert_eq!(cache.get("s1:c1").await, Some(42));
        assert_eq!(cache.get("other").await, None);
    }

    #[tokio::test]
    async fn entries_survive_within_ttl() {
        let cache = Cache::with_ttl(Duration::from_millis(80));
        cache.set("k", 1u32).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep().await;
        assert_eq!(cache.get("k").await, Some(1));
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let cache = Cache::with_ttl(Duration::from_millis(30));
        cache.set("k", 1u32).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.sweep().await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn get_resets_the_timer() {
        let cache = Cache::with_ttl(Duration::from_millis(60));
        cache.set("k", 1u32).await;
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            // Each read renews the lease past the original deadline.
            assert_eq!(cache.get("k").await, Some(1));
        }
        cache.sweep().await;
        assert_eq!(cache.get("k").await, Some(1));
    }

    #[tokio::test]
    async fn explicit_ttl_is_clamped() {
        let cache = Cache::with_ttl(Duration::from_millis(40));
        cache.set_with_ttl("k", 1u32, MAX_TTL + Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.sweep().await;
        // Oversized TTL fell back to the default and the entry expired.
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn remove_returns_the_value() {
        let cache = Cache::new();
        cache.set("k", 7u32).await;
        assert_eq!(cache.remove("k").await, Some(7));
        assert_eq!(cache.get("k").await, None);
    }
}
