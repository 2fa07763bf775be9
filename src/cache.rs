// src/cache.rs
//
// In-process cache of directory listings, keyed by normalized path, with TTL expiry.
//
// Mutations invalidate the affected directories. Every invalidation also advances a generation
// counter; a listing read from the store is only cached if no invalidation ran while it was being
// read. Entries written by other processes are only picked up once the TTL runs out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::path;
use crate::tree::Entry;

#[derive(Debug, Clone)]
struct CachedListing {
    entries: Arc<Vec<Entry>>,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedListing {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Thread-safe listing cache shared by every request of one `FileService`.
#[derive(Debug)]
pub struct ListingCache {
    cache: RwLock<HashMap<String, CachedListing>>,
    default_ttl: Duration,
    /// Advanced under the write lock by every invalidation.
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Drop `path` and each of its ancestors up to the root.
fn remove_lineage(cache: &mut HashMap<String, CachedListing>, path: &str) {
    let mut current = path;
    loop {
        cache.remove(current);
        if current.is_empty() {
            break;
        }
        current = path::parent(current);
    }
}

impl ListingCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            default_ttl,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cached listing of `path`, or None if absent or expired.
    pub async fn get(&self, path: &str) -> Option<Arc<Vec<Entry>>> {
        let cache = self.cache.read().await;
        match cache.get(path) {
            Some(entry) if !entry.is_expired() => {
                tracing::trace!("listing cache HIT: {:?}", path);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.entries))
            }
            Some(entry) => {
                tracing::trace!(
                    "listing cache EXPIRED: {:?} (age: {:?})",
                    path,
                    entry.cached_at.elapsed()
                );
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                tracing::trace!("listing cache MISS: {:?}", path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a listing with an explicit TTL.
    pub async fn set(&self, path: impl Into<String>, entries: Arc<Vec<Entry>>, ttl: Duration) {
        let path = path.into();
        tracing::trace!("caching listing {:?} ({} entries, ttl {:?})", path, entries.len(), ttl);
        self.cache.write().await.insert(
            path,
            CachedListing {
                entries,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Store a listing with the default TTL.
    pub async fn insert(&self, path: impl Into<String>, entries: Arc<Vec<Entry>>) {
        self.set(path, entries, self.default_ttl).await;
    }

    /// Current invalidation generation. Take it before reading a listing from the store and
    /// hand it to `insert_if_unchanged`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store a listing with the default TTL unless an invalidation ran since `generation` was
    /// taken. Returns whether the listing was stored.
    pub async fn insert_if_unchanged(
        &self,
        path: impl Into<String>,
        entries: Arc<Vec<Entry>>,
        generation: u64,
    ) -> bool {
        let path = path.into();
        let mut cache = self.cache.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("listing {:?} was invalidated while being read; not cached", path);
            return false;
        }
        cache.insert(
            path,
            CachedListing {
                entries,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
        true
    }

    fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn invalidate(&self, path: &str) {
        let mut cache = self.cache.write().await;
        self.advance_generation();
        if cache.remove(path).is_some() {
            tracing::debug!("invalidated listing {:?}", path);
        }
    }

    /// Drop the entries of `path` and of its parent directory.
    pub async fn invalidate_with_parent(&self, path: &str) {
        let parent = path::parent(path);
        let mut cache = self.cache.write().await;
        self.advance_generation();
        cache.remove(path);
        cache.remove(parent);
        tracing::debug!("invalidated listings {:?} and {:?}", path, parent);
    }

    /// Drop `path` and every ancestor up to the root. A write can make directories appear at
    /// any level above it.
    pub async fn invalidate_lineage(&self, path: &str) {
        let mut cache = self.cache.write().await;
        self.advance_generation();
        remove_lineage(&mut cache, path);
        tracing::debug!("invalidated listing {:?} and its ancestors", path);
    }

    /// Drop `path`, everything below it and every ancestor. Used when a whole subtree
    /// disappears or appears at once.
    pub async fn invalidate_subtree(&self, path: &str) {
        let mut cache = self.cache.write().await;
        self.advance_generation();
        if path.is_empty() {
            cache.clear();
            tracing::debug!("invalidated every listing");
            return;
        }
        let prefix = path::dir_prefix(path);
        let before = cache.len();
        cache.retain(|key, _| !key.starts_with(&prefix));
        remove_lineage(&mut cache, path);
        tracing::debug!(
            "invalidated subtree {:?} ({} listings dropped)",
            path,
            before - cache.len()
        );
    }

    /// Remove expired entries. Returns how many were dropped.
    pub async fn clear_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired());
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!("swept {} expired listings ({} remain)", removed, cache.len());
        }
        removed
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        self.advance_generation();
        cache.clear();
        tracing::debug!("cleared listing cache");
    }

    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        CacheStats {
            total_entries: cache.len(),
            expired_entries: cache.values().filter(|e| e.is_expired()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Sweep expired entries every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.clear_expired().await;
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    /// Expired but not yet swept.
    pub expired_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn valid_entries(&self) -> usize {
        self.total_entries - self.expired_entries
    }
}
