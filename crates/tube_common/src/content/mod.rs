//! Content cache - stitch content keyed by unit id.
//!
//! Reads use `peek`, so entries are never promoted and the LRU end of the map
//! is simply the oldest insertion. Eviction drops a fraction of the oldest
//! entries once the map grows past its limit; it is approximate by intent,
//! not a strict LRU.

pub mod fetcher;
pub mod worker;

pub use fetcher::{ContentFetcher, FakeContentFetcher, HttpContentFetcher, NullContentFetcher};
pub use worker::{ContentWorker, WorkerAction, WorkerClient, WorkerRequest, WorkerResponse};

use lru::LruCache;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{CacheConfig, ProgressionConfig};
use crate::error::Result;
use crate::progression;
use crate::types::{LearningState, StitchContent};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub worker_enabled: bool,
    pub worker_fallbacks: u64,
}

struct CacheInner {
    config: CacheConfig,
    entries: Mutex<LruCache<String, StitchContent>>,
    fetcher: Arc<dyn ContentFetcher>,
    worker: Option<WorkerClient>,
    hits: AtomicU64,
    misses: AtomicU64,
    worker_fallbacks: AtomicU64,
}

#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<CacheInner>,
}

impl ContentCache {
    /// Build the cache. The worker is started only when enabled and a tokio
    /// runtime is available; otherwise every fetch goes direct.
    pub fn new(config: CacheConfig, fetcher: Arc<dyn ContentFetcher>) -> Self {
        let worker = if config.worker_enabled {
            match Handle::try_current() {
                Ok(_) => Some(ContentWorker::spawn(Arc::clone(&fetcher), config.worker_timeout())),
                Err(_) => {
                    warn!("No async runtime, content worker disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: Mutex::new(LruCache::unbounded()),
                fetcher,
                worker,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                worker_fallbacks: AtomicU64::new(0),
            }),
        }
    }

    /// Cached content, or fetch it and cache the result
    pub async fn get(&self, id: &str) -> Result<StitchContent> {
        if let Some(hit) = self.peek(id) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        let content = match &self.inner.worker {
            Some(worker) => match worker.fetch_stitch(id).await {
                Ok(content) => content,
                Err(e) => {
                    self.inner.worker_fallbacks.fetch_add(1, Ordering::Relaxed);
                    debug!(id, error = %e, "Worker fetch failed, fetching directly");
                    self.inner.fetcher.fetch_one(id).await?
                }
            },
            None => self.inner.fetcher.fetch_one(id).await?,
        };

        self.insert(content.clone());
        Ok(content)
    }

    /// Fetch the uncached ids among `ids` in the background.
    ///
    /// Returns `None` when everything is already cached (or no runtime is
    /// available); nothing is fetched in that case.
    pub fn prefetch(&self, ids: &[String]) -> Option<JoinHandle<()>> {
        let wanted: Vec<String> = {
            let entries = self.entries();
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| !entries.contains(id.as_str()) && seen.insert(id.as_str()))
                .cloned()
                .collect()
        };
        if wanted.is_empty() {
            return None;
        }

        let handle = Handle::try_current().ok()?;
        let cache = self.clone();
        Some(handle.spawn(async move {
            match cache.fetch_batch(&wanted).await {
                Ok(stitches) => {
                    debug!(requested = wanted.len(), received = stitches.len(), "Prefetch complete");
                    for stitch in stitches {
                        cache.insert(stitch);
                    }
                }
                Err(e) => debug!(error = %e, "Prefetch failed"),
            }
        }))
    }

    /// Prefetch each slot's ready unit and the positions right behind it
    pub fn prefetch_for_state(&self, state: &LearningState, rules: &ProgressionConfig) -> Option<JoinHandle<()>> {
        let ids = progression::upcoming_unit_ids(state, self.inner.config.prefetch_lookahead, rules);
        self.prefetch(&ids)
    }

    /// Drop the oldest `ceil(len * evict_fraction)` entries once the cache
    /// holds more than `max_entries`. Returns how many were dropped.
    pub fn evict_old(&self) -> usize {
        let mut entries = self.entries();
        let len = entries.len();
        if len <= self.inner.config.max_entries {
            return 0;
        }

        let target = ((len as f64) * self.inner.config.evict_fraction).ceil() as usize;
        let mut dropped = 0;
        while dropped < target && entries.pop_lru().is_some() {
            dropped += 1;
        }
        debug!(dropped, remaining = entries.len(), "Evicted old content");
        dropped
    }

    pub fn cache_status(&self) -> CacheStatus {
        CacheStatus {
            entries: self.len(),
            max_entries: self.inner.config.max_entries,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            worker_enabled: self.inner.worker.is_some(),
            worker_fallbacks: self.inner.worker_fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert without fetching (hydration from a bundle, tests)
    pub fn insert(&self, content: StitchContent) {
        self.entries().put(content.id.clone(), content);
        self.evict_old();
    }

    fn peek(&self, id: &str) -> Option<StitchContent> {
        self.entries().peek(id).cloned()
    }

    async fn fetch_batch(&self, ids: &[String]) -> Result<Vec<StitchContent>> {
        if let Some(worker) = &self.inner.worker {
            match worker.fetch_batch(ids).await {
                Ok(stitches) => return Ok(stitches),
                Err(e) => {
                    self.inner.worker_fallbacks.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Worker batch failed, fetching directly");
                }
            }
        }
        self.inner.fetcher.fetch_batch(ids).await
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, StitchContent>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stitch(id: &str) -> StitchContent {
        StitchContent {
            id: id.to_string(),
            thread_id: None,
            title: None,
            questions: Vec::new(),
        }
    }

    fn small_cache(max_entries: usize) -> ContentCache {
        let config = CacheConfig {
            max_entries,
            worker_enabled: false,
            ..CacheConfig::default()
        };
        ContentCache::new(config, Arc::new(FakeContentFetcher::serving_any()))
    }

    #[test]
    fn test_eviction_drops_oldest_insertions() {
        let cache = small_cache(10);
        for i in 0..11 {
            cache.insert(stitch(&format!("s{}", i)));
        }
        // 11 > 10, ceil(11 * 0.2) = 3 dropped
        assert_eq!(cache.len(), 8);
        assert!(!cache.contains("s0"));
        assert!(!cache.contains("s2"));
        assert!(cache.contains("s3"));
        assert!(cache.contains("s10"));
    }

    #[tokio::test]
    async fn test_reads_do_not_promote() {
        let cache = small_cache(3);
        for id in ["a", "b", "c"] {
            cache.insert(stitch(id));
        }
        cache.get("a").await.unwrap();
        cache.insert(stitch("d"));
        assert!(!cache.contains("a"));
        assert!(cache.contains("d"));
    }

    #[tokio::test]
    async fn test_hit_and_miss_counters() {
        let cache = small_cache(10);
        cache.get("x").await.unwrap();
        cache.get("x").await.unwrap();
        let status = cache.cache_status();
        assert_eq!(status.misses, 1);
        assert_eq!(status.hits, 1);
        assert!(!status.worker_enabled);
    }
}
