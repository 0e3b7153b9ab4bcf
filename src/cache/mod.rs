//! Keyed fetch cache with in-flight deduplication
//!
//! - Fresh entries are served without touching the producer
//! - Concurrent callers for the same key share one producer run
//! - `force_refresh` skips the cache read but still joins an in-flight run
//! - `started_after` only accepts entries and runs whose producer started at
//!   or after the given instant
//! - Entries are immutable once written and replaced wholesale
//!
//! The producer runs on its own task, so a caller that stops waiting does not
//! cancel the fetch; the in-flight marker is removed by a drop guard on every
//! exit path (success, error, panic).

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::FetchError;

/// Cached payload plus its age. `ttl == None` never expires.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    /// When the producer that built `payload` was started.
    pub started_at: Instant,
    pub written_at: Instant,
    pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
    /// Stale once `now - written_at >= ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.written_at) < ttl,
            None => true,
        }
    }

    fn started_after(&self, since: Option<Instant>) -> bool {
        since.map_or(true, |since| self.started_at >= since)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Overrides the cache's default TTL. `Some(None)` stores without expiry.
    pub ttl: Option<Option<Duration>>,
    pub force_refresh: bool,
    /// Rejects cached entries and in-flight runs started before this instant.
    pub started_after: Option<Instant>,
}

impl FetchOptions {
    pub fn forced() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }

    pub fn never_expire() -> Self {
        Self {
            ttl: Some(None),
            ..Self::default()
        }
    }

    pub fn started_after(mut self, since: Instant) -> Self {
        self.started_after = Some(since);
        self
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

struct InFlight<T: Clone> {
    id: u64,
    started_at: Instant,
    fetch: SharedFetch<T>,
}

impl<T: Clone> InFlight<T> {
    fn started_after(&self, since: Option<Instant>) -> bool {
        since.map_or(true, |since| self.started_at >= since)
    }
}

#[derive(Debug, Default)]
pub struct FetchCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub joined: AtomicU64,
    pub producer_runs: AtomicU64,
    pub producer_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
    pub producer_runs: u64,
    pub producer_errors: u64,
}

impl FetchCacheStats {
    pub fn snapshot(&self) -> FetchCacheStatsSnapshot {
        FetchCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            producer_runs: self.producer_runs.load(Ordering::Relaxed),
            producer_errors: self.producer_errors.load(Ordering::Relaxed),
        }
    }
}

struct Inner<T: Clone> {
    name: &'static str,
    default_ttl: Option<Duration>,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    in_flight: Mutex<HashMap<String, InFlight<T>>>,
    next_id: AtomicU64,
    stats: FetchCacheStats,
}

/// Removes the in-flight marker when the producer task ends, however it ends.
struct InFlightGuard<T: Clone> {
    inner: Arc<Inner<T>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(&self.key).is_some_and(|f| f.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

pub struct FetchCache<T: Clone> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Clone for FetchCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FetchCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, default_ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                default_ttl,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stats: FetchCacheStats::default(),
            }),
        }
    }

    /// Fresh cached value, if any. Never calls a producer.
    pub fn get_fresh(&self, key: &str) -> Option<T> {
        self.fresh_entry(key, None)
    }

    fn fresh_entry(&self, key: &str, since: Option<Instant>) -> Option<T> {
        let now = Instant::now();
        let entries = self.inner.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_fresh(now) && e.started_after(since))
            .map(|e| e.payload.clone())
    }

    /// Writes `payload` directly, replacing any previous entry.
    pub fn insert(&self, key: &str, payload: T, ttl: Option<Duration>) {
        let now = Instant::now();
        self.inner.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                payload,
                started_at: now,
                written_at: now,
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    pub fn stats(&self) -> FetchCacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Cached value, the result of an in-flight run for `key`, or a new run of
    /// `producer`. Only successful results are stored, and a result never
    /// replaces an entry from a later-started run.
    ///
    /// `producer` is called without any cache lock held.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        producer: F,
        options: FetchOptions,
    ) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let since = options.started_after;
        if !options.force_refresh {
            if let Some(payload) = self.fresh_entry(key, since) {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache = self.inner.name, key, "cache_hit");
                return Ok(payload);
            }
        }

        if let Some(shared) = self.join(key, since) {
            return shared.await;
        }

        let fut = producer();
        let shared = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(key).filter(|f| f.started_after(since)) {
                // Lost the race to another caller; `fut` is dropped unpolled.
                Some(existing) => {
                    self.inner.stats.joined.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = self.inner.name, key, "joined_in_flight");
                    existing.fetch.clone()
                }
                None => {
                    self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                    self.inner.stats.producer_runs.fetch_add(1, Ordering::Relaxed);
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let started_at = Instant::now();
                    let ttl = options.ttl.unwrap_or(self.inner.default_ttl);
                    let fetch = self.spawn_producer(key.to_string(), id, started_at, ttl, fut);
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            started_at,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        shared.await
    }

    fn join(&self, key: &str, since: Option<Instant>) -> Option<SharedFetch<T>> {
        let in_flight = self.inner.in_flight.lock();
        let existing = in_flight.get(key).filter(|f| f.started_after(since))?;
        self.inner.stats.joined.fetch_add(1, Ordering::Relaxed);
        debug!(cache = self.inner.name, key, "joined_in_flight");
        Some(existing.fetch.clone())
    }

    fn spawn_producer<Fut>(
        &self,
        key: String,
        id: u64,
        started_at: Instant,
        ttl: Option<Duration>,
        fut: Fut,
    ) -> SharedFetch<T>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        // The in-flight lock is held by the caller, so the guard can only
        // remove the marker after it has been registered.
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                inner: Arc::clone(&inner),
                key: key.clone(),
                id,
            };
            let result = fut.await;
            match &result {
                Ok(payload) => {
                    let mut entries = inner.entries.lock();
                    if entries.get(&key).map_or(true, |e| e.started_at <= started_at) {
                        entries.insert(
                            key,
                            CacheEntry {
                                payload: payload.clone(),
                                started_at,
                                written_at: Instant::now(),
                                ttl,
                            },
                        );
                    }
                }
                Err(e) => {
                    inner.stats.producer_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = inner.name, key = %key, error = %e, "producer_failed");
                }
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result.map_err(FetchError::from),
                Err(join_err) => Err(FetchError::from(anyhow::anyhow!(
                    "fetch task aborted: {}",
                    join_err
                ))),
            }
        }
        .boxed()
        .shared()
    }
}
