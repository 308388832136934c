//! Bounded response cache keyed by request fingerprint.
//!
//! Entries expire lazily after their TTL. When the cache is full, the entry
//! accessed least recently (by insert or hit) is evicted. Keys are spread
//! over independently locked segments, each an [`LruCache`] ordered by
//! recency. A shared access clock makes the segments comparable, so the
//! global victim is the oldest of the segment tails.

mod fingerprint;

pub use fingerprint::Fingerprint;

use lru::LruCache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const SEGMENTS: usize = 16;

/// A stored answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub text: String,
    pub model_used: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: Option<String>,
}

struct Entry {
    value: CachedResponse,
    expires_at: Instant,
    last_access: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Segment = LruCache<Fingerprint, Entry>;

fn lock(segment: &Mutex<Segment>) -> MutexGuard<'_, Segment> {
    segment.lock().unwrap_or_else(|e| e.into_inner())
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

pub struct ResponseCache {
    segments: Box<[Mutex<Segment>]>,
    len: AtomicUsize,
    capacity: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            segments: (0..SEGMENTS)
                .map(|_| Mutex::new(LruCache::unbounded()))
                .collect(),
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity.max(1)),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Access stamps are taken under the segment lock, so within a segment
    /// LRU order and stamp order agree.
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn segment(&self, key: &Fingerprint) -> MutexGuard<'_, Segment> {
        lock(&self.segments[key.shard_hint() % self.segments.len()])
    }

    /// Look up a live entry, refreshing its recency on hit.
    pub fn get(&self, key: &Fingerprint) -> Option<CachedResponse> {
        let now = Instant::now();
        let mut segment = self.segment(key);
        let expired = match segment.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access = self.tick();
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = %key, model = %entry.value.model_used, "Cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired && segment.pop(key).is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        drop(segment);
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(fingerprint = %key, expired, "Cache miss");
        None
    }

    /// Store `value` under `key` for `ttl`. A zero TTL stores nothing.
    pub fn put(&self, key: Fingerprint, value: CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut segment = self.segment(&key);
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
            last_access: self.tick(),
        };
        let replaced = segment.put(key, entry).is_some();
        drop(segment);

        if !replaced {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        self.evict_to(self.capacity());
    }

    /// Evict least recently accessed entries until at most `limit` remain.
    ///
    /// Only one segment lock is held at a time. Each eviction first claims
    /// one unit of overflow from `len`, so concurrent writers never evict
    /// below the limit.
    fn evict_to(&self, limit: usize) {
        while self.len.load(Ordering::Relaxed) > limit {
            let oldest = self
                .segments
                .iter()
                .enumerate()
                .filter_map(|(index, segment)| {
                    lock(segment)
                        .peek_lru()
                        .map(|(_, entry)| (index, entry.last_access))
                })
                .min_by_key(|(_, access)| *access);
            let Some((index, access)) = oldest else {
                break;
            };

            let claimed = self
                .len
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n > limit).then(|| n - 1)
                })
                .is_ok();
            if !claimed {
                break;
            }

            let mut segment = lock(&self.segments[index]);
            let unchanged = segment
                .peek_lru()
                .is_some_and(|(_, entry)| entry.last_access == access);
            let popped = if unchanged { segment.pop_lru() } else { None };
            drop(segment);

            match popped {
                Some((key, entry)) if entry.is_expired(Instant::now()) => {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(fingerprint = %key, "Dropped expired entry on overflow");
                }
                Some((key, _)) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(fingerprint = %key, "Evicted least recently used entry");
                }
                // Touched or removed since it was picked; give the claim back.
                None => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for segment in self.segments.iter() {
            let mut segment = lock(segment);
            let expired: Vec<Fingerprint> = segment
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                segment.pop(key);
            }
            self.len.fetch_sub(expired.len(), Ordering::Relaxed);
            removed += expired.len();
        }
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Change capacity, evicting down immediately if it shrank.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.evict_to(capacity);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for segment in self.segments.iter() {
            let mut segment = lock(segment);
            self.len.fetch_sub(segment.len(), Ordering::Relaxed);
            segment.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
