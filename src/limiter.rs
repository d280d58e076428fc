//! Fixed-window rate limiting.
//!
//! Counters live behind the [`CounterStore`] trait, whose only mutation is
//! an atomic increment-and-read, so a get-then-set backend cannot be expressed
//! through it. The shipped [`InMemoryCounterStore`] is sharded and bounded;
//! a shared backend (e.g. a networked counter store) can plug into the same
//! seam. Backend failures degrade to the in-process fallback with a warning
//! and never surface to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::clock::Clock;

/// Counter backend errors. Only ever logged; the limiter falls back.
#[derive(Debug, Error)]
pub enum CounterError {
    /// Backend unreachable or misbehaving.
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),
}

/// Atomic windowed counters keyed by identity string.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `(key, window_start)` and return
    /// the post-increment count. Entries older than `ttl_secs` may be
    /// dropped by the backend.
    async fn incr(&self, key: &str, window_start: i64, ttl_secs: u64) -> Result<u64, CounterError>;

    /// Read the counter for `(key, window_start)` without incrementing.
    async fn peek(&self, key: &str, window_start: i64) -> Result<u64, CounterError>;
}

const SHARD_COUNT: usize = 16;

/// Per-shard entry cap. Stale windows are purged first; beyond that the
/// oldest-window entries are evicted so hot-key floods cannot grow the map
/// without bound.
const MAX_ENTRIES_PER_SHARD: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: i64,
    count: u64,
}

/// Process-local counter store: sharded mutex map, bounded per shard.
///
/// Counters reset when the process restarts, so guarantees are per-process
/// while running in fallback mode.
pub struct InMemoryCounterStore {
    shards: Vec<Mutex<HashMap<String, WindowCounter>>>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, WindowCounter>> {
        let mut hash: usize = 0;
        for byte in key.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(usize::from(byte));
        }
        &self.shards[hash % SHARD_COUNT]
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr(&self, key: &str, window_start: i64, _ttl_secs: u64) -> Result<u64, CounterError> {
        let mut shard = self
            .shard(key)
            .lock()
            .map_err(|e| CounterError::Unavailable(format!("shard lock poisoned: {e}")))?;

        if shard.len() >= MAX_ENTRIES_PER_SHARD && !shard.contains_key(key) {
            // Purge entries from windows before the one being written.
            shard.retain(|_, counter| counter.window_start >= window_start);
            if shard.len() >= MAX_ENTRIES_PER_SHARD {
                let evict = shard
                    .iter()
                    .min_by_key(|(_, counter)| counter.window_start)
                    .map(|(k, _)| k.clone());
                if let Some(evict_key) = evict {
                    shard.remove(&evict_key);
                }
            }
        }

        let counter = shard.entry(key.to_owned()).or_insert(WindowCounter {
            window_start,
            count: 0,
        });
        if counter.window_start != window_start {
            counter.window_start = window_start;
            counter.count = 0;
        }
        counter.count = counter.count.saturating_add(1);
        Ok(counter.count)
    }

    async fn peek(&self, key: &str, window_start: i64) -> Result<u64, CounterError> {
        let shard = self
            .shard(key)
            .lock()
            .map_err(|e| CounterError::Unavailable(format!("shard lock poisoned: {e}")))?;
        Ok(shard
            .get(key)
            .filter(|counter| counter.window_start == window_start)
            .map_or(0, |counter| counter.count))
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// When the current window ends.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds until the window resets, measured from `now`. Never zero for
    /// a denied request.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let secs = (self.reset_at - now).num_seconds();
        u64::try_from(secs.max(1)).unwrap_or(1)
    }
}

/// Fixed-window rate limiter.
///
/// The backend (when configured) is tried first; on error the limiter logs
/// a warning and falls through to the process-local store. Fallback relaxes
/// the cross-process guarantee, it never rejects the caller spuriously.
pub struct RateLimiter {
    limit: u32,
    window_secs: u64,
    backend: Option<Arc<dyn CounterStore>>,
    fallback: InMemoryCounterStore,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter with the given ceiling and window.
    pub fn new(
        limit: u32,
        window_secs: u64,
        backend: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limit,
            window_secs: window_secs.max(1),
            backend,
            fallback: InMemoryCounterStore::new(),
            clock,
        }
    }

    /// Configured per-window ceiling.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Increment the counter for `identity` and decide in one atomic step.
    pub async fn check(&self, identity: &str) -> RateLimitDecision {
        let (window_start, reset_at) = self.window_bounds(self.window_secs);
        let count = self.incr(identity, window_start, self.window_secs).await;
        RateLimitDecision {
            allowed: count <= u64::from(self.limit),
            remaining: u64::from(self.limit).saturating_sub(count),
            reset_at,
        }
    }

    /// Increment an arbitrary windowed counter (used for per-policy daily
    /// quotas after provisional approval). Returns the post-increment count.
    pub async fn record(&self, identity: &str, window_secs: u64) -> u64 {
        let window_secs = window_secs.max(1);
        let (window_start, _) = self.window_bounds(window_secs);
        self.incr(identity, window_start, window_secs).await
    }

    /// Read an arbitrary windowed counter without incrementing (used by the
    /// policy engine to evaluate quota conditions side-effect-free).
    pub async fn peek(&self, identity: &str, window_secs: u64) -> u64 {
        let window_secs = window_secs.max(1);
        let (window_start, _) = self.window_bounds(window_secs);

        if let Some(backend) = &self.backend {
            match backend.peek(identity, window_start).await {
                Ok(count) => return count,
                Err(e) => {
                    tracing::warn!(error = %e, "counter backend peek failed, using in-memory fallback");
                }
            }
        }
        self.fallback.peek(identity, window_start).await.unwrap_or(0)
    }

    async fn incr(&self, identity: &str, window_start: i64, window_secs: u64) -> u64 {
        if let Some(backend) = &self.backend {
            match backend.incr(identity, window_start, window_secs).await {
                Ok(count) => return count,
                Err(e) => {
                    tracing::warn!(error = %e, "counter backend incr failed, using in-memory fallback");
                }
            }
        }
        // The in-memory incr only fails on lock poisoning; treat that as a
        // first request rather than erroring the caller.
        self.fallback
            .incr(identity, window_start, window_secs)
            .await
            .unwrap_or(1)
    }

    fn window_bounds(&self, window_secs: u64) -> (i64, DateTime<Utc>) {
        let now = self.clock.now().timestamp();
        let window = i64::try_from(window_secs).unwrap_or(i64::MAX);
        let window_start = now.div_euclid(window) * window;
        let reset_at = Utc
            .timestamp_opt(window_start.saturating_add(window), 0)
            .single()
            .unwrap_or_else(|| self.clock.now());
        (window_start, reset_at)
    }
}
