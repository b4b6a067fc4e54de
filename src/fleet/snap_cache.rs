//! Road-snap result cache.
//!
//! Snapped paths are keyed by a route signature so a replayed path skips the
//! provider. Entries expire after 24 hours, the least-recently-accessed entry
//! is evicted once the cache is full, and a background sweep clears expired
//! entries every hour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::fleet::models::Coordinates;
use crate::metrics;

pub const CACHE_CAPACITY: usize = 1000;
pub const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    points: Vec<Coordinates>,
    created_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

pub struct RoadSnapCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl RoadSnapCache {
    pub fn new() -> Self {
        Self::with_limits(CACHE_CAPACITY, ENTRY_TTL)
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        RoadSnapCache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expired: 0,
            }),
            capacity,
            ttl,
        }
    }

    /// Signature over the endpoints and the coarse point count of a path.
    /// Only stability matters here; intermediate jitter must not change the
    /// key for what is effectively the same traversal.
    pub fn route_signature(points: &[Coordinates]) -> String {
        let (start, end) = match (points.first(), points.last()) {
            (Some(s), Some(e)) => (s, e),
            _ => {
                return "empty".to_string();
            }
        };
        let raw = format!(
            "{:.6},{:.6}|{:.6},{:.6}|{}",
            start.latitude,
            start.longitude,
            end.latitude,
            end.longitude,
            points.len() / 10
        );
        let mut hasher = Sha1::new();
        hasher.update(raw.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, signature: &str) -> Option<Vec<Coordinates>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(signature) {
            Some(entry) => now.duration_since(entry.created_at) >= self.ttl,
            None => false,
        };
        if expired {
            inner.entries.remove(signature);
            inner.expired += 1;
        }

        let found = match inner.entries.get_mut(signature) {
            Some(entry) => {
                entry.last_access = now;
                Some(entry.points.clone())
            }
            None => None,
        };
        match found {
            Some(points) => {
                inner.hits += 1;
                metrics::SNAP_CACHE_OPS.with_label_values(&["hit"]).inc();
                Some(points)
            }
            None => {
                inner.misses += 1;
                metrics::SNAP_CACHE_OPS.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    pub fn insert(&self, signature: String, points: Vec<Coordinates>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&signature) {
            // Evict the least-recently-accessed entry.
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                metrics::SNAP_CACHE_OPS.with_label_values(&["evict"]).inc();
            }
        }

        inner.entries.insert(
            signature,
            CacheEntry {
                points,
                created_at: now,
                last_access: now,
            },
        );
    }

    /// Drops entries past their TTL. Called hourly by the background sweeper.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.duration_since(e.created_at) < ttl);
        let removed = before - inner.entries.len();
        inner.expired += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expired: inner.expired,
            entries: inner.entries.len(),
        }
    }
}

impl Default for RoadSnapCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the hourly TTL sweep for a shared cache.
pub fn spawn_sweeper(cache: Arc<RoadSnapCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                tracing::debug!(removed, "snap cache sweep dropped expired entries");
            }
        }
    })
}
