//! ipwatch cache: read-plane cache with a Redis primary and an in-process
//! fallback.
//!
//! `CacheLayer` never returns an error. When the primary fails it switches
//! to the memory backend, logs the transition once, and re-probes the
//! primary at most every `probe_interval`. Invalidations issued while
//! degraded hit memory immediately and are queued; the queue is replayed on
//! the primary before it serves reads again.

pub mod backend;
pub mod memory;
pub mod redis_backend;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

pub use backend::CacheBackend;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use ipwatch_core::{CacheSettings, Error};

/// Hit/miss counters and current backend, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub degraded: bool,
    pub backend: &'static str,
}

pub struct CacheLayer {
    primary: Option<Arc<dyn CacheBackend>>,
    fallback: MemoryBackend,
    ttl: Duration,
    probe_interval: Duration,
    degraded: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    /// Tags invalidated while degraded, not yet applied to the primary.
    pending: Mutex<Vec<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheLayer {
    /// Build from settings: Redis when a URL is configured, memory otherwise.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let primary: Option<Arc<dyn CacheBackend>> = match &settings.redis_url {
            Some(url) => match RedisBackend::new(url, &settings.key_prefix) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    warn!("Invalid Redis URL, running on memory cache only: {}", e);
                    None
                }
            },
            None => None,
        };
        Self::new(primary, settings)
    }

    /// Build around an explicit primary. Probes it once before returning.
    pub fn new(primary: Option<Arc<dyn CacheBackend>>, settings: &CacheSettings) -> Self {
        let layer = Self {
            primary,
            fallback: MemoryBackend::new(settings.max_entries),
            ttl: settings.ttl,
            probe_interval: settings.probe_interval,
            degraded: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        match &layer.primary {
            Some(primary) => match primary.ping() {
                Ok(()) => info!("Cache layer using {} backend", primary.name()),
                Err(e) => layer.mark_degraded(&e),
            },
            None => info!("Cache layer using memory backend"),
        }
        layer
    }

    /// Default TTL for read-plane entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match self.active_primary() {
            Some(primary) => match primary.get(key) {
                Ok(value) => value,
                Err(e) => {
                    self.mark_degraded(&e);
                    self.memory_get(key)
                }
            },
            None => self.memory_get(key),
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration, tags: &[&str]) {
        if let Some(primary) = self.active_primary() {
            match primary.set(key, value, ttl, tags) {
                Ok(()) => return,
                Err(e) => self.mark_degraded(&e),
            }
        }
        self.fallback.insert(key, value, ttl, tags);
    }

    /// Invalidate every entry tagged with any of `tags`, on both backends.
    pub fn invalidate_tags(&self, tags: &[String]) {
        let removed = self.fallback.remove_tagged(tags);
        debug!("Invalidated {} memory entries for tags {:?}", removed, tags);

        let Some(primary) = &self.primary else {
            return;
        };
        {
            let mut pending = self.pending.lock();
            if self.degraded.load(Ordering::SeqCst) {
                pending.extend(tags.iter().cloned());
                return;
            }
        }
        if let Err(e) = primary.invalidate_tags(tags) {
            self.mark_degraded(&e);
            self.pending.lock().extend(tags.iter().cloned());
        }
    }

    /// Typed read; entries that no longer deserialize count as misses.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, tags: &[&str]) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, self.ttl, tags),
            Err(e) => debug!("Not caching {}: {}", key, e),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        let degraded = self.is_degraded();
        let backend = match &self.primary {
            Some(primary) if !degraded => primary.name(),
            _ => self.fallback.name(),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            degraded,
            backend,
        }
    }

    fn memory_get(&self, key: &str) -> Option<String> {
        self.fallback.lookup(key)
    }

    /// The primary if it may serve right now, probing it when a retry is due.
    fn active_primary(&self) -> Option<&Arc<dyn CacheBackend>> {
        let primary = self.primary.as_ref()?;
        if !self.degraded.load(Ordering::SeqCst) {
            return Some(primary);
        }
        if self.try_recover(primary) {
            Some(primary)
        } else {
            None
        }
    }

    fn try_recover(&self, primary: &Arc<dyn CacheBackend>) -> bool {
        {
            let mut last_probe = self.last_probe.lock();
            if let Some(at) = *last_probe {
                if at.elapsed() < self.probe_interval {
                    return false;
                }
            }
            *last_probe = Some(Instant::now());
        }

        let mut pending = self.pending.lock();
        if !self.degraded.load(Ordering::SeqCst) {
            return true;
        }
        if primary.ping().is_err() {
            return false;
        }
        if !pending.is_empty() {
            pending.sort();
            pending.dedup();
            if let Err(e) = primary.invalidate_tags(&pending) {
                debug!("Replaying invalidations failed, staying degraded: {}", e);
                return false;
            }
        }
        let replayed = pending.len();
        pending.clear();
        self.fallback.clear();
        self.degraded.store(false, Ordering::SeqCst);
        info!(
            "Cache primary {} recovered, replayed {} tag invalidations",
            primary.name(),
            replayed
        );
        true
    }

    fn mark_degraded(&self, err: &Error) {
        *self.last_probe.lock() = Some(Instant::now());
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("Cache primary unavailable, falling back to memory: {}", err);
        }
    }
}
