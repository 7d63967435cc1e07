//! In-process LRU cache, the fallback when Redis is unreachable.
//!
//! Bounded by entry count with a per-entry TTL and a tag → keys index so
//! tag invalidation does not scan the whole map.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::CacheBackend;
use ipwatch_core::Result;

/// Longest lifetime an entry can get; keeps `Instant` arithmetic in range.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 86_400);

struct CacheEntry {
    value: String,
    tags: Vec<String>,
    expires_at: Instant,
}

/// Thread-safe LRU cache keyed by string.
pub struct MemoryBackend {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Least recently used first.
    order: Vec<String>,
    tags: HashMap<String, HashSet<String>>,
    max_size: usize,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.order.retain(|k| k != key);
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        true
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }
}

impl MemoryBackend {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(max_size),
                order: Vec::with_capacity(max_size),
                tags: HashMap::new(),
                max_size,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.tags.clear();
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();

        let expired = inner
            .entries
            .get(key)
            .map(|e| Instant::now() >= e.expires_at);

        match expired {
            Some(false) => {
                inner.touch(key);
                inner.entries.get(key).map(|e| e.value.clone())
            }
            Some(true) => {
                inner.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: &str, ttl: Duration, tags: &[&str]) {
        let mut inner = self.inner.lock();
        inner.remove(key);

        while inner.entries.len() >= inner.max_size && !inner.order.is_empty() {
            let oldest = inner.order[0].clone();
            inner.remove(&oldest);
        }

        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        for tag in &tags {
            inner
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        inner.order.push(key.to_string());
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                tags,
                expires_at: Instant::now() + ttl.min(MAX_TTL),
            },
        );
    }

    /// Drop every entry carrying one of `tags`. Returns the number removed.
    pub fn remove_tagged(&self, tags: &[String]) -> usize {
        let mut inner = self.inner.lock();
        let keys: HashSet<String> = tags
            .iter()
            .filter_map(|t| inner.tags.get(t))
            .flat_map(|keys| keys.iter().cloned())
            .collect();
        keys.iter().filter(|k| inner.remove(k)).count()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lookup(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration, tags: &[&str]) -> Result<()> {
        self.insert(key, value, ttl, tags);
        Ok(())
    }

    fn invalidate_tags(&self, tags: &[String]) -> Result<usize> {
        Ok(self.remove_tagged(tags))
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}
