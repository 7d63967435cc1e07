//! The read plane plus cache-invalidating ingest.
//!
//! Reads go through the cache; misses recompute from the store. Every
//! successful ingest for a source invalidates that source's entries and all
//! "active" and "stats" entries before it returns.
//!
//! A read that misses computes from the store and then writes the cache. If
//! an invalidation lands between the two, the freshly written entry may hold
//! pre-ingest data, so every invalidation bumps `generation` and a reader
//! that sees it move drops what it just wrote.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::format::{self, FormattedPayload, OutputFormat};
use ipwatch_cache::{CacheLayer, CacheStats};
use ipwatch_core::{Error, IndicatorRecord, Result};
use ipwatch_store::{
    ActiveFilter, ActiveIndicator, IngestReport, RecordStore, Statistics, StatsPeriod,
};

pub const TAG_ACTIVE: &str = "active";
pub const TAG_STATS: &str = "stats";
/// Tag for unfiltered active reads.
const TAG_ALL: &str = "all";

pub struct IndicatorService {
    store: Arc<RecordStore>,
    cache: Arc<CacheLayer>,
    /// Bumped after every commit-then-invalidate.
    generation: AtomicU64,
}

impl IndicatorService {
    pub fn new(store: Arc<RecordStore>, cache: Arc<CacheLayer>) -> Self {
        Self {
            store,
            cache,
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Ingest a batch and drop every cache entry it can affect.
    pub fn ingest(&self, source: &str, records: &[IndicatorRecord]) -> Result<IngestReport> {
        let report = self.store.ingest(source, records)?;
        if report.total() > 0 {
            self.invalidate(&[source, TAG_ACTIVE, TAG_STATS]);
        }
        Ok(report)
    }

    /// Must run after the store change it covers has committed.
    pub fn invalidate(&self, tags: &[&str]) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        self.cache.invalidate_tags(&tags);
    }

    /// Serve `key` from the cache or compute it with `load` and cache it.
    ///
    /// Each entry is also tagged with its own key so it can be dropped alone.
    fn cached<T>(&self, key: &str, tags: &[&str], load: impl FnOnce() -> Result<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        if let Some(value) = self.cache.get_json::<T>(key) {
            return Ok(value);
        }

        debug!("Cache miss for {}", key);
        let generation = self.generation.load(Ordering::SeqCst);
        let value = load().map_err(store_unavailable)?;

        let mut entry_tags = tags.to_vec();
        entry_tags.push(key);
        self.cache.set_json(key, &value, &entry_tags);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping {}: invalidated while it was computed", key);
            self.cache.invalidate_tags(&[key.to_string()]);
        }
        Ok(value)
    }

    /// Active set rendered in `format`.
    pub fn get_active(&self, format: OutputFormat, filter: &ActiveFilter) -> Result<FormattedPayload> {
        let entries = self.get_active_records(filter)?;
        format::format(format, &entries)
    }

    pub fn get_active_records(&self, filter: &ActiveFilter) -> Result<Vec<ActiveIndicator>> {
        let scope = filter.source.as_deref().unwrap_or(TAG_ALL);
        let key = format!(
            "active:{}:{}:{}",
            scope,
            filter.limit.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
            filter.offset
        );
        self.cached(&key, &[TAG_ACTIVE, scope], || self.store.get_active(filter))
    }

    pub fn get_statistics(&self, period: StatsPeriod) -> Result<Statistics> {
        let key = format!("stats:{}", period.as_str());
        self.cached(&key, &[TAG_STATS], || self.store.get_statistics(period))
    }

    /// Every retained provenance row for an ip, including expired ones.
    pub fn get_history(&self, ip: &str) -> Result<Vec<IndicatorRecord>> {
        self.store.get_history(ip).map_err(|e| match e {
            Error::Ingest(msg) => Error::InvalidRequest(msg),
            other => store_unavailable(other),
        })
    }

    pub fn get_expired(&self, source: Option<&str>) -> Result<Vec<IndicatorRecord>> {
        self.store.get_expired(source).map_err(store_unavailable)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Readers must see an outage, never an empty result.
pub fn store_unavailable(e: Error) -> Error {
    match e {
        Error::Database(msg) => Error::StoreUnavailable(msg),
        other => other,
    }
}
