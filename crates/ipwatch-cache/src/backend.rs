use std::time::Duration;

use ipwatch_core::Result;

/// A key/value store with per-entry TTL and tag-based invalidation.
///
/// Backends report connectivity problems as `Error::CacheUnavailable`; the
/// cache layer turns those into a fallback, never into a caller error.
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Duration, tags: &[&str]) -> Result<()>;

    /// Remove every entry carrying any of `tags`. Returns the number removed.
    fn invalidate_tags(&self, tags: &[String]) -> Result<usize>;

    fn ping(&self) -> Result<()>;
}
