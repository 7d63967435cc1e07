//! Redis backend. Shared across daemon instances.
//!
//! Values live under `{prefix}:{key}` with `SET .. EX`. Each tag is a set
//! `{prefix}:tag:{tag}` holding the keys written with it. Writes add the
//! value and its tag memberships in one MULTI; tag invalidation reads and
//! deletes the sets in one script, so no membership added in between is lost.

use std::time::Duration;

use parking_lot::Mutex;
use redis::{Client, Commands, Connection, RedisError, Script};

use crate::backend::CacheBackend;
use ipwatch_core::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// KEYS are tag sets. Deletes every member and the set itself; returns the
/// number of values removed. DEL is chunked to stay under Lua's unpack limit.
const INVALIDATE_TAGS_LUA: &str = r#"
local removed = 0
for _, tag in ipairs(KEYS) do
  local members = redis.call('SMEMBERS', tag)
  for i = 1, #members, 500 do
    local last = math.min(i + 499, #members)
    removed = removed + redis.call('DEL', unpack(members, i, last))
  end
  redis.call('DEL', tag)
end
return removed
"#;

pub struct RedisBackend {
    client: Client,
    prefix: String,
    conn: Mutex<Option<Connection>>,
    invalidate_script: Script,
}

impl RedisBackend {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(cache_err)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            conn: Mutex::new(None),
            invalidate_script: Script::new(INVALIDATE_TAGS_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }

    /// Run `f` on the cached connection, reconnecting if there is none.
    /// A failed command drops the connection so the next call starts fresh.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let conn = self
                .client
                .get_connection_with_timeout(CONNECT_TIMEOUT)
                .map_err(cache_err)?;
            conn.set_read_timeout(Some(CONNECT_TIMEOUT)).map_err(cache_err)?;
            conn.set_write_timeout(Some(CONNECT_TIMEOUT)).map_err(cache_err)?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(Error::CacheUnavailable("no redis connection".into()));
        };

        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                *guard = None;
                Err(cache_err(e))
            }
        }
    }
}

impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.key(key);
        self.with_conn(|conn| conn.get(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration, tags: &[&str]) -> Result<()> {
        let key = self.key(key);
        let ttl_secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        pipe.atomic().set_ex(&key, value, ttl_secs).ignore();
        for tag in tags {
            let tag_key = self.tag_key(tag);
            pipe.sadd(&tag_key, &key).ignore();
            pipe.expire(&tag_key, ttl_secs as i64).ignore();
        }
        self.with_conn(|conn| pipe.query::<()>(conn))
    }

    fn invalidate_tags(&self, tags: &[String]) -> Result<usize> {
        if tags.is_empty() {
            return Ok(0);
        }
        let mut invocation = self.invalidate_script.prepare_invoke();
        for tag in tags {
            invocation.key(self.tag_key(tag));
        }
        self.with_conn(|conn| invocation.invoke::<usize>(conn))
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn))?;
        Ok(())
    }
}

fn cache_err(e: RedisError) -> Error {
    Error::CacheUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379/", "ipwatch").unwrap();
        assert_eq!(backend.key("active:all:-:0"), "ipwatch:active:all:-:0");
        assert_eq!(backend.tag_key("regtech"), "ipwatch:tag:regtech");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            RedisBackend::new("not a url", "ipwatch"),
            Err(Error::CacheUnavailable(_))
        ));
    }

    #[test]
    fn test_unreachable_server_is_unavailable() {
        // Port 1 is never a redis server.
        let backend = RedisBackend::new("redis://127.0.0.1:1/", "ipwatch").unwrap();
        assert!(matches!(backend.ping(), Err(Error::CacheUnavailable(_))));
        assert!(backend.get("anything").is_err());
        assert!(matches!(
            backend.invalidate_tags(&["active".to_string()]),
            Err(Error::CacheUnavailable(_))
        ));
        assert_eq!(backend.invalidate_tags(&[]).unwrap(), 0);
    }
}
