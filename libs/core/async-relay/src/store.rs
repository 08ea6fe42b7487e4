//! Key-value store with per-key TTL
//!
//! Backs both the result bridge and the distributed lock. Two implementations:
//! - [`RedisStore`]: shared across processes
//! - [`MemoryStore`]: single process, for development and tests
//!
//! Holder-checked release and renewal must be atomic, so on Redis they run as Lua
//! scripts (compare-and-delete, compare-and-expire).

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClientError;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Store operations used by the relay.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Unconditional write with TTL
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ClientError>;

    async fn get(&self, key: &str) -> Result<Option<String>, ClientError>;

    async fn exists(&self, key: &str) -> Result<bool, ClientError>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool, ClientError>;

    /// Atomic set-if-absent with TTL. Returns whether this call created the key.
    async fn acquire_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ClientError>;

    /// Delete only if the current value equals `expected`
    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, ClientError>;

    /// Reset the TTL of an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ClientError>;

    /// Reset the TTL only if the current value equals `expected`
    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ClientError>;

    async fn ping(&self) -> Result<(), ClientError>;
}

/// Longest TTL or deadline the relay applies; longer durations are clamped to it
pub const MAX_TTL: Duration = Duration::from_secs(86_400 * 365 * 30);

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

/// `start + duration`, clamped to [`MAX_TTL`] so the clock never overflows
pub(crate) fn expiry_from(start: Instant, duration: Duration) -> Instant {
    start + duration.min(MAX_TTL)
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ClientError> {
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<bool, ClientError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn acquire_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ClientError> {
        let mut conn = self.redis.clone();
        // SET NX replies OK on success and nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, ClientError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ClientError> {
        let mut conn = self.redis.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ClientError> {
        let mut conn = self.redis.clone();
        let updated: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let mut conn = self.redis.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ClientError::rejected(format!("unexpected PING reply: {}", reply)))
        }
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store with the same semantics as [`RedisStore`].
///
/// Expiry follows `tokio::time`, so tests running with a paused clock can
/// advance past a TTL. [`MemoryStore::set_available`] simulates an outage.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with a connection error
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Live keys, expired entries excluded
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ClientError::connection("memory store is unavailable"))
        } else {
            Ok(())
        }
    }

    /// Run `f` on the map after dropping `key` if it has expired
    fn with_live_key<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> R,
    ) -> Result<R, ClientError> {
        self.check_available()?;
        let mut entries = self.lock();
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            debug!(key = %key, "Evicting expired key");
            entries.remove(key);
        }
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ClientError> {
        self.with_live_key(key, |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: expiry_from(Instant::now(), ttl),
                },
            );
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        self.with_live_key(key, |entries| entries.get(key).map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        self.with_live_key(key, |entries| entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, ClientError> {
        self.with_live_key(key, |entries| entries.remove(key).is_some())
    }

    async fn acquire_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ClientError> {
        self.with_live_key(key, |entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: expiry_from(Instant::now(), ttl),
                },
            );
            true
        })
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, ClientError> {
        self.with_live_key(key, |entries| {
            if entries.get(key).is_some_and(|e| e.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ClientError> {
        self.with_live_key(key, |entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expiry_from(Instant::now(), ttl);
                true
            }
            None => false,
        })
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, ClientError> {
        self.with_live_key(key, |entries| match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expiry_from(Instant::now(), ttl);
                true
            }
            _ => false,
        })
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientErrorKind;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.put("k", "v1", TTL).await.unwrap();
        store.put("k", "v2", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(store.exists("k").await.unwrap());

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_eviction() {
        let store = MemoryStore::new();
        store.put("k", "v", Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_if_absent() {
        let store = MemoryStore::new();
        assert!(store.acquire_if_absent("lock", "a", TTL).await.unwrap());
        assert!(!store.acquire_if_absent("lock", "b", TTL).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));

        // Expired keys are free again
        tokio::time::advance(TTL).await;
        assert!(store.acquire_if_absent("lock", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.put("lock", "owner", TTL).await.unwrap();

        assert!(!store.delete_if_value("lock", "intruder").await.unwrap());
        assert!(store.exists("lock").await.unwrap());
        assert!(store.delete_if_value("lock", "owner").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_expire() {
        let store = MemoryStore::new();
        store.put("lock", "owner", Duration::from_millis(100)).await.unwrap();

        assert!(!store.expire_if_value("lock", "other", TTL).await.unwrap());
        assert!(store.expire_if_value("lock", "owner", TTL).await.unwrap());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(store.exists("lock").await.unwrap());
        assert!(!store.expire("missing", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttls_are_clamped() {
        let store = MemoryStore::new();
        store.put("k", "v", Duration::MAX).await.unwrap();
        assert!(store.expire("k", Duration::from_secs(u64::MAX)).await.unwrap());
        assert!(store.expire_if_value("k", "v", Duration::MAX).await.unwrap());
        assert!(store.acquire_if_absent("other", "v", Duration::MAX).await.unwrap());

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert!(store.exists("k").await.unwrap());
    }

    #[test]
    fn test_ttl_millis_saturates() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(ttl_millis(Duration::MAX), MAX_TTL.as_millis() as u64);
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_connection_errors() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store.get("k").await.unwrap_err();
        assert_eq!(err.kind(), ClientErrorKind::Connection);
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
