//! Shared test utilities for the relay crates
//!
//! - `TestRedis`: Redis container with a ready `ConnectionManager` (feature: "redis")
//! - `TestDatabase`: PostgreSQL container for dependency probes (feature: "postgres")
//! - `TestIds`: deterministic stream names, correlation ids and instance ids
//!
//! # Features
//!
//! - `redis` (default): Redis test infrastructure
//! - `postgres`: PostgreSQL test infrastructure
//! - `all`: both
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestIds, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let ids = TestIds::from_test_name("my_redis_test");
//!     let manager = redis.connection_manager().await;
//!     let stream = ids.stream("results");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Deterministic names for streams, keys and ids.
///
/// Tests sharing one Redis never collide when each uses its own test name.
pub struct TestIds {
    seed: u64,
}

impl TestIds {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name, so reruns produce the same names
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// e.g. `test:results:1234`
    pub fn stream(&self, kind: &str) -> String {
        format!("test:{}:{}", kind, self.seed)
    }

    pub fn consumer_group(&self) -> String {
        format!("test_group_{}", self.seed)
    }

    pub fn instance_id(&self, n: u32) -> String {
        format!("test-instance-{}-{}", self.seed, n)
    }

    /// A UUID-shaped correlation id derived from the seed and `n`
    pub fn correlation_id(&self, n: u64) -> String {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.seed.to_le_bytes());
        bytes[8..].copy_from_slice(&n.to_le_bytes());
        Uuid::from_bytes(bytes).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_deterministic() {
        let a = TestIds::from_test_name("my_test");
        let b = TestIds::from_test_name("my_test");

        assert_eq!(a.stream("results"), b.stream("results"));
        assert_eq!(a.correlation_id(1), b.correlation_id(1));
    }

    #[test]
    fn test_ids_differ_by_name_and_counter() {
        let a = TestIds::from_test_name("test1");
        let b = TestIds::from_test_name("test2");

        assert_ne!(a.stream("results"), b.stream("results"));
        assert_ne!(a.correlation_id(1), a.correlation_id(2));
        assert!(Uuid::parse_str(&a.correlation_id(7)).is_ok());
    }
}
