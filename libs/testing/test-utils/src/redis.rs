//! Redis test infrastructure
//!
//! `TestRedis` starts a Redis container; the container stops when it is dropped.

use redis::Client;
use redis::aio::ConnectionManager;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    client: Client,
    pub connection_string: String,
}

impl TestRedis {
    /// Start Redis 8 Alpine (streams, consumer groups and Lua are all available)
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);
        let client = Client::open(connection_string.clone()).expect("Failed to create Redis client");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Auto-reconnecting connection, the same kind the relay uses in production
    pub async fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone())
            .await
            .expect("Failed to connect to Redis")
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_set_with_expiry() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection_manager().await;

        conn.set_ex::<_, _, ()>("expiring_key", "value", 1).await.unwrap();
        let exists: bool = conn.exists("expiring_key").await.unwrap();
        assert!(exists);

        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

        let exists: bool = conn.exists("expiring_key").await.unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_streams_available() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection_manager().await;

        let id: String = redis::cmd("XADD")
            .arg("probe:stream")
            .arg("*")
            .arg("message")
            .arg("{}")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(id.contains('-'));
    }
}
