//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that runs a Redis container for queue tests.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let url = redis.connection_string();
/// // Connect the store under test to `url`
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance
    ///
    /// Uses the Redis 8 Alpine image, which supports every stream command the
    /// queues issue.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone())
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned connection for inspecting keys directly
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Get the connection string for the store under test
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Remove every key, for tests that reuse one container
    pub async fn flush(&self) {
        let mut conn = self.connection();
        let _: () = redis::cmd("FLUSHALL")
            .query_async(&mut conn)
            .await
            .expect("Failed to flush Redis");
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
    #[ignore] // Requires Docker
    async fn test_redis_supports_streams() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let id: String = redis::cmd("XADD")
            .arg("events")
            .arg("*")
            .arg("events")
            .arg("hello")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(id.contains('-'));

        let len: u64 = redis::cmd("XLEN")
            .arg("events")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_redis_flush() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.lpush::<_, _, ()>("jobs", "item1").await.unwrap();
        redis.flush().await;

        let exists: bool = conn.exists("jobs").await.unwrap();
        assert!(!exists);
    }
}
