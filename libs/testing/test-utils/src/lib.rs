//! Shared test utilities for queue testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic queue keys and payloads (always available)
//! - `assertions`: assertion helpers for stream ids (always available)
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_queue_test");
//!
//!     let key = builder.key("stream", "orders");
//!     // connect a store to redis.connection_string() and use `key`
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for deterministic test keys and payloads
///
/// Keys derived from the test name keep concurrent tests sharing one store
/// from touching each other's queues.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_take_after_add");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue key scoped to this builder
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.key("stream", "orders"), "test:7:stream:orders");
    /// ```
    pub fn key(&self, kind: &str, name: &str) -> String {
        format!("test:{}:{}:{}", self.seed, kind, name)
    }

    /// Numbered payloads `"{prefix}-0"`, `"{prefix}-1"`, ...
    pub fn payloads(&self, prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{prefix}-{i}")).collect()
    }

    /// A key no other test run will produce
    pub fn unique_key(prefix: &str) -> String {
        format!("{}:{}", prefix, Uuid::new_v4().simple())
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that `id` has the `<ms>-<seq>` shape of a stream entry id
    pub fn assert_stream_id(id: &str, context: &str) {
        let valid = id
            .split_once('-')
            .map(|(ms, seq)| {
                !ms.is_empty()
                    && !seq.is_empty()
                    && ms.bytes().all(|b| b.is_ascii_digit())
                    && seq.bytes().all(|b| b.is_ascii_digit())
            })
            .unwrap_or(false);
        assert!(valid, "{}: expected a stream id, got {:?}", context, id);
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
