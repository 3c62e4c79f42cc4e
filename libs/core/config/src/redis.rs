use crate::{env_or_default, env_required, ConfigError, FromEnv};

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
    /// Prefix applied to every queue key created from this connection
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            key_prefix: String::new(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl FromEnv for RedisConfig {
    /// Requires REDIS_HOST to be set (no default); REDIS_KEY_PREFIX is optional
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            uri: env_required("REDIS_HOST")?,
            key_prefix: env_or_default("REDIS_KEY_PREFIX", ""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_env_success() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis://localhost:6379")),
                ("REDIS_KEY_PREFIX", Some("jobs:")),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.uri, "redis://localhost:6379");
                assert_eq!(config.key_prefix, "jobs:");
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_missing() {
        temp_env::with_var_unset("REDIS_HOST", || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("REDIS_HOST"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_redis_config_new() {
        let config = RedisConfig::new("redis://prod-host:6379").with_key_prefix("app:");
        assert_eq!(config.uri, "redis://prod-host:6379");
        assert_eq!(config.key_prefix, "app:");
    }
}
