use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub instance: InstanceConfig,
    pub lock: LockConfig,
    pub refresh: RefreshConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Process-unique holder id used for every lock this instance takes
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How many times a running refresh cycle may extend its lock
    pub max_extensions: u32,
    /// Shared store for cross-process locking; in-memory locks when unset
    pub redis_url: Option<String>,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Credentials expiring within this window are refreshed
    pub buffer: Duration,
    pub check_interval: Duration,
    pub max_attempts: u32,
    /// Overrides the token endpoint derived from the session's issuer
    pub token_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub cleanup_interval: Duration,
    pub idle_timeout: Duration,
    pub max_messages_per_stream: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_extensions: 3,
            redis_url: None,
            ttl: Duration::from_secs(30),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            buffer: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(5 * 60),
            max_attempts: 5,
            token_endpoint: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60 * 60), // 1 hour
            max_messages_per_stream: 100,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let instance_id =
            std::env::var("INSTANCE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let refresh_defaults = RefreshConfig::default();
        let lock_defaults = LockConfig::default();
        let store_defaults = StoreConfig::default();

        let config = Config {
            instance: InstanceConfig { id: instance_id },
            lock: LockConfig {
                max_extensions: env_or("LOCK_MAX_EXTENSIONS", lock_defaults.max_extensions),
                redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
                ttl: env_millis("LOCK_TTL_MS", lock_defaults.ttl),
            },
            refresh: RefreshConfig {
                buffer: env_seconds("REFRESH_BUFFER_SECONDS", refresh_defaults.buffer),
                check_interval: env_seconds(
                    "REFRESH_CHECK_INTERVAL_SECONDS",
                    refresh_defaults.check_interval,
                ),
                max_attempts: env_or("REFRESH_MAX_ATTEMPTS", refresh_defaults.max_attempts),
                token_endpoint: std::env::var("TOKEN_ENDPOINT").ok().filter(|s| !s.is_empty()),
            },
            store: StoreConfig {
                cleanup_interval: env_seconds(
                    "SESSION_CLEANUP_INTERVAL_SECONDS",
                    store_defaults.cleanup_interval,
                ),
                idle_timeout: env_seconds(
                    "SESSION_IDLE_TIMEOUT_SECONDS",
                    store_defaults.idle_timeout,
                ),
                max_messages_per_stream: env_or(
                    "MAX_MESSAGE_HISTORY",
                    store_defaults.max_messages_per_stream,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "INSTANCE_ID cannot be empty".to_string(),
            ));
        }
        if self.refresh.check_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "refresh check interval must be greater than zero".to_string(),
            ));
        }
        if self.lock.ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "lock TTL must be greater than zero".to_string(),
            ));
        }
        if self.store.max_messages_per_stream == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_MESSAGE_HISTORY must be at least 1".to_string(),
            ));
        }
        if self.store.idle_timeout.is_zero() || self.store.cleanup_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "session idle timeout and cleanup interval must be greater than zero".to_string(),
            ));
        }

        if self.lock.ttl >= self.refresh.check_interval {
            tracing::warn!(
                ttl_ms = self.lock.ttl.as_millis() as u64,
                interval_ms = self.refresh.check_interval.as_millis() as u64,
                "Lock TTL is not shorter than the refresh interval. \
                 A crashed holder may block the following window."
            );
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_seconds(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
