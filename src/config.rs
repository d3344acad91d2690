//! Cache Configuration
//!
//! Environment-driven configuration for both tiers, the retry envelope and
//! the memory governor. Every field has a default so `CacheConfig::default()`
//! works against a local Redis out of the box.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;

/// Hard ceiling for how long an entry may live in the local tier
pub const LOCAL_TTL_CEILING: Duration = Duration::from_secs(60);

/// Eviction policy applied by the memory governor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Ask the server to reclaim least-recently-used keys
    #[default]
    Lru,
    /// Ask the server to reclaim least-frequently-used keys
    Lfu,
    /// Delete sampled keys in scan order
    Fifo,
    /// Delete a shuffled sample
    Random,
    /// Delete the sampled keys closest to expiry
    Ttl,
}

impl EvictionPolicy {
    /// Server-side `maxmemory-policy` hint, for the policies that have one
    pub fn server_policy(self) -> Option<&'static str> {
        match self {
            Self::Lru => Some("allkeys-lru"),
            Self::Lfu => Some("allkeys-lfu"),
            Self::Fifo | Self::Random | Self::Ttl => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
            Self::Random => "random",
            Self::Ttl => "ttl",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            "random" => Ok(Self::Random),
            "ttl" => Ok(Self::Ttl),
            _ => Err(ConfigError::InvalidValue {
                name: "CACHE_EVICTION_POLICY",
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for the whole cache layer
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Full connection string; overrides host/port/password when set
    pub redis_url: Option<String>,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: u32,

    /// TTL used when a call does not specify one
    pub default_ttl: Duration,
    /// First key segment (`namespace`) used by key builders and governor scans
    pub key_prefix: String,
    /// Second key segment
    pub environment: String,

    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Retries per request after the initial attempt
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,

    pub health_check_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    /// Local tier lifetime, never above [`LOCAL_TTL_CEILING`]
    pub local_ttl: Duration,
    pub local_max_items: u64,
    /// Values above this size are never mirrored locally
    pub local_max_item_bytes: usize,

    /// Memory budget for the remote tier; 0 means "use the server's maxmemory"
    pub memory_limit_mb: u64,
    pub eviction_policy: EvictionPolicy,
    /// Percent of the memory budget
    pub memory_warning_threshold: f64,
    /// Percent of the memory budget
    pub memory_critical_threshold: f64,
    pub memory_check_interval: Duration,
    pub eviction_max_keys: usize,
    pub eviction_sample_size: usize,

    pub track_key_sizes: bool,
    pub key_size_sample: usize,

    /// Values above this size are not cached at all
    pub max_item_bytes: usize,
    /// Values above this size get a shortened TTL
    pub large_item_bytes: usize,
    pub large_item_min_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            default_ttl: Duration::from_secs(300),
            key_prefix: "cache".to_string(),
            environment: "dev".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            local_ttl: LOCAL_TTL_CEILING,
            local_max_items: 1000,
            local_max_item_bytes: 100 * 1024,
            memory_limit_mb: 0,
            eviction_policy: EvictionPolicy::Lru,
            memory_warning_threshold: 80.0,
            memory_critical_threshold: 95.0,
            memory_check_interval: Duration::from_secs(60),
            eviction_max_keys: 100,
            eviction_sample_size: 1000,
            track_key_sizes: false,
            key_size_sample: 200,
            max_item_bytes: 5 * 1024 * 1024,
            large_item_bytes: 1024 * 1024,
            large_item_min_ttl: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting configuration fails [`CacheConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`] with an injectable variable source
    ///
    /// # Errors
    ///
    /// See [`CacheConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env(&lookup);

        let config = Self {
            redis_url: env.string("REDIS_URL"),
            redis_host: env.string("REDIS_HOST").unwrap_or(d.redis_host),
            redis_port: env.parse("REDIS_PORT")?.unwrap_or(d.redis_port),
            redis_password: env.string("REDIS_PASSWORD"),
            redis_db: env.parse("REDIS_DB")?.unwrap_or(d.redis_db),
            default_ttl: env.secs("CACHE_DEFAULT_TTL")?.unwrap_or(d.default_ttl),
            key_prefix: env.string("CACHE_KEY_PREFIX").unwrap_or(d.key_prefix),
            environment: env.string("APP_ENV").unwrap_or(d.environment),
            connect_timeout: env
                .millis("REDIS_CONNECT_TIMEOUT_MS")?
                .unwrap_or(d.connect_timeout),
            command_timeout: env
                .millis("REDIS_COMMAND_TIMEOUT_MS")?
                .unwrap_or(d.command_timeout),
            max_retries: env.parse("REDIS_MAX_RETRIES")?.unwrap_or(d.max_retries),
            retry_delay: env.millis("CACHE_RETRY_DELAY_MS")?.unwrap_or(d.retry_delay),
            max_retry_delay: env
                .millis("CACHE_MAX_RETRY_DELAY_MS")?
                .unwrap_or(d.max_retry_delay),
            health_check_interval: env
                .millis("CACHE_HEALTH_CHECK_INTERVAL_MS")?
                .unwrap_or(d.health_check_interval),
            max_reconnect_attempts: env
                .parse("REDIS_MAX_RECONNECT_ATTEMPTS")?
                .unwrap_or(d.max_reconnect_attempts),
            reconnect_base_delay: env
                .millis("REDIS_RECONNECT_BASE_DELAY_MS")?
                .unwrap_or(d.reconnect_base_delay),
            reconnect_max_delay: env
                .millis("REDIS_RECONNECT_MAX_DELAY_MS")?
                .unwrap_or(d.reconnect_max_delay),
            local_ttl: env
                .secs("LOCAL_CACHE_TTL")?
                .unwrap_or(d.local_ttl)
                .min(LOCAL_TTL_CEILING),
            local_max_items: env
                .parse("LOCAL_CACHE_MAX_ITEMS")?
                .unwrap_or(d.local_max_items),
            local_max_item_bytes: env
                .parse("LOCAL_CACHE_MAX_ITEM_BYTES")?
                .unwrap_or(d.local_max_item_bytes),
            memory_limit_mb: env
                .parse("REDIS_MEMORY_LIMIT_MB")?
                .unwrap_or(d.memory_limit_mb),
            eviction_policy: env
                .parse("CACHE_EVICTION_POLICY")?
                .unwrap_or(d.eviction_policy),
            memory_warning_threshold: env
                .parse("CACHE_MEMORY_WARNING_THRESHOLD")?
                .unwrap_or(d.memory_warning_threshold),
            memory_critical_threshold: env
                .parse("CACHE_MEMORY_CRITICAL_THRESHOLD")?
                .unwrap_or(d.memory_critical_threshold),
            memory_check_interval: env
                .millis("CACHE_MEMORY_CHECK_INTERVAL_MS")?
                .unwrap_or(d.memory_check_interval),
            eviction_max_keys: env
                .parse("CACHE_EVICTION_MAX_KEYS")?
                .unwrap_or(d.eviction_max_keys),
            eviction_sample_size: env
                .parse("CACHE_EVICTION_SAMPLE")?
                .unwrap_or(d.eviction_sample_size),
            track_key_sizes: env.flag("CACHE_TRACK_KEY_SIZES")?.unwrap_or(d.track_key_sizes),
            key_size_sample: env
                .parse("CACHE_KEY_SIZE_SAMPLE")?
                .unwrap_or(d.key_size_sample),
            max_item_bytes: env
                .parse("CACHE_MAX_ITEM_BYTES")?
                .unwrap_or(d.max_item_bytes),
            large_item_bytes: env
                .parse("CACHE_LARGE_ITEM_BYTES")?
                .unwrap_or(d.large_item_bytes),
            large_item_min_ttl: env
                .secs("CACHE_LARGE_ITEM_MIN_TTL")?
                .unwrap_or(d.large_item_min_ttl),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// Returns an error when thresholds are inverted or a size/count that
    /// must be positive is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_warning_threshold >= self.memory_critical_threshold {
            return Err(ConfigError::Thresholds {
                warning: self.memory_warning_threshold,
                critical: self.memory_critical_threshold,
            });
        }
        if self.local_max_items == 0 {
            return Err(ConfigError::Zero("LOCAL_CACHE_MAX_ITEMS"));
        }
        if self.eviction_max_keys == 0 {
            return Err(ConfigError::Zero("CACHE_EVICTION_MAX_KEYS"));
        }
        Ok(())
    }

    /// Connection string for the remote tier
    pub fn redis_url(&self) -> String {
        if let Some(url) = &self.redis_url {
            return url.clone();
        }
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    /// Memory budget in bytes, if one is configured
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024)
    }

    /// Local lifetime for an entry whose remote lifetime is `ttl`
    pub fn local_ttl_for(&self, ttl: Duration) -> Duration {
        ttl.min(self.local_ttl).min(LOCAL_TTL_CEILING)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        self.string(name)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { name, value })
            })
            .transpose()
    }

    fn secs(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(name)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue { name, value }),
            })
            .transpose()
    }
}
