//! Per-call cache options

use std::time::Duration;

use serde::Serialize;

/// Hint used to shed low-value cache work under memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Never skipped, always awaits the remote round-trip
    High,
    #[default]
    Medium,
    /// Skipped on reads at critical usage and on writes at warning usage
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Options accepted by every `CacheManager` operation
///
/// ```rust
/// use dual_tier_cache::{CacheOptions, Priority};
/// use std::time::Duration;
///
/// let opts = CacheOptions::new()
///     .priority(Priority::Low)
///     .blocking(false)
///     .max_retries(1)
///     .retry_delay(Duration::from_millis(50));
/// assert!(!opts.blocking);
/// ```
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Entry lifetime; `None` uses the configured default
    pub ttl: Option<Duration>,
    pub use_local_fallback: bool,
    pub priority: Priority,
    /// Await the remote round-trip instead of detaching it
    pub blocking: bool,
    pub retry: bool,
    /// `None` uses the configured value
    pub max_retries: Option<u32>,
    /// `None` uses the configured value
    pub retry_delay: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            use_local_fallback: true,
            priority: Priority::Medium,
            blocking: true,
            retry: true,
            max_retries: None,
            retry_delay: None,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn use_local_fallback(mut self, enabled: bool) -> Self {
        self.use_local_fallback = enabled;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Whether the remote half of a write may be detached from the caller
    pub(crate) fn fire_and_forget(&self) -> bool {
        !self.blocking && self.priority != Priority::High
    }
}
