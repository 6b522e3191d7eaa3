//! Profile core configuration.
//!
//! Defaults suit a phone-class client. `ProfileConfig::from_env` overlays
//! environment variables for tools and tests.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default cooldown after a successful fetch (1 hour)
pub const DEFAULT_FETCH_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Default first back-off window after a failed fetch (30 seconds)
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Default soft cap on cached lookups
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Default number of records loaded by a cache warm-up
pub const DEFAULT_WARM_LIMIT: usize = 256;

/// Where the core is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HostEnvironment {
    /// The foreground application
    #[default]
    MainApp,
    /// A restricted background extension
    Extension,
}

/// Fetch throttling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Minimum time between successful fetches of one profile
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    /// Back-off after the first failure; doubles per further failure
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    /// Upper bound on the back-off window
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_FETCH_COOLDOWN,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_FETCH_COOLDOWN,
        }
    }
}

impl FetchConfig {
    /// Back-off window after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Read cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft cap on cached lookups
    pub capacity: usize,
    /// Records loaded by a warm-up
    pub warm_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            warm_limit: DEFAULT_WARM_LIMIT,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// SQLite file path; `None` keeps everything in memory
    pub database_path: Option<String>,
    /// Fetch throttling
    pub fetch: FetchConfig,
    /// Read cache
    pub cache: CacheConfig,
    /// Host environment, supplied by the embedding app
    pub host: HostEnvironment,
}

impl ProfileConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.database_path = env::var("PROFILE_DATABASE_PATH").ok();

        if let Some(secs) = parse_env::<u64>("PROFILE_FETCH_COOLDOWN_SECS") {
            config.fetch.cooldown = Duration::from_secs(secs);
            config.fetch.max_backoff = config.fetch.cooldown;
        }
        if let Some(secs) = parse_env::<u64>("PROFILE_FETCH_BACKOFF_SECS") {
            config.fetch.initial_backoff = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_env::<usize>("PROFILE_CACHE_CAPACITY") {
            config.cache.capacity = capacity;
        }

        config
    }

    /// Same configuration, running as a background extension
    pub fn in_extension(mut self) -> Self {
        self.host = HostEnvironment::Extension;
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProfileConfig::default();
        assert!(config.database_path.is_none());
        assert_eq!(config.fetch.cooldown, Duration::from_secs(3600));
        assert_eq!(config.fetch.initial_backoff, Duration::from_secs(30));
        assert_eq!(config.cache.capacity, 1024);
        assert_eq!(config.host, HostEnvironment::MainApp);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.backoff_for(1), Duration::from_secs(30));
        assert_eq!(fetch.backoff_for(2), Duration::from_secs(60));
        assert_eq!(fetch.backoff_for(4), Duration::from_secs(240));
        assert_eq!(fetch.backoff_for(10), Duration::from_secs(3600));
        assert_eq!(fetch.backoff_for(200), Duration::from_secs(3600));
    }

    #[test]
    fn test_json_round_trip_uses_seconds() {
        let json = serde_json::to_value(ProfileConfig::default()).unwrap();
        assert_eq!(json["fetch"]["cooldown"], 3600);

        let back: ProfileConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.fetch.initial_backoff, Duration::from_secs(30));
    }
}
