//! Store configuration.
//!
//! Durations are written the human way (`"15m"`, `"5ms"`, `"30s"`) and
//! resolved once, when the store is opened, into [`StoreLimits`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Tunables of the state store, as loaded from a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a tombstone is kept before it may be reaped.
    pub tombstone_ttl: String,
    /// Width of the window in which tombstone hints share one timer.
    pub tombstone_granularity: String,
    /// Upper bound on how long a blocking query may wait.
    pub max_query_time: String,
    /// Wait used when a blocking query does not ask for one.
    pub default_query_time: String,
    /// How long a write transaction may wait for the writer slot.
    pub write_deadline: String,
    /// Upper bound on a session's lock delay.
    pub max_lock_delay: String,
    /// Session TTL timers fire after `ttl * session_ttl_multiplier`.
    pub session_ttl_multiplier: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tombstone_ttl: "15m".to_string(),
            tombstone_granularity: "30s".to_string(),
            max_query_time: "10m".to_string(),
            default_query_time: "5m".to_string(),
            write_deadline: "30s".to_string(),
            max_lock_delay: "60s".to_string(),
            session_ttl_multiplier: 2,
        }
    }
}

/// Parsed and validated [`StoreConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub tombstone_ttl: Duration,
    pub tombstone_granularity: Duration,
    pub max_query_time: Duration,
    pub default_query_time: Duration,
    pub write_deadline: Duration,
    pub max_lock_delay: Duration,
    pub session_ttl_multiplier: u32,
}

impl StoreConfig {
    /// Parse every duration and check the settings against each other.
    ///
    /// A tombstone must outlive the longest blocking query, or a client
    /// that saw a deleted key's index could read a lower one after the
    /// tombstone is reaped.
    pub fn resolve(&self) -> StateResult<StoreLimits> {
        let limits = StoreLimits {
            tombstone_ttl: duration_field("tombstone_ttl", &self.tombstone_ttl)?,
            tombstone_granularity: duration_field("tombstone_granularity", &self.tombstone_granularity)?,
            max_query_time: duration_field("max_query_time", &self.max_query_time)?,
            default_query_time: duration_field("default_query_time", &self.default_query_time)?,
            write_deadline: duration_field("write_deadline", &self.write_deadline)?,
            max_lock_delay: duration_field("max_lock_delay", &self.max_lock_delay)?,
            session_ttl_multiplier: self.session_ttl_multiplier,
        };

        if limits.session_ttl_multiplier == 0 {
            return Err(StateError::Config("session_ttl_multiplier must be positive".into()));
        }
        if limits.tombstone_ttl <= limits.max_query_time {
            return Err(StateError::Config(format!(
                "tombstone_ttl ({}) must exceed max_query_time ({})",
                self.tombstone_ttl, self.max_query_time
            )));
        }
        if limits.default_query_time > limits.max_query_time {
            return Err(StateError::Config(format!(
                "default_query_time ({}) exceeds max_query_time ({})",
                self.default_query_time, self.max_query_time
            )));
        }
        Ok(limits)
    }

    pub fn validate(&self) -> StateResult<()> {
        self.resolve().map(|_| ())
    }
}

impl StoreLimits {
    /// Wait for a blocking query: zero asks for the default, anything
    /// else is capped at the maximum.
    pub fn clamp_query_time(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.default_query_time
        } else {
            requested.min(self.max_query_time)
        }
    }
}

fn duration_field(name: &str, value: &str) -> StateResult<Duration> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        Some(_) => Err(StateError::Config(format!("{name} must be positive"))),
        None => Err(StateError::Config(format!("{name}: invalid duration {value:?}"))),
    }
}

/// Parse a duration string like "500ms", "30s", "15m", "1h". A bare
/// number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5ms"), Some(Duration::from_millis(5)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("999999999999999999h"), None);
        assert_eq!(parse_duration("999999999999999999m"), None);
    }

    #[test]
    fn defaults_are_valid() {
        let limits = StoreConfig::default().resolve().unwrap();
        assert_eq!(limits.max_lock_delay, Duration::from_secs(60));
        assert!(limits.tombstone_ttl > limits.max_query_time);
    }

    #[test]
    fn tombstone_ttl_must_exceed_max_query_time() {
        let config = StoreConfig {
            tombstone_ttl: "10m".into(),
            max_query_time: "10m".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StateError::Config(_))));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let zero = StoreConfig {
            tombstone_granularity: "0ms".into(),
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(StateError::Config(_))));

        let garbage = StoreConfig {
            write_deadline: "forever".into(),
            ..Default::default()
        };
        assert!(matches!(garbage.validate(), Err(StateError::Config(_))));

        let multiplier = StoreConfig {
            session_ttl_multiplier: 0,
            ..Default::default()
        };
        assert!(matches!(multiplier.validate(), Err(StateError::Config(_))));
    }

    #[test]
    fn default_query_time_cannot_exceed_max() {
        let config = StoreConfig {
            default_query_time: "11m".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn clamp_query_time() {
        let limits = StoreConfig::default().resolve().unwrap();
        assert_eq!(limits.clamp_query_time(Duration::ZERO), Duration::from_secs(300));
        assert_eq!(limits.clamp_query_time(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(limits.clamp_query_time(Duration::from_secs(3600)), Duration::from_secs(600));
    }

    #[test]
    fn loads_from_toml_with_defaults() {
        let config: StoreConfig = toml::from_str(
            r#"
            tombstone_ttl = "20m"
            session_ttl_multiplier = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.tombstone_ttl, "20m");
        assert_eq!(config.max_query_time, "10m");
        assert_eq!(config.session_ttl_multiplier, 3);
        config.validate().unwrap();
    }
}
