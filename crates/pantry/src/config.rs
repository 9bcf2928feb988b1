// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deployment configuration.

use std::{str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{AutocompleteOptions, EntryOptions, Error, LockOptions, Result};

/// Channel used for invalidation broadcasts when none is configured.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "cache_invalidation";

/// Settings shared by every component of a [`Pantry`](crate::Pantry).
///
/// The configuration can be deserialized from any serde format, or read from the process
/// environment with [`from_env`](Self::from_env). Fields that are not set keep their defaults.
///
/// | Field | Environment variable | Default |
/// |---|---|---|
/// | `redis_url` | `PANTRY_REDIS_URL`, then `REDIS_URL` | `redis://127.0.0.1:6379/0` |
/// | `invalidation_channel` | `PANTRY_INVALIDATION_CHANNEL` | `cache_invalidation` |
/// | `default_ttl_secs` | `PANTRY_DEFAULT_TTL_SECS` | 3600 |
/// | `lock_ttl_secs` | `PANTRY_LOCK_TTL_SECS` | 30 |
/// | `lock_retry_delay_ms` | `PANTRY_LOCK_RETRY_DELAY_MS` | 100 |
/// | `lock_retry_times` | `PANTRY_LOCK_RETRY_TIMES` | unbounded |
/// | `autocomplete_min_prefix_len` | `PANTRY_AUTOCOMPLETE_MIN_PREFIX_LEN` | 2 |
/// | `autocomplete_limit` | `PANTRY_AUTOCOMPLETE_LIMIT` | 10 |
///
/// # Examples
///
/// ```
/// use pantry::PantryConfig;
///
/// let config: PantryConfig = serde_json::from_str(r#"{ "lock_ttl_secs": 60 }"#)?;
/// config.validate()?;
///
/// assert_eq!(config.lock_options().ttl().as_secs(), 60);
/// assert_eq!(config.invalidation_channel, "cache_invalidation");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PantryConfig {
    /// Connection URL of the Redis server.
    pub redis_url: String,
    /// Pub/sub channel carrying invalidation messages.
    pub invalidation_channel: String,
    /// Lifetime of cache entries written without an explicit TTL.
    pub default_ttl_secs: u64,
    /// Lease length of distributed locks.
    pub lock_ttl_secs: u64,
    /// Pause between blocking acquisition attempts.
    pub lock_retry_delay_ms: u64,
    /// Total blocking acquisition attempts, or `None` to retry indefinitely.
    pub lock_retry_times: Option<u32>,
    /// Shortest prefix written to autocomplete indexes.
    pub autocomplete_min_prefix_len: usize,
    /// Number of suggestions returned by autocomplete queries.
    pub autocomplete_limit: usize,
}

impl Default for PantryConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_owned(),
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_owned(),
            default_ttl_secs: 3600,
            lock_ttl_secs: 30,
            lock_retry_delay_ms: 100,
            lock_retry_times: None,
            autocomplete_min_prefix_len: 2,
            autocomplete_limit: 10,
        }
    }
}

impl PantryConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set but cannot be parsed, or if the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PANTRY_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            config.redis_url = url;
        }
        if let Some(channel) = lookup("PANTRY_INVALIDATION_CHANNEL") {
            config.invalidation_channel = channel;
        }
        parse_into(&lookup, "PANTRY_DEFAULT_TTL_SECS", &mut config.default_ttl_secs)?;
        parse_into(&lookup, "PANTRY_LOCK_TTL_SECS", &mut config.lock_ttl_secs)?;
        parse_into(&lookup, "PANTRY_LOCK_RETRY_DELAY_MS", &mut config.lock_retry_delay_ms)?;
        if let Some(raw) = lookup("PANTRY_LOCK_RETRY_TIMES") {
            config.lock_retry_times = Some(parse("PANTRY_LOCK_RETRY_TIMES", &raw)?);
        }
        parse_into(&lookup, "PANTRY_AUTOCOMPLETE_MIN_PREFIX_LEN", &mut config.autocomplete_min_prefix_len)?;
        parse_into(&lookup, "PANTRY_AUTOCOMPLETE_LIMIT", &mut config.autocomplete_limit)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        const SCHEMES: [&str; 4] = ["redis://", "rediss://", "redis+unix://", "unix://"];

        if !SCHEMES.iter().any(|scheme| self.redis_url.starts_with(scheme)) {
            return Err(Error::configuration(format!(
                "redis_url `{}` must start with one of {}",
                self.redis_url,
                SCHEMES.join(", ")
            )));
        }
        if self.invalidation_channel.is_empty() {
            return Err(Error::configuration("invalidation_channel must not be empty"));
        }
        if self.default_ttl_secs == 0 {
            return Err(Error::configuration("default_ttl_secs must be positive"));
        }
        // Heartbeats renew every third of the lease, which must stay at least one second.
        if self.lock_ttl_secs < 3 {
            return Err(Error::configuration("lock_ttl_secs must be at least 3"));
        }
        if self.lock_retry_times == Some(0) {
            return Err(Error::configuration("lock_retry_times must allow at least one attempt"));
        }
        if self.autocomplete_min_prefix_len == 0 {
            return Err(Error::configuration("autocomplete_min_prefix_len must be positive"));
        }
        if self.autocomplete_limit == 0 {
            return Err(Error::configuration("autocomplete_limit must be positive"));
        }
        Ok(())
    }

    /// Returns entry options carrying the default TTL.
    #[must_use]
    pub fn entry_options(&self) -> EntryOptions {
        EntryOptions::new(Duration::from_secs(self.default_ttl_secs))
    }

    /// Returns lock options carrying the configured lease and retry policy.
    #[must_use]
    pub fn lock_options(&self) -> LockOptions {
        let options = LockOptions::new()
            .with_ttl(Duration::from_secs(self.lock_ttl_secs))
            .with_retry_delay(Duration::from_millis(self.lock_retry_delay_ms));

        match self.lock_retry_times {
            Some(times) => options.with_retry_times(times),
            None => options,
        }
    }

    /// Returns autocomplete options carrying the configured prefix length and limit.
    #[must_use]
    pub fn autocomplete_options(&self) -> AutocompleteOptions {
        AutocompleteOptions::new()
            .with_min_prefix_len(self.autocomplete_min_prefix_len)
            .with_limit(self.autocomplete_limit)
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::configuration(format!("{name}=`{raw}` is invalid: {e}")))
}

fn parse_into<T: FromStr, F>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse(name, &raw)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = PantryConfig::default();
        config.validate().unwrap();

        assert_eq!(config.lock_options().ttl(), Duration::from_secs(30));
        assert_eq!(config.lock_options().retry_delay(), Duration::from_millis(100));
        assert_eq!(config.lock_options().retry_times(), None);
        assert_eq!(config.entry_options().ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = PantryConfig::from_lookup(lookup(&[
            ("PANTRY_REDIS_URL", "redis://cache:6380/2"),
            ("REDIS_URL", "redis://ignored:6379"),
            ("PANTRY_LOCK_TTL_SECS", "45"),
            ("PANTRY_LOCK_RETRY_TIMES", "5"),
            ("PANTRY_AUTOCOMPLETE_LIMIT", " 20 "),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.lock_ttl_secs, 45);
        assert_eq!(config.lock_options().retry_times(), Some(5));
        assert_eq!(config.autocomplete_options().limit(), 20);
    }

    #[test]
    fn generic_redis_url_is_a_fallback() {
        let config = PantryConfig::from_lookup(lookup(&[("REDIS_URL", "rediss://secure:6379")])).unwrap();
        assert_eq!(config.redis_url, "rediss://secure:6379");
    }

    #[test]
    fn unparsable_values_are_configuration_errors() {
        let error = PantryConfig::from_lookup(lookup(&[("PANTRY_LOCK_TTL_SECS", "soon")])).unwrap_err();

        assert!(matches!(error, Error::Configuration(_)));
        assert!(error.to_string().contains("PANTRY_LOCK_TTL_SECS"));
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let cases = [
            PantryConfig {
                redis_url: "http://localhost".to_owned(),
                ..PantryConfig::default()
            },
            PantryConfig {
                lock_ttl_secs: 1,
                ..PantryConfig::default()
            },
            PantryConfig {
                lock_retry_times: Some(0),
                ..PantryConfig::default()
            },
            PantryConfig {
                autocomplete_limit: 0,
                ..PantryConfig::default()
            },
        ];

        for config in cases {
            assert!(matches!(config.validate(), Err(Error::Configuration(_))), "{config:?}");
        }
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: PantryConfig = serde_json::from_str(r#"{ "invalidation_channel": "inv", "lock_retry_times": 3 }"#).unwrap();

        assert_eq!(config.invalidation_channel, "inv");
        assert_eq!(config.lock_retry_times, Some(3));
        assert_eq!(config.default_ttl_secs, 3600);
        assert!(serde_json::from_str::<PantryConfig>(r#"{ "unknown": 1 }"#).is_err());
    }
}
