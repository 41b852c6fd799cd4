//! Engine configuration.
//!
//! [`EngineConfig`] carries the engine-wide defaults applied to every stage
//! plus the worker pool settings. It can be built in code through
//! [`EngineConfigBuilder`] or read from a string key/value [`Parameters`]
//! store, where user-supplied values always win over registered defaults.
//!
//! ## Recognised Parameters
//!
//! | Key | Type | Default |
//! |-----|------|---------|
//! | `nthreads` | usize | number of CPUs |
//! | `sluice:chunksize` | usize | 1 |
//! | `sluice:backoff_strategy` | constant / linear / exponential | exponential |
//! | `sluice:backoff_initial_us` | u64 | 1 |
//! | `sluice:backoff_tries` | u32 | 4 |
//! | `sluice:checkin_ms` | u64 | 500 |
//! | `sluice:queue_threshold` | usize | 64 |
//! | `sluice:locations` | usize | 1 |
//! | `sluice:limit_total_events_in_flight` | bool | true |
//! | `sluice:event_pool_size` | usize | 64 |
//! | `sluice:stall_multiple` | u32 | 4 |
//! | `sluice:fairness` | sticky / `round_robin` | sticky |
//! | `sluice:sticky_streak` | u32 | 8 |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use fxhash::FxHashMap;
use serde::Serialize;

use crate::engine::Fairness;
use crate::stage::BackoffStrategy;

/// Parameter keys understood by [`EngineConfig::from_parameters`].
pub mod keys {
    /// Worker thread count.
    pub const NTHREADS: &str = "nthreads";
    /// Items per `execute` call.
    pub const CHUNKSIZE: &str = "sluice:chunksize";
    /// Backoff growth policy.
    pub const BACKOFF_STRATEGY: &str = "sluice:backoff_strategy";
    /// First backoff wait, in microseconds.
    pub const BACKOFF_INITIAL_US: &str = "sluice:backoff_initial_us";
    /// Backoff escalations before yielding a stage.
    pub const BACKOFF_TRIES: &str = "sluice:backoff_tries";
    /// Maximum single wait, in milliseconds.
    pub const CHECKIN_MS: &str = "sluice:checkin_ms";
    /// Default queue capacity.
    pub const QUEUE_THRESHOLD: &str = "sluice:queue_threshold";
    /// Number of locality domains.
    pub const LOCATIONS: &str = "sluice:locations";
    /// Whether item pools cap the number of items in flight.
    pub const LIMIT_IN_FLIGHT: &str = "sluice:limit_total_events_in_flight";
    /// Item pool capacity.
    pub const POOL_SIZE: &str = "sluice:event_pool_size";
    /// Heartbeat age, in check-in periods, after which a worker is stalled.
    pub const STALL_MULTIPLE: &str = "sluice:stall_multiple";
    /// Scheduler fairness policy.
    pub const FAIRNESS: &str = "sluice:fairness";
    /// Longest run of consecutive picks of one stage under sticky fairness.
    pub const STICKY_STREAK: &str = "sluice:sticky_streak";
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required parameter was not set.
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// A parameter value could not be parsed.
    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        /// Parameter key
        key: String,
        /// Offending value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// A `key=value` assignment was malformed.
    #[error("Malformed parameter assignment: '{0}'")]
    MalformedAssignment(String),

    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// String key/value parameter store.
///
/// Defaults are registered with [`set_default`](Self::set_default) and never
/// overwrite a value the user already supplied.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    values: FxHashMap<String, String>,
}

impl Parameters {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    /// Registers a default. Returns the effective value.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl ToString) -> &str {
        self.values
            .entry(key.into())
            .or_insert_with(|| value.to_string())
    }

    /// Parses and stores a `key=value` assignment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedAssignment`] if there is no `=` or the
    /// key is empty.
    pub fn set_assignment(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedAssignment(assignment.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::MalformedAssignment(assignment.to_string()));
        }
        self.set(key, value.trim());
        Ok(())
    }

    /// Returns the raw value of a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the raw value of a key, or `default`.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Returns true if the key is set.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Parses the value of a key, if set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the value does not parse.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Parses the value of a key that must be set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParameter`] if the key is absent, or
    /// [`ConfigError::InvalidValue`] if it does not parse.
    pub fn require<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.parse(key)?
            .ok_or_else(|| ConfigError::MissingParameter(key.to_string()))
    }

    /// Number of keys set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over all entries, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut entries: Vec<_> = self
            .values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        entries.sort_unstable();
        entries.into_iter()
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    /// Worker threads started by a plain `run`
    pub nthreads: usize,
    /// Items per `execute` call
    pub chunksize: usize,
    /// Backoff growth policy on `ComeBackLater`
    pub backoff_strategy: BackoffStrategy,
    /// First backoff wait
    pub initial_backoff: Duration,
    /// Upper bound on any single wait, and the idle re-poll period
    pub checkin_time: Duration,
    /// Backoff escalations before a worker yields a stage
    pub backoff_tries: u32,
    /// Default queue capacity
    pub queue_threshold: usize,
    /// Scheduler fairness policy
    pub fairness: Fairness,
    /// Number of locality domains (worker `i` runs in domain `i % locations`)
    pub locations: usize,
    /// Whether item pools cap the number of items in flight
    pub limit_in_flight: bool,
    /// Item pool capacity
    pub pool_size: usize,
    /// Heartbeat age, in check-in periods, after which a worker is stalled
    pub stall_multiple: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nthreads: num_cpus::get(),
            chunksize: 1,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_backoff: Duration::from_micros(1),
            checkin_time: Duration::from_millis(500),
            backoff_tries: 4,
            queue_threshold: 64,
            fairness: Fairness::default(),
            locations: 1,
            limit_in_flight: true,
            pool_size: 64,
            stall_multiple: 4,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nthreads == 0 {
            return Err(ConfigError::Invalid("nthreads must be > 0".to_string()));
        }
        if self.chunksize == 0 {
            return Err(ConfigError::Invalid("chunksize must be > 0".to_string()));
        }
        if self.queue_threshold == 0 {
            return Err(ConfigError::Invalid(
                "queue_threshold must be > 0".to_string(),
            ));
        }
        if self.locations == 0 {
            return Err(ConfigError::Invalid("locations must be > 0".to_string()));
        }
        if self.limit_in_flight && self.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "pool_size must be > 0 when in-flight items are limited".to_string(),
            ));
        }
        if self.stall_multiple == 0 {
            return Err(ConfigError::Invalid(
                "stall_multiple must be > 0".to_string(),
            ));
        }
        if self.checkin_time.is_zero() {
            return Err(ConfigError::Invalid(
                "checkin_time must be > 0".to_string(),
            ));
        }
        if let Fairness::Sticky { max_streak: 0 } = self.fairness {
            return Err(ConfigError::Invalid(
                "sticky fairness needs max_streak > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads a configuration from a parameter store.
    ///
    /// Keys that are absent keep their default value.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not parse or the result is invalid.
    pub fn from_parameters(params: &Parameters) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let micros = |d: Duration| u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);

        let fairness = match params.get(keys::FAIRNESS) {
            None => defaults.fairness,
            Some(raw) => raw
                .parse::<Fairness>()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: keys::FAIRNESS.to_string(),
                    value: raw.to_string(),
                    reason,
                })?,
        };
        let fairness = match (fairness, params.parse::<u32>(keys::STICKY_STREAK)?) {
            (Fairness::Sticky { .. }, Some(max_streak)) => Fairness::Sticky { max_streak },
            (fairness, _) => fairness,
        };

        let backoff_strategy = match params.get(keys::BACKOFF_STRATEGY) {
            None => defaults.backoff_strategy,
            Some(raw) => raw
                .parse::<BackoffStrategy>()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: keys::BACKOFF_STRATEGY.to_string(),
                    value: raw.to_string(),
                    reason,
                })?,
        };

        let config = Self {
            nthreads: params.parse(keys::NTHREADS)?.unwrap_or(defaults.nthreads),
            chunksize: params.parse(keys::CHUNKSIZE)?.unwrap_or(defaults.chunksize),
            backoff_strategy,
            initial_backoff: Duration::from_micros(
                params
                    .parse(keys::BACKOFF_INITIAL_US)?
                    .unwrap_or_else(|| micros(defaults.initial_backoff)),
            ),
            checkin_time: Duration::from_millis(
                params
                    .parse(keys::CHECKIN_MS)?
                    .unwrap_or_else(|| millis(defaults.checkin_time)),
            ),
            backoff_tries: params
                .parse(keys::BACKOFF_TRIES)?
                .unwrap_or(defaults.backoff_tries),
            queue_threshold: params
                .parse(keys::QUEUE_THRESHOLD)?
                .unwrap_or(defaults.queue_threshold),
            fairness,
            locations: params.parse(keys::LOCATIONS)?.unwrap_or(defaults.locations),
            limit_in_flight: params
                .parse(keys::LIMIT_IN_FLIGHT)?
                .unwrap_or(defaults.limit_in_flight),
            pool_size: params.parse(keys::POOL_SIZE)?.unwrap_or(defaults.pool_size),
            stall_multiple: params
                .parse(keys::STALL_MULTIPLE)?
                .unwrap_or(defaults.stall_multiple),
        };
        config.validate()?;
        Ok(config)
    }

    /// Registers this configuration's values as defaults in `params`.
    ///
    /// Values the user already set are left untouched.
    pub fn register_defaults(&self, params: &mut Parameters) {
        params.set_default(keys::NTHREADS, self.nthreads);
        params.set_default(keys::CHUNKSIZE, self.chunksize);
        params.set_default(keys::BACKOFF_STRATEGY, self.backoff_strategy);
        params.set_default(keys::BACKOFF_INITIAL_US, self.initial_backoff.as_micros());
        params.set_default(keys::BACKOFF_TRIES, self.backoff_tries);
        params.set_default(keys::CHECKIN_MS, self.checkin_time.as_millis());
        params.set_default(keys::QUEUE_THRESHOLD, self.queue_threshold);
        params.set_default(keys::LOCATIONS, self.locations);
        params.set_default(keys::LIMIT_IN_FLIGHT, self.limit_in_flight);
        params.set_default(keys::POOL_SIZE, self.pool_size);
        params.set_default(keys::STALL_MULTIPLE, self.stall_multiple);
        params.set_default(keys::FAIRNESS, self.fairness);
        if let Fairness::Sticky { max_streak } = self.fairness {
            params.set_default(keys::STICKY_STREAK, max_streak);
        }
    }

    /// Time without a heartbeat after which a busy worker is reported stalled.
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        self.checkin_time.saturating_mul(self.stall_multiple)
    }
}

/// Builder for `EngineConfig`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    nthreads: Option<usize>,
    chunksize: Option<usize>,
    backoff_strategy: Option<BackoffStrategy>,
    initial_backoff: Option<Duration>,
    checkin_time: Option<Duration>,
    backoff_tries: Option<u32>,
    queue_threshold: Option<usize>,
    fairness: Option<Fairness>,
    locations: Option<usize>,
    limit_in_flight: Option<bool>,
    pool_size: Option<usize>,
    stall_multiple: Option<u32>,
}

impl EngineConfigBuilder {
    /// Sets the number of worker threads.
    #[must_use]
    pub fn nthreads(mut self, n: usize) -> Self {
        self.nthreads = Some(n);
        self
    }

    /// Sets the default chunk size.
    #[must_use]
    pub fn chunksize(mut self, n: usize) -> Self {
        self.chunksize = Some(n);
        self
    }

    /// Sets the default backoff strategy.
    #[must_use]
    pub fn backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = Some(strategy);
        self
    }

    /// Sets the default initial backoff.
    #[must_use]
    pub fn initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = Some(initial);
        self
    }

    /// Sets the check-in time.
    #[must_use]
    pub fn checkin_time(mut self, checkin: Duration) -> Self {
        self.checkin_time = Some(checkin);
        self
    }

    /// Sets the number of backoff escalations before a stage is yielded.
    #[must_use]
    pub fn backoff_tries(mut self, tries: u32) -> Self {
        self.backoff_tries = Some(tries);
        self
    }

    /// Sets the default queue capacity.
    #[must_use]
    pub fn queue_threshold(mut self, threshold: usize) -> Self {
        self.queue_threshold = Some(threshold);
        self
    }

    /// Sets the scheduler fairness policy.
    #[must_use]
    pub fn fairness(mut self, fairness: Fairness) -> Self {
        self.fairness = Some(fairness);
        self
    }

    /// Sets the number of locality domains.
    #[must_use]
    pub fn locations(mut self, n: usize) -> Self {
        self.locations = Some(n);
        self
    }

    /// Enables or disables the in-flight cap of item pools.
    #[must_use]
    pub fn limit_in_flight(mut self, enabled: bool) -> Self {
        self.limit_in_flight = Some(enabled);
        self
    }

    /// Sets the item pool capacity.
    #[must_use]
    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = Some(n);
        self
    }

    /// Sets the stall detection multiple.
    #[must_use]
    pub fn stall_multiple(mut self, n: u32) -> Self {
        self.stall_multiple = Some(n);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            nthreads: self.nthreads.unwrap_or(defaults.nthreads),
            chunksize: self.chunksize.unwrap_or(defaults.chunksize),
            backoff_strategy: self.backoff_strategy.unwrap_or(defaults.backoff_strategy),
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            checkin_time: self.checkin_time.unwrap_or(defaults.checkin_time),
            backoff_tries: self.backoff_tries.unwrap_or(defaults.backoff_tries),
            queue_threshold: self.queue_threshold.unwrap_or(defaults.queue_threshold),
            fairness: self.fairness.unwrap_or(defaults.fairness),
            locations: self.locations.unwrap_or(defaults.locations),
            limit_in_flight: self.limit_in_flight.unwrap_or(defaults.limit_in_flight),
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            stall_multiple: self.stall_multiple.unwrap_or(defaults.stall_multiple),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.nthreads > 0);
        assert_eq!(config.chunksize, 1);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.initial_backoff, Duration::from_micros(1));
        assert_eq!(config.checkin_time, Duration::from_millis(500));
        assert_eq!(config.backoff_tries, 4);
        assert_eq!(config.fairness, Fairness::Sticky { max_streak: 8 });
        assert!(config.validate().is_ok());
        assert_eq!(config.stall_threshold(), Duration::from_secs(2));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .nthreads(3)
            .chunksize(10)
            .backoff_strategy(BackoffStrategy::Linear)
            .backoff_tries(2)
            .fairness(Fairness::RoundRobin)
            .locations(2)
            .build()
            .unwrap();
        assert_eq!(config.nthreads, 3);
        assert_eq!(config.chunksize, 10);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.backoff_tries, 2);
        assert_eq!(config.fairness, Fairness::RoundRobin);
        assert_eq!(config.locations, 2);
    }

    #[test]
    fn test_validation_rejects_zero() {
        assert!(EngineConfig::builder().nthreads(0).build().is_err());
        assert!(EngineConfig::builder().chunksize(0).build().is_err());
        assert!(EngineConfig::builder().locations(0).build().is_err());
        assert!(EngineConfig::builder()
            .checkin_time(Duration::ZERO)
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .fairness(Fairness::Sticky { max_streak: 0 })
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .limit_in_flight(false)
            .pool_size(0)
            .build()
            .is_ok());
    }

    #[test]
    fn test_from_parameters() {
        let mut params = Parameters::new();
        params.set(keys::NTHREADS, 5);
        params.set(keys::CHUNKSIZE, "32");
        params.set(keys::BACKOFF_STRATEGY, "constant");
        params.set(keys::BACKOFF_INITIAL_US, 250);
        params.set(keys::CHECKIN_MS, 20);
        params.set(keys::FAIRNESS, "sticky");
        params.set(keys::STICKY_STREAK, 3);
        params.set(keys::LIMIT_IN_FLIGHT, false);

        let config = EngineConfig::from_parameters(&params).unwrap();
        assert_eq!(config.nthreads, 5);
        assert_eq!(config.chunksize, 32);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Constant);
        assert_eq!(config.initial_backoff, Duration::from_micros(250));
        assert_eq!(config.checkin_time, Duration::from_millis(20));
        assert_eq!(config.fairness, Fairness::Sticky { max_streak: 3 });
        assert!(!config.limit_in_flight);
        assert_eq!(config.backoff_tries, 4);
    }

    #[test]
    fn test_from_parameters_invalid_value() {
        let mut params = Parameters::new();
        params.set(keys::CHUNKSIZE, "lots");
        match EngineConfig::from_parameters(&params) {
            Err(ConfigError::InvalidValue { key, value, .. }) => {
                assert_eq!(key, keys::CHUNKSIZE);
                assert_eq!(value, "lots");
            }
            other => panic!("expected invalid value, got {other:?}"),
        }

        let mut params = Parameters::new();
        params.set(keys::FAIRNESS, "lottery");
        assert!(EngineConfig::from_parameters(&params).is_err());
    }

    #[test]
    fn test_user_value_overrides_default() {
        let mut params = Parameters::new();
        params.set(keys::CHUNKSIZE, 7);
        EngineConfig::default().register_defaults(&mut params);

        assert_eq!(params.get(keys::CHUNKSIZE), Some("7"));
        assert_eq!(params.get(keys::BACKOFF_TRIES), Some("4"));
        assert_eq!(params.get(keys::FAIRNESS), Some("sticky"));

        let effective = params.set_default(keys::CHUNKSIZE, 99).to_string();
        assert_eq!(effective, "7");
        assert_eq!(EngineConfig::from_parameters(&params).unwrap().chunksize, 7);
    }

    #[test]
    fn test_parameters_access() {
        let mut params = Parameters::new();
        assert!(params.is_empty());
        params.set_assignment("a = 1").unwrap();
        params.set_assignment("b=two=2").unwrap();
        assert!(params.set_assignment("novalue").is_err());
        assert!(params.set_assignment("=3").is_err());

        assert_eq!(params.len(), 2);
        assert_eq!(params.get("b"), Some("two=2"));
        assert_eq!(params.get_or("c", "fallback"), "fallback");
        assert!(params.contains("a"));
        assert_eq!(params.require::<u8>("a").unwrap(), 1);
        assert_eq!(
            params.require::<u8>("c"),
            Err(ConfigError::MissingParameter("c".to_string()))
        );
        let keys: Vec<_> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
