//! Configuration for superchan instances.
//!
//! Every instance carries its own copy of a [`SuperchanConfig`]; nothing is
//! process-global. The config doubles as the factory for all constructors.

use crate::errors::SuperchanError;
#[cfg(unix)]
use crate::errors::Cause;
#[cfg(unix)]
use crate::signal::{Signal, SignalCause};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default channel capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// How deferred hooks are executed once a scope ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Hooks are called one after another on the worker task. A panicking
    /// hook is not contained.
    Sequential,
    /// Each hook runs as its own blocking task; a barrier joins every phase.
    /// Panics are caught and logged.
    #[default]
    FanOut,
}

/// Settings read when an instance is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperchanConfig {
    /// Channel capacity.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Whether a caught signal cancels the context before or after the
    /// deferred hooks run.
    #[serde(default = "default_cancel_before_defer")]
    pub cancel_before_defer: bool,
    /// Hook execution mode.
    #[serde(default)]
    pub cleanup_mode: CleanupMode,
    /// How long `wait()` polls for cleanup to finish.
    #[serde(default = "default_max_wait", with = "duration_ms", rename = "max_wait_ms")]
    pub max_wait: Duration,
    /// Polling interval used by `wait()`.
    #[serde(
        default = "default_poll_interval",
        with = "duration_ms",
        rename = "poll_interval_ms"
    )]
    pub poll_interval: Duration,
    /// Maps a signal caught by a signal bridge to the scope's cause.
    #[cfg(unix)]
    #[serde(skip)]
    pub signal_cause: SignalCause,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_cancel_before_defer() -> bool {
    true
}

fn default_max_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

impl Default for SuperchanConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            cancel_before_defer: default_cancel_before_defer(),
            cleanup_mode: CleanupMode::default(),
            max_wait: default_max_wait(),
            poll_interval: default_poll_interval(),
            #[cfg(unix)]
            signal_cause: SignalCause::default(),
        }
    }
}

impl SuperchanConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the channel capacity.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the cancel/cleanup ordering used by signal bridges.
    #[must_use]
    pub fn with_cancel_before_defer(mut self, cancel_first: bool) -> Self {
        self.cancel_before_defer = cancel_first;
        self
    }

    /// Sets the hook execution mode.
    #[must_use]
    pub fn with_cleanup_mode(mut self, mode: CleanupMode) -> Self {
        self.cleanup_mode = mode;
        self
    }

    /// Sets the `wait()` budget.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the `wait()` polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how a caught signal becomes the scope's cause.
    #[cfg(unix)]
    #[must_use]
    pub fn with_signal_cause(mut self, f: impl Fn(Signal) -> Cause + Send + Sync + 'static) -> Self {
        self.signal_cause = SignalCause::new(f);
        self
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), SuperchanError> {
        if self.buffer_size == 0 {
            return Err(SuperchanError::Config(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SuperchanError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds a configuration from `SUPERCHAN_*` environment variables.
    ///
    /// - `SUPERCHAN_BUFFER_SIZE`: channel capacity
    /// - `SUPERCHAN_DEFER_FIRST`: run cleanup before cancelling on signal
    /// - `SUPERCHAN_DEFER_ORDERED`: run hooks sequentially
    /// - `SUPERCHAN_MAX_WAIT_MS`: `wait()` budget
    pub fn from_env() -> Result<Self, SuperchanError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, SuperchanError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SUPERCHAN_BUFFER_SIZE") {
            config.buffer_size = parse_var("SUPERCHAN_BUFFER_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("SUPERCHAN_DEFER_FIRST") {
            config.cancel_before_defer = !parse_bool("SUPERCHAN_DEFER_FIRST", &raw)?;
        }
        if let Some(raw) = lookup("SUPERCHAN_DEFER_ORDERED") {
            if parse_bool("SUPERCHAN_DEFER_ORDERED", &raw)? {
                config.cleanup_mode = CleanupMode::Sequential;
            }
        }
        if let Some(raw) = lookup("SUPERCHAN_MAX_WAIT_MS") {
            config.max_wait = Duration::from_millis(parse_var("SUPERCHAN_MAX_WAIT_MS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, SuperchanError> {
    raw.trim()
        .parse()
        .map_err(|_| SuperchanError::Config(format!("{key}: invalid value {raw:?}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, SuperchanError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(SuperchanError::Config(format!("{key}: invalid bool {raw:?}"))),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SuperchanConfig::default();
        assert_eq!(config.buffer_size, 1000);
        assert!(config.cancel_before_defer);
        assert_eq!(config.cleanup_mode, CleanupMode::FanOut);
        assert_eq!(config.max_wait, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_builder() {
        let config = SuperchanConfig::new()
            .with_buffer_size(4)
            .with_cancel_before_defer(false)
            .with_cleanup_mode(CleanupMode::Sequential)
            .with_max_wait(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(1));

        assert_eq!(config.buffer_size, 4);
        assert!(!config.cancel_before_defer);
        assert_eq!(config.cleanup_mode, CleanupMode::Sequential);
        assert_eq!(config.max_wait, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let config = SuperchanConfig::new().with_buffer_size(0);
        assert!(matches!(config.validate(), Err(SuperchanError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = SuperchanConfig::new().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: SuperchanConfig =
            serde_json::from_str(r#"{"buffer_size": 8, "cleanup_mode": "sequential", "max_wait_ms": 250}"#)
                .unwrap();

        assert_eq!(config.buffer_size, 8);
        assert_eq!(config.cleanup_mode, CleanupMode::Sequential);
        assert_eq!(config.max_wait, Duration::from_millis(250));
        assert!(config.cancel_before_defer);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_serialize_uses_milliseconds() {
        let value = serde_json::to_value(SuperchanConfig::default()).unwrap();
        assert_eq!(value["max_wait_ms"], 5000);
        assert_eq!(value["poll_interval_ms"], 10);
        assert_eq!(value["cleanup_mode"], "fan_out");
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = SuperchanConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, SuperchanConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = SuperchanConfig::from_lookup(lookup_from(&[
            ("SUPERCHAN_BUFFER_SIZE", "16"),
            ("SUPERCHAN_DEFER_FIRST", "true"),
            ("SUPERCHAN_DEFER_ORDERED", "1"),
            ("SUPERCHAN_MAX_WAIT_MS", "750"),
        ]))
        .unwrap();

        assert_eq!(config.buffer_size, 16);
        assert!(!config.cancel_before_defer);
        assert_eq!(config.cleanup_mode, CleanupMode::Sequential);
        assert_eq!(config.max_wait, Duration::from_millis(750));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = SuperchanConfig::from_lookup(lookup_from(&[("SUPERCHAN_BUFFER_SIZE", "lots")]));
        assert!(matches!(result, Err(SuperchanError::Config(_))));

        let result = SuperchanConfig::from_lookup(lookup_from(&[("SUPERCHAN_DEFER_ORDERED", "maybe")]));
        assert!(result.is_err());

        let result = SuperchanConfig::from_lookup(lookup_from(&[("SUPERCHAN_BUFFER_SIZE", "0")]));
        assert!(result.is_err());
    }
}
