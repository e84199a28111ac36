// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::{AggregatorConfig, DisabledSubtypes, PercentThreshold};
use crate::cloud::cache::CacheOptions;
use crate::cloud::handler::CloudOptions;
use crate::constants;
use crate::errors::ConfigError;
use crate::metric::Tags;
use crate::util::parse_metric_namespace;

/// Backends the server knows how to build from configuration.
pub const KNOWN_BACKENDS: [&str; 2] = ["console", "null"];

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime configuration of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// UDP addresses to listen on
    pub listen_addrs: Vec<String>,
    /// Readers per listen address
    pub receivers: usize,
    /// Give each reader its own socket bound with SO_REUSEPORT
    pub reuse_port: bool,
    pub parsers: usize,
    /// Aggregation workers
    pub workers: usize,
    pub receive_batch_size: usize,
    pub max_datagram_size: usize,
    pub flush_interval: Duration,
    /// Zero keeps idle accumulators forever
    pub expiry_interval: Duration,
    pub percent_thresholds: Vec<f64>,
    pub disabled_subtypes: Vec<String>,
    /// Appended to every metric and event
    pub default_tags: Tags,
    /// Attached to the engine's own metrics
    pub internal_tags: Tags,
    pub namespace: Option<String>,
    pub cache_ttl: Duration,
    pub cache_negative_ttl: Duration,
    pub cache_refresh_period: Duration,
    pub cache_evict_after_idle: Duration,
    /// Cloud provider calls per second, 0 for unlimited
    pub cloud_rate_limit: f64,
    pub cloud_max_concurrent: usize,
    /// Bad lines logged per minute, 0 to never log them
    pub bad_lines_per_minute: f64,
    pub backends: Vec<String>,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![constants::DEFAULT_LISTEN_ADDR.to_string()],
            receivers: constants::DEFAULT_RECEIVERS,
            reuse_port: false,
            parsers: constants::DEFAULT_PARSERS,
            workers: constants::DEFAULT_WORKERS,
            receive_batch_size: constants::DEFAULT_RECEIVE_BATCH_SIZE,
            max_datagram_size: constants::DEFAULT_MAX_DATAGRAM_SIZE,
            flush_interval: constants::DEFAULT_FLUSH_INTERVAL,
            expiry_interval: constants::DEFAULT_EXPIRY_INTERVAL,
            percent_thresholds: constants::DEFAULT_PERCENT_THRESHOLDS.to_vec(),
            disabled_subtypes: Vec::new(),
            default_tags: Tags::new(),
            internal_tags: Tags::new(),
            namespace: None,
            cache_ttl: constants::DEFAULT_CACHE_TTL,
            cache_negative_ttl: constants::DEFAULT_CACHE_NEGATIVE_TTL,
            cache_refresh_period: constants::DEFAULT_CACHE_REFRESH_PERIOD,
            cache_evict_after_idle: constants::DEFAULT_CACHE_EVICT_AFTER_IDLE,
            cloud_rate_limit: constants::DEFAULT_CLOUD_RATE_LIMIT,
            cloud_max_concurrent: constants::DEFAULT_CLOUD_MAX_CONCURRENT,
            bad_lines_per_minute: constants::DEFAULT_BAD_LINES_PER_MINUTE,
            backends: vec!["console".to_string()],
            shutdown_grace: constants::DEFAULT_SHUTDOWN_GRACE,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from `STATSD_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup. Values that do not parse
    /// fall back to their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |key: &str, default: usize| parse_or(lookup(key), default);
        let float = |key: &str, default: f64| parse_or(lookup(key), default);
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(default, Duration::from_secs)
        };
        let list = |key: &str| lookup(key).map(|v| split_list(&v));

        let config = Self {
            listen_addrs: list("STATSD_LISTEN_ADDR").unwrap_or(defaults.listen_addrs),
            receivers: number("STATSD_RECEIVERS", defaults.receivers),
            reuse_port: lookup("STATSD_REUSE_PORT")
                .map_or(defaults.reuse_port, |v| v.trim().eq_ignore_ascii_case("true")),
            parsers: number("STATSD_PARSERS", defaults.parsers),
            workers: number("STATSD_WORKERS", defaults.workers),
            receive_batch_size: number("STATSD_RECEIVE_BATCH_SIZE", defaults.receive_batch_size),
            max_datagram_size: number("STATSD_MAX_DATAGRAM_SIZE", defaults.max_datagram_size),
            flush_interval: secs("STATSD_FLUSH_INTERVAL_SECS", defaults.flush_interval),
            expiry_interval: secs("STATSD_EXPIRY_INTERVAL_SECS", defaults.expiry_interval),
            percent_thresholds: list("STATSD_PERCENT_THRESHOLDS")
                .and_then(|values| values.iter().map(|v| v.parse::<f64>().ok()).collect())
                .unwrap_or(defaults.percent_thresholds),
            disabled_subtypes: list("STATSD_DISABLED_SUBTYPES").unwrap_or_default(),
            default_tags: lookup("STATSD_DEFAULT_TAGS")
                .map_or(defaults.default_tags, |v| Tags::parse(&v)),
            internal_tags: lookup("STATSD_INTERNAL_TAGS")
                .map_or(defaults.internal_tags, |v| Tags::parse(&v)),
            namespace: lookup("STATSD_NAMESPACE").and_then(|v| parse_metric_namespace(&v)),
            cache_ttl: secs("STATSD_CACHE_TTL_SECS", defaults.cache_ttl),
            cache_negative_ttl: secs("STATSD_CACHE_NEGATIVE_TTL_SECS", defaults.cache_negative_ttl),
            cache_refresh_period: secs(
                "STATSD_CACHE_REFRESH_PERIOD_SECS",
                defaults.cache_refresh_period,
            ),
            cache_evict_after_idle: secs(
                "STATSD_CACHE_EVICT_AFTER_IDLE_SECS",
                defaults.cache_evict_after_idle,
            ),
            cloud_rate_limit: float("STATSD_CLOUD_RATE_LIMIT", defaults.cloud_rate_limit),
            cloud_max_concurrent: number(
                "STATSD_CLOUD_MAX_CONCURRENT",
                defaults.cloud_max_concurrent,
            ),
            bad_lines_per_minute: float(
                "STATSD_BAD_LINES_PER_MINUTE",
                defaults.bad_lines_per_minute,
            ),
            backends: list("STATSD_BACKENDS").unwrap_or(defaults.backends),
            shutdown_grace: secs("STATSD_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            log_level: lookup("STATSD_LOG_LEVEL")
                .map_or(defaults.log_level, |v| v.trim().to_lowercase()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.listen_addrs.is_empty() {
            return invalid("STATSD_LISTEN_ADDR cannot be empty".to_string());
        }
        for (name, value) in [
            ("STATSD_RECEIVERS", self.receivers),
            ("STATSD_PARSERS", self.parsers),
            ("STATSD_WORKERS", self.workers),
            ("STATSD_RECEIVE_BATCH_SIZE", self.receive_batch_size),
            ("STATSD_MAX_DATAGRAM_SIZE", self.max_datagram_size),
            ("STATSD_CLOUD_MAX_CONCURRENT", self.cloud_max_concurrent),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than 0"));
            }
        }
        if self.flush_interval.is_zero() {
            return invalid("STATSD_FLUSH_INTERVAL_SECS must be greater than 0".to_string());
        }
        if self.cache_refresh_period.is_zero() {
            return invalid("STATSD_CACHE_REFRESH_PERIOD_SECS must be greater than 0".to_string());
        }
        if self.cache_ttl < self.cache_negative_ttl {
            return invalid(format!(
                "STATSD_CACHE_TTL_SECS ({}s) must not be shorter than STATSD_CACHE_NEGATIVE_TTL_SECS ({}s)",
                self.cache_ttl.as_secs(),
                self.cache_negative_ttl.as_secs()
            ));
        }
        if let Some(threshold) = self
            .percent_thresholds
            .iter()
            .find(|p| !p.is_finite() || **p == 0.0 || p.abs() > 100.0)
        {
            return invalid(format!(
                "Invalid percent threshold {threshold}. Must be non-zero and within [-100, 100]"
            ));
        }
        if !self.cloud_rate_limit.is_finite() || self.cloud_rate_limit < 0.0 {
            return invalid("STATSD_CLOUD_RATE_LIMIT must be a non-negative number".to_string());
        }
        if !self.bad_lines_per_minute.is_finite() || self.bad_lines_per_minute < 0.0 {
            return invalid("STATSD_BAD_LINES_PER_MINUTE must be a non-negative number".to_string());
        }

        let mut subtypes = DisabledSubtypes::default();
        if let Some(unknown) = self.disabled_subtypes.iter().find(|s| !subtypes.disable(s)) {
            return invalid(format!(
                "Unknown percentile subtype '{unknown}'. Must be one of: count, mean, sum, sum_squares, upper, lower"
            ));
        }
        if let Some(unknown) = self
            .backends
            .iter()
            .find(|b| !KNOWN_BACKENDS.contains(&b.as_str()))
        {
            return invalid(format!(
                "Unknown backend '{unknown}'. Must be one of: {}",
                KNOWN_BACKENDS.join(", ")
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn aggregator_config(&self) -> AggregatorConfig {
        let mut disabled_subtypes = DisabledSubtypes::default();
        for subtype in &self.disabled_subtypes {
            disabled_subtypes.disable(subtype);
        }
        AggregatorConfig {
            percent_thresholds: self
                .percent_thresholds
                .iter()
                .copied()
                .map(PercentThreshold::new)
                .collect(),
            disabled_subtypes,
            expiry_interval: self.expiry_interval,
        }
    }

    #[must_use]
    pub fn cloud_options(&self) -> CloudOptions {
        CloudOptions {
            cache: CacheOptions {
                ttl: self.cache_ttl,
                negative_ttl: self.cache_negative_ttl,
                refresh_period: self.cache_refresh_period,
                evict_after_idle: self.cache_evict_after_idle,
            },
            rate_limit: self.cloud_rate_limit,
            max_concurrent: self.cloud_max_concurrent,
            batch_window: constants::LOOKUP_BATCH_WINDOW,
            queue_size: constants::CACHE_QUEUE_SIZE,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = from_pairs(&[
            ("STATSD_LISTEN_ADDR", "127.0.0.1:8125, [::1]:8125"),
            ("STATSD_WORKERS", "8"),
            ("STATSD_REUSE_PORT", "TRUE"),
            ("STATSD_FLUSH_INTERVAL_SECS", "30"),
            ("STATSD_PERCENT_THRESHOLDS", "90,99.9,-10"),
            ("STATSD_DISABLED_SUBTYPES", "sum_squares"),
            ("STATSD_DEFAULT_TAGS", "env:prod,,team:core"),
            ("STATSD_NAMESPACE", "app"),
            ("STATSD_BACKENDS", "null"),
            ("STATSD_LOG_LEVEL", "DEBUG"),
        ])
        .unwrap();

        assert_eq!(config.listen_addrs, vec!["127.0.0.1:8125", "[::1]:8125"]);
        assert_eq!(config.workers, 8);
        assert!(config.reuse_port);
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.percent_thresholds, vec![90.0, 99.9, -10.0]);
        assert_eq!(config.default_tags.len(), 2);
        assert_eq!(config.namespace.as_deref(), Some("app"));
        assert_eq!(config.backends, vec!["null"]);
        assert_eq!(config.log_level, "debug");

        let aggregator = config.aggregator_config();
        assert!(aggregator.disabled_subtypes.sum_squares);
        assert_eq!(aggregator.percent_thresholds[1].suffix(), "99_9");
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        let config = from_pairs(&[
            ("STATSD_WORKERS", "many"),
            ("STATSD_PERCENT_THRESHOLDS", "90,x"),
            ("STATSD_CACHE_TTL_SECS", "-1"),
        ])
        .unwrap();
        assert_eq!(config.workers, constants::DEFAULT_WORKERS);
        assert_eq!(config.percent_thresholds, vec![90.0]);
        assert_eq!(config.cache_ttl, constants::DEFAULT_CACHE_TTL);
    }

    #[test]
    fn test_invalid_namespace_is_ignored() {
        let config = from_pairs(&[("STATSD_NAMESPACE", "1bad")]).unwrap();
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_validate_rejects_invalid_values() {
        let cases = [
            ("STATSD_WORKERS", "0"),
            ("STATSD_FLUSH_INTERVAL_SECS", "0"),
            ("STATSD_PERCENT_THRESHOLDS", "150"),
            ("STATSD_PERCENT_THRESHOLDS", "0"),
            ("STATSD_DISABLED_SUBTYPES", "median"),
            ("STATSD_BACKENDS", "graphite"),
            ("STATSD_LOG_LEVEL", "verbose"),
            ("STATSD_CACHE_NEGATIVE_TTL_SECS", "100000"),
        ];
        for (key, value) in cases {
            let result = from_pairs(&[(key, value)]);
            assert!(
                matches!(result, Err(ConfigError::Invalid(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_expiry_is_allowed() {
        let config = from_pairs(&[("STATSD_EXPIRY_INTERVAL_SECS", "0")]).unwrap();
        assert!(config.expiry_interval.is_zero());
    }
}
