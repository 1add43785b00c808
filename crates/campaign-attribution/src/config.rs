// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::attribution::PropertyLookupConfig;
use crate::backoff::BackoffConfig;
use crate::constants::{MAX_CONFIGURED_DURATION, MAX_LOOKBACK_DAYS};
use crate::errors::ConfigError;
use crate::volume::VolumeConfig;

const ENV_PREFIX: &str = "ATTRIBUTION_";

/// Configuration of the collector and everything it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionConfig {
    /// Days covered by a full fetch, ending today
    pub lookback_days: u32,
    pub full_fetch_interval: Duration,
    /// Incremental "today" refresh of tracking reports
    pub tracking_refresh_interval: Duration,
    /// Refresh of sending-platform campaign metadata
    pub sending_refresh_interval: Duration,
    pub attribution_refresh_interval: Duration,
    /// Minimum gap between consecutive upstream calls during a full fetch
    pub call_spacing: Duration,
    pub request_timeout: Duration,
    pub report_ttl: Duration,
    pub exact_volume_ttl: Duration,
    pub estimated_volume_ttl: Duration,
    pub export_poll_interval: Duration,
    pub export_max_wait: Duration,
    /// How long a window whose export failed waits before another export is launched
    pub export_retry_cooldown: Duration,
    pub min_segment_partners: usize,
    pub max_property_lookups: usize,
    pub property_lookup_spacing: Duration,
    /// Directory for persisted exact volumes; nothing is persisted when unset
    pub blob_dir: Option<PathBuf>,
    /// JSON lookup tables replacing the built-in ones
    pub tables_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            full_fetch_interval: Duration::from_secs(6 * 60 * 60),
            tracking_refresh_interval: Duration::from_secs(15 * 60),
            sending_refresh_interval: Duration::from_secs(30 * 60),
            attribution_refresh_interval: Duration::from_secs(10 * 60),
            call_spacing: Duration::from_millis(1_000),
            request_timeout: Duration::from_secs(30),
            report_ttl: Duration::from_secs(15 * 60),
            exact_volume_ttl: Duration::from_secs(24 * 60 * 60),
            estimated_volume_ttl: Duration::from_secs(30 * 60),
            export_poll_interval: Duration::from_secs(30),
            export_max_wait: Duration::from_secs(45 * 60),
            export_retry_cooldown: Duration::from_secs(60 * 60),
            min_segment_partners: 2,
            max_property_lookups: 25,
            property_lookup_spacing: Duration::from_millis(250),
            blob_dir: None,
            tables_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl AttributionConfig {
    /// Create configuration from `ATTRIBUTION_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`AttributionConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty())
        };
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var::<u64>(name, var(name))?.map_or(default, Duration::from_secs))
        };
        let millis = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var::<u64>(name, var(name))?.map_or(default, Duration::from_millis))
        };

        let config = Self {
            lookback_days: parse_var("LOOKBACK_DAYS", var("LOOKBACK_DAYS"))?
                .unwrap_or(defaults.lookback_days),
            full_fetch_interval: secs("FULL_FETCH_INTERVAL_SECS", defaults.full_fetch_interval)?,
            tracking_refresh_interval: secs(
                "TRACKING_REFRESH_SECS",
                defaults.tracking_refresh_interval,
            )?,
            sending_refresh_interval: secs(
                "SENDING_REFRESH_SECS",
                defaults.sending_refresh_interval,
            )?,
            attribution_refresh_interval: secs(
                "ATTRIBUTION_REFRESH_SECS",
                defaults.attribution_refresh_interval,
            )?,
            call_spacing: millis("CALL_SPACING_MS", defaults.call_spacing)?,
            request_timeout: secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            report_ttl: secs("REPORT_TTL_SECS", defaults.report_ttl)?,
            exact_volume_ttl: secs("EXACT_VOLUME_TTL_SECS", defaults.exact_volume_ttl)?,
            estimated_volume_ttl: secs(
                "ESTIMATED_VOLUME_TTL_SECS",
                defaults.estimated_volume_ttl,
            )?,
            export_poll_interval: secs("EXPORT_POLL_SECS", defaults.export_poll_interval)?,
            export_max_wait: secs("EXPORT_MAX_WAIT_SECS", defaults.export_max_wait)?,
            export_retry_cooldown: secs(
                "EXPORT_RETRY_COOLDOWN_SECS",
                defaults.export_retry_cooldown,
            )?,
            min_segment_partners: parse_var("MIN_SEGMENT_PARTNERS", var("MIN_SEGMENT_PARTNERS"))?
                .unwrap_or(defaults.min_segment_partners),
            max_property_lookups: parse_var("MAX_PROPERTY_LOOKUPS", var("MAX_PROPERTY_LOOKUPS"))?
                .unwrap_or(defaults.max_property_lookups),
            property_lookup_spacing: millis(
                "PROPERTY_LOOKUP_SPACING_MS",
                defaults.property_lookup_spacing,
            )?,
            blob_dir: var("BLOB_DIR").map(PathBuf::from),
            tables_path: var("TABLES_PATH").map(PathBuf::from),
            log_level: var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_days == 0 {
            return Err(ConfigError::Invalid(
                "lookback must cover at least one day".to_string(),
            ));
        }
        if self.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(ConfigError::Invalid(format!(
                "lookback of {} days exceeds the maximum of {MAX_LOOKBACK_DAYS}",
                self.lookback_days
            )));
        }

        let intervals = [
            ("full fetch interval", self.full_fetch_interval),
            ("tracking refresh interval", self.tracking_refresh_interval),
            ("sending refresh interval", self.sending_refresh_interval),
            ("attribution refresh interval", self.attribution_refresh_interval),
            ("request timeout", self.request_timeout),
            ("export poll interval", self.export_poll_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }

        let bounded = intervals.into_iter().chain([
            ("call spacing", self.call_spacing),
            ("report ttl", self.report_ttl),
            ("exact volume ttl", self.exact_volume_ttl),
            ("estimated volume ttl", self.estimated_volume_ttl),
            ("export max wait", self.export_max_wait),
            ("export retry cooldown", self.export_retry_cooldown),
            ("property lookup spacing", self.property_lookup_spacing),
        ]);
        for (name, value) in bounded {
            if value > MAX_CONFIGURED_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{name} of {}s exceeds the maximum of {}s",
                    value.as_secs(),
                    MAX_CONFIGURED_DURATION.as_secs()
                )));
            }
        }

        if self.export_max_wait < self.export_poll_interval {
            return Err(ConfigError::Invalid(
                "export max wait must be at least one poll interval".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn volume(&self) -> VolumeConfig {
        VolumeConfig {
            exact_ttl: self.exact_volume_ttl,
            estimated_ttl: self.estimated_volume_ttl,
            request_timeout: self.request_timeout,
            export_poll_interval: self.export_poll_interval,
            export_max_wait: self.export_max_wait,
            export_retry_cooldown: self.export_retry_cooldown,
            persisted_max_age: self.exact_volume_ttl,
            min_segment_partners: self.min_segment_partners,
            rate_limit_backoff: BackoffConfig::export_rate_limit(),
        }
    }

    pub fn property_lookup(&self) -> PropertyLookupConfig {
        PropertyLookupConfig {
            max_batch: self.max_property_lookups,
            spacing: self.property_lookup_spacing,
            timeout: self.request_timeout,
            ..Default::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|val| {
        val.parse::<T>().map_err(|_| {
            ConfigError::Invalid(format!("{ENV_PREFIX}{name}: '{val}' is not a valid number"))
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AttributionConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = AttributionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AttributionConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = AttributionConfig::from_lookup(lookup(&[
            ("ATTRIBUTION_LOOKBACK_DAYS", "7"),
            ("ATTRIBUTION_CALL_SPACING_MS", "50"),
            ("ATTRIBUTION_EXPORT_POLL_SECS", "5"),
            ("ATTRIBUTION_BLOB_DIR", "/var/lib/attribution"),
            ("ATTRIBUTION_LOG_LEVEL", "DEBUG"),
            ("ATTRIBUTION_TABLES_PATH", "  "),
        ]))
        .unwrap();
        assert_eq!(config.lookback_days, 7);
        assert_eq!(config.call_spacing, Duration::from_millis(50));
        assert_eq!(config.volume().export_poll_interval, Duration::from_secs(5));
        assert_eq!(config.blob_dir, Some(PathBuf::from("/var/lib/attribution")));
        assert_eq!(config.tables_path, None);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = AttributionConfig::from_lookup(lookup(&[("ATTRIBUTION_LOOKBACK_DAYS", "a week")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: ATTRIBUTION_LOOKBACK_DAYS: 'a week' is not a valid number"
        );
    }

    #[test]
    fn test_validate_zero_lookback() {
        let config = AttributionConfig {
            lookback_days: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = AttributionConfig {
            tracking_refresh_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_lookback() {
        let err = AttributionConfig::from_lookup(lookup(&[(
            "ATTRIBUTION_LOOKBACK_DAYS",
            "4000000000",
        )]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: lookback of 4000000000 days exceeds the maximum of 366"
        );
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let err = AttributionConfig::from_lookup(lookup(&[(
            "ATTRIBUTION_FULL_FETCH_INTERVAL_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("full fetch interval"), "{err}");

        let config = AttributionConfig {
            exact_volume_ttl: MAX_CONFIGURED_DURATION + Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AttributionConfig {
            export_retry_cooldown: MAX_CONFIGURED_DURATION,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = AttributionConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
