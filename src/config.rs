//! Service configuration.
//!
//! Loaded from a YAML file, then overridden by environment variables.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::{path::Path, time::Duration};

use backon::ExponentialBuilder;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub volume: VolumeSettings,
    pub upstream: UpstreamSettings,
    pub ledger: LedgerSettings,
}

/// Weekly close settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VolumeSettings {
    /// Percentage paid when the membership plan cannot be resolved
    pub default_commission_percentage: Decimal,
    /// Offset of the local calendar used to cut weeks
    pub utc_offset_minutes: i32,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            default_commission_percentage: dec!(10),
            utc_offset_minutes: 0,
        }
    }
}

/// Calls to the directory and membership services.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamSettings {
    pub timeout_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerSettings {
    pub retry: RetrySettings,
}

/// Backoff for commits that lost an optimistic concurrency race.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_times: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 1000,
            max_times: 5,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_times)
            .with_jitter()
    }
}

impl Settings {
    /// Load settings from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (`POINTS_CONFIG`, defaults to `points.yaml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("POINTS_CONFIG").unwrap_or_else(|_| "points.yaml".to_string());

        let mut settings = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = var("POINTS_DEFAULT_COMMISSION_PERCENTAGE") {
            self.volume.default_commission_percentage = parse_env(
                "POINTS_DEFAULT_COMMISSION_PERCENTAGE",
                &value,
            )?;
        }
        if let Some(value) = var("POINTS_UPSTREAM_TIMEOUT_MS") {
            self.upstream.timeout_ms = parse_env("POINTS_UPSTREAM_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("POINTS_UTC_OFFSET_MINUTES") {
            self.volume.utc_offset_minutes = parse_env("POINTS_UTC_OFFSET_MINUTES", &value)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let pct = self.volume.default_commission_percentage;
        if pct < Decimal::ZERO || pct > dec!(100) {
            return Err(ConfigError::InvalidValue(
                "volume.default_commission_percentage".to_string(),
                format!("{pct} is not between 0 and 100"),
            ));
        }
        // Offsets must stay within a day
        if self.volume.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::InvalidValue(
                "volume.utc_offset_minutes".to_string(),
                format!("{} is out of range", self.volume.utc_offset_minutes),
            ));
        }
        if self.upstream.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "upstream.timeout_ms".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
