//! Pipeline configuration surface and env loading for the binaries.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::augment::AugmentConfig;
use crate::cleaner::CleanerConfig;
use crate::features::{FeatureConfig, RollingWindow};
use crate::merge::{JoinPolicy, MergeConfig};

pub const DEFAULT_HOURS_BACK: u32 = 48;
pub const DEFAULT_OFFLINE_THRESHOLD_MINUTES: u32 = 30;
/// Ten years of hours.
pub const MAX_HOURS_BACK: u32 = 24 * 3_660;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("augmentation multiplier must be > 1, got {0}")]
    InvalidMultiplier(f64),
    #[error("{name} must be > 0")]
    NonPositive { name: &'static str },
    #[error("unknown join policy: {0}")]
    UnknownJoinPolicy(String),
    #[error("unknown rolling window: {0}")]
    UnknownRollingWindow(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

pub(crate) fn require_positive_f64(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name })
    }
}

pub(crate) fn require_non_negative_f64(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            value: value.to_string(),
        })
    }
}

/// Explicit configuration object for one dataset-generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub hours_back: u32,
    pub location: Option<String>,
    pub module: Option<String>,
    pub cleaner: CleanerConfig,
    pub merge: MergeConfig,
    pub features: FeatureConfig,
    pub augment: Option<AugmentConfig>,
    pub offline_threshold_minutes: u32,
    pub output_path: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            hours_back: DEFAULT_HOURS_BACK,
            location: None,
            module: None,
            cleaner: CleanerConfig::default(),
            merge: MergeConfig::default(),
            features: FeatureConfig::default(),
            augment: None,
            offline_threshold_minutes: DEFAULT_OFFLINE_THRESHOLD_MINUTES,
            output_path: PathBuf::from("data/clean_dataset.csv"),
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hours_back == 0 {
            return Err(ConfigError::NonPositive { name: "hours_back" });
        }
        if self.hours_back > MAX_HOURS_BACK {
            return Err(ConfigError::InvalidValue {
                field: "hours_back",
                value: self.hours_back.to_string(),
            });
        }
        if self.offline_threshold_minutes == 0 {
            return Err(ConfigError::NonPositive {
                name: "offline_threshold_minutes",
            });
        }
        self.cleaner.validate()?;
        self.merge.validate()?;
        self.features.validate()?;
        if let Some(augment) = &self.augment {
            augment.validate()?;
        }
        Ok(())
    }
}

/// Reads `VOLTGUARD_*` overrides on top of the defaults.
pub fn dataset_config_from_env() -> Result<DatasetConfig, ConfigError> {
    let mut cfg = DatasetConfig::default();

    if let Some(raw) = env_value("VOLTGUARD_HOURS_BACK") {
        cfg.hours_back = parse_number("VOLTGUARD_HOURS_BACK", &raw)?;
    }
    if let Some(raw) = env_value("VOLTGUARD_DAYS_BACK") {
        let days: u32 = parse_number("VOLTGUARD_DAYS_BACK", &raw)?;
        cfg.hours_back = days
            .checked_mul(24)
            .ok_or(ConfigError::InvalidValue {
                field: "VOLTGUARD_DAYS_BACK",
                value: raw,
            })?;
    }
    cfg.location = env_value("VOLTGUARD_LOCATION");
    cfg.module = env_value("VOLTGUARD_MODULE");

    if let Some(raw) = env_value("VOLTGUARD_MERGE_WINDOW_MINUTES") {
        cfg.merge.window_minutes = parse_number("VOLTGUARD_MERGE_WINDOW_MINUTES", &raw)?;
    }
    if let Some(raw) = env_value("VOLTGUARD_JOIN_POLICY") {
        cfg.merge.policy = raw.parse::<JoinPolicy>()?;
    }
    if let Some(raw) = env_value("VOLTGUARD_IQR_MULTIPLIER") {
        cfg.cleaner.iqr_multiplier = parse_number("VOLTGUARD_IQR_MULTIPLIER", &raw)?;
    }
    if let Some(raw) = env_value("VOLTGUARD_ROLLING_WINDOW") {
        cfg.features.rolling_window = raw.parse::<RollingWindow>()?;
    }
    if let Some(raw) = env_value("VOLTGUARD_OFFLINE_THRESHOLD_MINUTES") {
        cfg.offline_threshold_minutes =
            parse_number("VOLTGUARD_OFFLINE_THRESHOLD_MINUTES", &raw)?;
    }
    if let Some(raw) = env_value("VOLTGUARD_OUTPUT") {
        cfg.output_path = PathBuf::from(raw);
    }

    if let Some(raw) = env_value("VOLTGUARD_AUGMENT_MULTIPLIER") {
        let mut augment = AugmentConfig {
            multiplier: parse_number("VOLTGUARD_AUGMENT_MULTIPLIER", &raw)?,
            ..AugmentConfig::default()
        };
        apply_augment_env(&mut augment)?;
        cfg.augment = Some(augment);
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Augmentation overrides shared by both binaries.
pub fn augment_config_from_env() -> Result<AugmentConfig, ConfigError> {
    let mut augment = AugmentConfig::default();
    if let Some(raw) = env_value("VOLTGUARD_AUGMENT_MULTIPLIER") {
        augment.multiplier = parse_number("VOLTGUARD_AUGMENT_MULTIPLIER", &raw)?;
    }
    apply_augment_env(&mut augment)?;
    augment.validate()?;
    Ok(augment)
}

fn apply_augment_env(augment: &mut AugmentConfig) -> Result<(), ConfigError> {
    if let Some(raw) = env_value("VOLTGUARD_AUGMENT_BLOCK_SIZE") {
        augment.block_size = parse_number("VOLTGUARD_AUGMENT_BLOCK_SIZE", &raw)?;
    }
    if let Some(raw) = env_value("VOLTGUARD_AUGMENT_SEED") {
        augment.seed = parse_number("VOLTGUARD_AUGMENT_SEED", &raw)?;
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            field,
            value: raw.to_string(),
        })
}
