//! Merged rows to model features, plus the schema contract handed to the
//! predictor.
//!
//! Every engineered column is recomputed from the base columns on each call,
//! so running the transform over its own output yields the same table.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::cleaner::{mean, sample_std};
use crate::config::ConfigError;
use crate::readings::{MergedRow, MERGED_COLUMNS};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const ADAPTIVE_WINDOW_CAP: usize = 10;
pub const FIXED_WINDOW_SIZE: usize = 12;

/// Base and audit columns that never feed the model.
pub const EXCLUDED_COLUMNS: [&str; 15] = [
    "received_at",
    "occupancy_received_at",
    "timestamp",
    "module",
    "location",
    "sensor",
    "source",
    "type",
    "current_ma",
    "adc_samples",
    "vref",
    "wifi_rssi",
    "rssi",
    "uptime",
    "heap",
];

/// Engineered columns computed within one location partition, in output order.
pub const LOCATION_FEATURE_COLUMNS: [&str; 24] = [
    "month",
    "day_of_month",
    "hour_sin",
    "hour_cos",
    "day_sin",
    "day_cos",
    "current_a_rolling_mean",
    "current_a_rolling_std",
    "power_w_rolling_mean",
    "power_w_rolling_std",
    "current_a_lag_1",
    "current_a_lag_2",
    "power_w_lag_1",
    "power_w_lag_2",
    "power_w_change",
    "occupancy_duration",
    "occupancy_rolling_mean",
    "daily_power_mean",
    "daily_power_max",
    "daily_power_min",
    "daily_power_std",
    "daily_current_mean",
    "daily_current_max",
    "daily_occupancy_rate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollingWindow {
    /// `min(max, n / 2)` rows, at least one, where `n` is the location's row count.
    Adaptive { max: usize },
    Fixed { size: usize },
}

impl RollingWindow {
    pub fn size_for(self, rows: usize) -> usize {
        match self {
            Self::Adaptive { max } => max.min(rows / 2).max(1),
            Self::Fixed { size } => size.max(1),
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Adaptive { max } => format!("adaptive:{max}"),
            Self::Fixed { size } => format!("fixed:{size}"),
        }
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::Adaptive {
            max: ADAPTIVE_WINDOW_CAP,
        }
    }
}

/// Accepts `adaptive`, `fixed` or a positive row count.
impl FromStr for RollingWindow {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "adaptive" => Ok(Self::default()),
            "fixed" => Ok(Self::Fixed {
                size: FIXED_WINDOW_SIZE,
            }),
            other => match other.parse::<usize>() {
                Ok(0) => Err(ConfigError::NonPositive {
                    name: "features.rolling_window",
                }),
                Ok(size) => Ok(Self::Fixed { size }),
                Err(_) => Err(ConfigError::UnknownRollingWindow(raw.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub rolling_window: RollingWindow,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            rolling_window: RollingWindow::default(),
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = match self.rolling_window {
            RollingWindow::Adaptive { max } => max,
            RollingWindow::Fixed { size } => size,
        };
        if size == 0 {
            return Err(ConfigError::NonPositive {
                name: "features.rolling_window",
            });
        }
        if self.schema_version == 0 {
            return Err(ConfigError::NonPositive {
                name: "features.schema_version",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturedRow {
    pub base: MergedRow,
    /// Aligned with `FeatureTable::engineered_columns`.
    pub engineered: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub engineered_columns: Vec<String>,
    pub rows: Vec<FeaturedRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of a base or engineered column for one row.
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let featured = self.rows.get(row)?;
        match self.engineered_columns.iter().position(|name| name == column) {
            Some(idx) => featured.engineered.get(idx).copied().flatten(),
            None => featured.base.numeric_value(column),
        }
    }

    /// Model input for one row, ordered like `schema.columns`.
    pub fn feature_vector(&self, row: usize) -> Vec<Option<f64>> {
        self.schema
            .columns
            .iter()
            .map(|column| self.value(row, &column.name))
            .collect()
    }
}

/// Applies the exclusion list to a header, keeping order.
pub fn feature_column_names<'a>(columns: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    columns
        .into_iter()
        .filter(|name| !EXCLUDED_COLUMNS.contains(name))
        .map(str::to_string)
        .collect()
}

pub fn build_feature_schema(engineered_columns: &[String], cfg: &FeatureConfig) -> FeatureSchema {
    let columns: Vec<FeatureColumn> = feature_column_names(
        MERGED_COLUMNS
            .iter()
            .copied()
            .chain(engineered_columns.iter().map(String::as_str)),
    )
    .into_iter()
    .map(|name| FeatureColumn {
        name,
        dtype: FeatureDType::F64,
    })
    .collect();

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        rolling_window = %cfg.rolling_window.describe(),
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn create_all_features(
    rows: &[MergedRow],
    cfg: &FeatureConfig,
) -> Result<FeatureTable, ConfigError> {
    cfg.validate()?;

    let mut ordered: Vec<MergedRow> = rows.to_vec();
    ordered.sort_by(|a, b| {
        (&a.location, a.received_at, &a.module).cmp(&(&b.location, b.received_at, &b.module))
    });

    let locations: BTreeSet<&str> = ordered.iter().map(|row| row.location.as_str()).collect();
    let modules: BTreeSet<&str> = ordered.iter().map(|row| row.module.as_str()).collect();

    let mut engineered_columns: Vec<String> = LOCATION_FEATURE_COLUMNS
        .iter()
        .map(|name| name.to_string())
        .collect();
    engineered_columns.extend(locations.iter().map(|location| format!("location_{location}")));
    engineered_columns.extend(modules.iter().map(|module| format!("module_{module}")));

    let partitions = location_partitions(&ordered);
    let window = cfg.rolling_window;
    let local: Vec<Vec<Vec<Option<f64>>>> = partitions
        .par_iter()
        .map(|partition| location_features(partition, window))
        .collect();

    let featured: Vec<FeaturedRow> = ordered
        .iter()
        .zip(local.into_iter().flatten())
        .map(|(row, mut values)| {
            values.extend(
                locations
                    .iter()
                    .map(|location| Some(indicator(*location == row.location))),
            );
            values.extend(modules.iter().map(|module| Some(indicator(*module == row.module))));
            FeaturedRow {
                base: row.clone(),
                engineered: values,
            }
        })
        .collect();

    let schema = build_feature_schema(&engineered_columns, cfg);

    info!(
        component = "features",
        event = "features.build.finish",
        input_rows = rows.len(),
        output_rows = featured.len(),
        locations = locations.len(),
        modules = modules.len(),
        feature_columns = schema.columns.len()
    );

    Ok(FeatureTable {
        schema,
        engineered_columns,
        rows: featured,
    })
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Contiguous runs of one location in rows already sorted by location.
fn location_partitions(rows: &[MergedRow]) -> Vec<&[MergedRow]> {
    let mut partitions = Vec::new();
    let mut start = 0;
    for end in 1..=rows.len() {
        if end == rows.len() || rows[end].location != rows[start].location {
            partitions.push(&rows[start..end]);
            start = end;
        }
    }
    partitions
}

/// Rows of one location in time order; returns one value vector per row,
/// aligned with `LOCATION_FEATURE_COLUMNS`.
fn location_features(rows: &[MergedRow], window: RollingWindow) -> Vec<Vec<Option<f64>>> {
    let n = rows.len();
    let w = window.size_for(n);

    let current: Vec<Option<f64>> = rows.iter().map(|row| row.current_a).collect();
    let power: Vec<Option<f64>> = rows.iter().map(|row| row.power_w).collect();
    let occupied: Vec<Option<f64>> = rows
        .iter()
        .map(|row| row.occupied.map(indicator))
        .collect();

    let (current_mean, current_std) = rolling_stats(&current, w);
    let (power_mean, power_std) = rolling_stats(&power, w);
    let (occupancy_mean, _) = rolling_stats(&occupied, w);

    let columns: Vec<Vec<Option<f64>>> = vec![
        fill_gaps(current_mean),
        fill_gaps(current_std),
        fill_gaps(power_mean),
        fill_gaps(power_std),
        fill_gaps(lag(&current, 1)),
        fill_gaps(lag(&current, 2)),
        fill_gaps(lag(&power, 1)),
        fill_gaps(lag(&power, 2)),
        first_difference(&power),
        occupancy_streaks(rows),
        fill_gaps(occupancy_mean),
    ];
    let daily = daily_aggregates(rows);

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let ts = row.received_at;
            let hour = f64::from(row.calendar.hour);
            let day = f64::from(row.calendar.day_of_week);
            let mut values = vec![
                Some(f64::from(ts.month())),
                Some(f64::from(ts.day())),
                Some((2.0 * PI * hour / 24.0).sin()),
                Some((2.0 * PI * hour / 24.0).cos()),
                Some((2.0 * PI * day / 7.0).sin()),
                Some((2.0 * PI * day / 7.0).cos()),
            ];
            values.extend(columns.iter().map(|column| column[i]));
            values.extend(daily[i].iter().copied());
            values
        })
        .collect()
}

/// Trailing-window mean and sample std over the non-null values in each
/// window. A window holding a single value has std 0.
fn rolling_stats(values: &[Option<f64>], window: usize) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut means = Vec::with_capacity(values.len());
    let mut stds = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let start = (i + 1).saturating_sub(window);
        let present: Vec<f64> = values[start..=i].iter().filter_map(|v| *v).collect();
        means.push(mean(&present));
        stds.push(match present.len() {
            0 => None,
            1 => Some(0.0),
            _ => sample_std(&present),
        });
    }
    (means, stds)
}

fn lag(values: &[Option<f64>], k: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| i.checked_sub(k).and_then(|j| values[j]))
        .collect()
}

/// Back-fill, then forward-fill, then zero.
fn fill_gaps(mut values: Vec<Option<f64>>) -> Vec<Option<f64>> {
    let mut next = None;
    for value in values.iter_mut().rev() {
        match value {
            Some(v) => next = Some(*v),
            None => *value = next,
        }
    }
    let mut previous = None;
    for value in values.iter_mut() {
        match value {
            Some(v) => previous = Some(*v),
            None => *value = previous,
        }
    }
    values.into_iter().map(|v| Some(v.unwrap_or(0.0))).collect()
}

fn first_difference(values: &[Option<f64>]) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            let previous = i.checked_sub(1).and_then(|j| values[j]);
            match (values[i], previous) {
                (Some(current), Some(previous)) => Some(current - previous),
                _ => Some(0.0),
            }
        })
        .collect()
}

/// Length of the run of consecutive rows sharing the current occupied state.
/// Unknown occupancy counts as unoccupied.
fn occupancy_streaks(rows: &[MergedRow]) -> Vec<Option<f64>> {
    let mut streaks = Vec::with_capacity(rows.len());
    let mut previous: Option<bool> = None;
    let mut run = 0u64;
    for row in rows {
        let state = row.occupied.unwrap_or(false);
        run = if previous == Some(state) { run + 1 } else { 1 };
        previous = Some(state);
        streaks.push(Some(run as f64));
    }
    streaks
}

const DAILY_COLUMN_COUNT: usize = 7;

fn daily_aggregates(rows: &[MergedRow]) -> Vec<[Option<f64>; DAILY_COLUMN_COUNT]> {
    let mut days: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        days.entry(row.received_at.date_naive()).or_default().push(idx);
    }

    let mut out = vec![[None; DAILY_COLUMN_COUNT]; rows.len()];
    for members in days.values() {
        let power: Vec<f64> = members.iter().filter_map(|&i| rows[i].power_w).collect();
        let current: Vec<f64> = members.iter().filter_map(|&i| rows[i].current_a).collect();
        let occupied: Vec<f64> = members
            .iter()
            .filter_map(|&i| rows[i].occupied.map(indicator))
            .collect();

        let power_std = match power.len() {
            0 => None,
            1 => Some(0.0),
            _ => sample_std(&power),
        };
        let aggregates = [
            mean(&power),
            max_of(&power),
            min_of(&power),
            power_std,
            mean(&current),
            max_of(&current),
            mean(&occupied),
        ];
        for &i in members {
            out[i] = aggregates;
        }
    }
    out
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("rolling_window:{};", cfg.rolling_window.describe()));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
