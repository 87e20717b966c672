//! Block-bootstrap augmentation of a merged dataset.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{require_non_negative_f64, ConfigError};
use crate::readings::MergedRow;

pub const DEFAULT_AUGMENT_MULTIPLIER: f64 = 3.0;
pub const DEFAULT_BLOCK_SIZE: usize = 12;
pub const DEFAULT_AUGMENT_SEED: u64 = 42;
pub const BOOTSTRAP_SHIFT_DAYS: i64 = 7;

/// Jitter magnitudes. `current_a_pct` is relative, the rest are absolute
/// standard deviations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    pub current_a_pct: f64,
    pub temperature_std: f64,
    pub humidity_std: f64,
    pub wifi_rssi_std: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            current_a_pct: 0.03,
            temperature_std: 0.2,
            humidity_std: 0.5,
            wifi_rssi_std: 1.0,
        }
    }
}

impl NoiseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_negative_f64("noise.current_a_pct", self.current_a_pct)?;
        require_non_negative_f64("noise.temperature_std", self.temperature_std)?;
        require_non_negative_f64("noise.humidity_std", self.humidity_std)?;
        require_non_negative_f64("noise.wifi_rssi_std", self.wifi_rssi_std)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Output size relative to input; must be > 1.
    pub multiplier: f64,
    pub block_size: usize,
    pub seed: u64,
    pub noise: NoiseConfig,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_AUGMENT_MULTIPLIER,
            block_size: DEFAULT_BLOCK_SIZE,
            seed: DEFAULT_AUGMENT_SEED,
            noise: NoiseConfig::default(),
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if self.block_size == 0 {
            return Err(ConfigError::NonPositive {
                name: "augment.block_size",
            });
        }
        self.noise.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationAugmentation {
    pub location: String,
    pub original_rows: u64,
    pub synthetic_rows: u64,
    /// Whether the group was too small for contiguous blocks.
    pub resampled_rows: bool,
    /// Synthetic rows pushed past their nominal week because that
    /// (module, location, timestamp) key was already taken.
    pub relocated_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentReport {
    pub input_rows: u64,
    pub synthetic_rows: u64,
    pub relocated_rows: u64,
    pub output_rows: u64,
    pub locations: Vec<LocationAugmentation>,
}

struct Jitter {
    current: Normal<f64>,
    temperature: Normal<f64>,
    humidity: Normal<f64>,
    wifi_rssi: Normal<f64>,
}

impl Jitter {
    fn new(noise: &NoiseConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            current: normal("noise.current_a_pct", noise.current_a_pct)?,
            temperature: normal("noise.temperature_std", noise.temperature_std)?,
            humidity: normal("noise.humidity_std", noise.humidity_std)?,
            wifi_rssi: normal("noise.wifi_rssi_std", noise.wifi_rssi_std)?,
        })
    }

    /// Draws the same number of samples for every row so the stream of
    /// random numbers does not depend on which fields are null.
    fn apply(&self, row: &mut MergedRow, rng: &mut StdRng) {
        let current_factor = 1.0 + self.current.sample(rng);
        let temperature_delta = self.temperature.sample(rng);
        let humidity_delta = self.humidity.sample(rng);
        let rssi_delta = self.wifi_rssi.sample(rng);

        row.current_a = row.current_a.map(|a| a * current_factor);
        row.rms_a = row.rms_a.map(|a| a * current_factor);
        row.temperature = row.temperature.map(|t| t + temperature_delta);
        row.humidity = row.humidity.map(|h| h + humidity_delta);
        row.wifi_rssi = row.wifi_rssi.map(|r| r + rssi_delta);
    }
}

fn normal(field: &'static str, std_dev: f64) -> Result<Normal<f64>, ConfigError> {
    Normal::new(0.0, std_dev).map_err(|_| ConfigError::InvalidValue {
        field,
        value: std_dev.to_string(),
    })
}

/// Grows each location group to roughly `multiplier` times its size with
/// jittered, time-shifted copies, then re-applies the physical envelope to
/// every row. Same input and config give identical output.
pub fn augment(
    rows: &[MergedRow],
    cfg: &AugmentConfig,
) -> Result<(Vec<MergedRow>, AugmentReport), ConfigError> {
    cfg.validate()?;
    let jitter = Jitter::new(&cfg.noise)?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let mut ordered: Vec<MergedRow> = rows.to_vec();
    ordered.sort_by(|a, b| {
        (&a.location, a.received_at, &a.module).cmp(&(&b.location, b.received_at, &b.module))
    });

    let mut taken: KeySet = ordered.iter().map(row_key).collect();
    let mut synthetic = Vec::new();
    let mut locations = Vec::new();
    let mut start = 0;
    while start < ordered.len() {
        let location = ordered[start].location.clone();
        let end = ordered[start..]
            .iter()
            .position(|row| row.location != location)
            .map_or(ordered.len(), |offset| start + offset);
        let group = &ordered[start..end];

        let target = synthetic_target(group.len(), cfg.multiplier);
        let resampled_rows = group.len() < cfg.block_size;
        let mut placer = Placer {
            taken: &mut taken,
            out: &mut synthetic,
            relocated: 0,
        };
        let produced = if resampled_rows {
            resample_rows(group, target, &jitter, &mut rng, &mut placer)
        } else {
            resample_blocks(group, target, cfg.block_size, &jitter, &mut rng, &mut placer)
        };

        locations.push(LocationAugmentation {
            location,
            original_rows: group.len() as u64,
            synthetic_rows: produced as u64,
            resampled_rows,
            relocated_rows: placer.relocated,
        });
        start = end;
    }

    let synthetic_rows = synthetic.len() as u64;
    ordered.extend(synthetic);
    for row in ordered.iter_mut() {
        row.enforce_physical_constraints();
        row.refresh_calendar();
    }
    ordered.sort_by(|a, b| {
        (&a.location, a.received_at, &a.module).cmp(&(&b.location, b.received_at, &b.module))
    });

    let report = AugmentReport {
        input_rows: rows.len() as u64,
        synthetic_rows,
        relocated_rows: locations.iter().map(|entry| entry.relocated_rows).sum(),
        output_rows: ordered.len() as u64,
        locations,
    };

    info!(
        component = "augment",
        event = "augment.finish",
        multiplier = cfg.multiplier,
        block_size = cfg.block_size,
        seed = cfg.seed,
        input_rows = report.input_rows,
        synthetic_rows = report.synthetic_rows,
        relocated_rows = report.relocated_rows,
        output_rows = report.output_rows,
        locations = report.locations.len()
    );

    Ok((ordered, report))
}

/// `ceil(n * (multiplier - 1))` extra rows for a group of `n`.
pub fn synthetic_target(n: usize, multiplier: f64) -> usize {
    (n as f64 * (multiplier - 1.0)).ceil().max(0.0) as usize
}

type KeySet = HashSet<(String, String, DateTime<Utc>)>;

fn row_key(row: &MergedRow) -> (String, String, DateTime<Utc>) {
    (row.module.clone(), row.location.clone(), row.received_at)
}

/// Shifts synthetic rows forward in whole weeks so that no two output rows
/// share a (module, location, timestamp) key.
struct Placer<'a> {
    taken: &'a mut KeySet,
    out: &'a mut Vec<MergedRow>,
    relocated: u64,
}

impl Placer<'_> {
    /// Starts at `weeks` and moves one week further per taken key.
    fn place(&mut self, mut row: MergedRow, weeks: i64) {
        let mut shift = weeks;
        loop {
            let candidate = (
                row.module.clone(),
                row.location.clone(),
                row.received_at + Duration::days(BOOTSTRAP_SHIFT_DAYS * shift),
            );
            if self.taken.insert(candidate) {
                break;
            }
            shift += 1;
        }
        if shift != weeks {
            self.relocated += 1;
        }
        shift_days(&mut row, BOOTSTRAP_SHIFT_DAYS * shift);
        self.out.push(row);
    }
}

/// Draw `i` starts at week `i / n + 1`, so each pass over the group lands a
/// week later than the previous one.
fn resample_rows(
    group: &[MergedRow],
    target: usize,
    jitter: &Jitter,
    rng: &mut StdRng,
    placer: &mut Placer<'_>,
) -> usize {
    for draw in 0..target {
        let mut row = group[rng.gen_range(0..group.len())].clone();
        jitter.apply(&mut row, rng);
        placer.place(row, (draw / group.len()) as i64 + 1);
    }
    target
}

fn resample_blocks(
    group: &[MergedRow],
    target: usize,
    block_size: usize,
    jitter: &Jitter,
    rng: &mut StdRng,
    placer: &mut Placer<'_>,
) -> usize {
    let mut produced = 0;
    let mut block_index: i64 = 0;
    while produced < target {
        block_index += 1;
        let block_start = rng.gen_range(0..=group.len() - block_size);
        for source in &group[block_start..block_start + block_size] {
            if produced == target {
                break;
            }
            let mut row = source.clone();
            jitter.apply(&mut row, rng);
            placer.place(row, block_index);
            produced += 1;
        }
    }
    produced
}

fn shift_days(row: &mut MergedRow, days: i64) {
    let offset = Duration::days(days);
    row.received_at += offset;
    row.occupancy_received_at = row.occupancy_received_at.map(|ts| ts + offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::{CalendarFields, DEFAULT_VOLTAGE_V};
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn row(location: &str, i: i64, current_a: f64, temperature: f64) -> MergedRow {
        let ts: DateTime<Utc> = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("fixed timestamp should be valid")
            + Duration::minutes(5 * i);
        MergedRow {
            module: "M1".to_string(),
            location: location.to_string(),
            sensor: None,
            source: None,
            reading_type: None,
            received_at: ts,
            current_ma: Some(current_a * 1_000.0),
            current_a: Some(current_a),
            rms_a: Some(current_a),
            adc_samples: None,
            vref: None,
            wifi_rssi: Some(-1.0),
            voltage_v: Some(DEFAULT_VOLTAGE_V),
            power_w: Some(current_a * DEFAULT_VOLTAGE_V),
            power_kwh: Some(current_a * DEFAULT_VOLTAGE_V / 1_000.0),
            rcwl: Some(1),
            pir: Some(0),
            occupied: Some(true),
            temperature: Some(temperature),
            humidity: Some(99.9),
            occupancy_received_at: Some(ts),
            calendar: CalendarFields::from_timestamp(ts),
        }
    }

    fn dataset() -> Vec<MergedRow> {
        let mut rows: Vec<MergedRow> = (0..30)
            .map(|i| row("Room A", i, 0.01 * (i % 4) as f64, 59.95))
            .collect();
        rows.extend((0..5).map(|i| row("Lab", i, 2.0, 21.0)));
        rows
    }

    #[test]
    fn multiplier_must_exceed_one() {
        let cfg = AugmentConfig {
            multiplier: 1.0,
            ..AugmentConfig::default()
        };
        assert_eq!(
            augment(&dataset(), &cfg).expect_err("multiplier of one should be rejected"),
            ConfigError::InvalidMultiplier(1.0)
        );

        let cfg = AugmentConfig {
            noise: NoiseConfig {
                humidity_std: -0.5,
                ..NoiseConfig::default()
            },
            ..AugmentConfig::default()
        };
        assert!(matches!(
            augment(&dataset(), &cfg),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn growth_is_bounded_per_location() {
        let (rows, report) =
            augment(&dataset(), &AugmentConfig::default()).expect("augment should succeed");

        assert_eq!(report.input_rows, 35);
        assert_eq!(report.output_rows, rows.len() as u64);
        let lab = &report.locations[0];
        assert_eq!(lab.location, "Lab");
        assert_eq!(lab.synthetic_rows, 10);
        assert!(lab.resampled_rows);
        let room = &report.locations[1];
        assert_eq!(room.synthetic_rows, 60);
        assert!(!room.resampled_rows);

        for summary in &report.locations {
            let total = summary.original_rows + summary.synthetic_rows;
            assert!(total as f64 <= (summary.original_rows as f64 * 3.0).ceil());
        }
    }

    #[test]
    fn synthetic_rows_are_shifted_by_whole_weeks() {
        let input = dataset();
        let originals: BTreeSet<DateTime<Utc>> = input.iter().map(|r| r.received_at).collect();
        let (rows, _) =
            augment(&input, &AugmentConfig::default()).expect("augment should succeed");

        let keys: HashSet<_> = rows.iter().map(row_key).collect();
        assert_eq!(keys.len(), rows.len(), "augmented keys should be unique");

        for row in rows.iter().filter(|r| !originals.contains(&r.received_at)) {
            let shifted = (1..=20).any(|weeks| {
                let offset = Duration::days(BOOTSTRAP_SHIFT_DAYS * weeks);
                originals.contains(&(row.received_at - offset))
            });
            assert!(shifted, "{} is not a week-shifted copy", row.received_at);
            assert_eq!(row.occupancy_received_at, Some(row.received_at));
        }
    }

    #[test]
    fn physical_envelope_holds_after_jitter() {
        let cfg = AugmentConfig {
            noise: NoiseConfig {
                current_a_pct: 5.0,
                temperature_std: 3.0,
                humidity_std: 3.0,
                wifi_rssi_std: 3.0,
            },
            ..AugmentConfig::default()
        };
        let (rows, _) = augment(&dataset(), &cfg).expect("augment should succeed");

        for row in &rows {
            let current_a = row.current_a.expect("current should survive jitter");
            assert!(current_a >= 0.0);
            assert_eq!(row.current_ma, Some(current_a * 1_000.0));
            assert_eq!(row.power_w, Some(current_a * DEFAULT_VOLTAGE_V));
            let temperature = row.temperature.expect("temperature should stay in range");
            assert!((-10.0..=60.0).contains(&temperature));
            let humidity = row.humidity.expect("humidity should be clamped");
            assert!((0.0..=100.0).contains(&humidity));
            let rssi = row.wifi_rssi.expect("rssi should stay in range");
            assert!((-100.0..=0.0).contains(&rssi));
            assert_eq!(row.calendar, CalendarFields::from_timestamp(row.received_at));
        }
    }

    #[test]
    fn same_seed_same_rows() {
        let cfg = AugmentConfig::default();
        let (first, _) = augment(&dataset(), &cfg).expect("augment should succeed");
        let (second, _) = augment(&dataset(), &cfg).expect("augment should succeed");
        assert_eq!(first, second);

        let other_seed = AugmentConfig {
            seed: 7,
            ..AugmentConfig::default()
        };
        let (third, _) = augment(&dataset(), &other_seed).expect("augment should succeed");
        assert_ne!(first, third);
    }

    #[test]
    fn groups_spanning_a_week_never_duplicate_keys() {
        let first = row("Lab", 0, 2.0, 21.0);
        let mut week_later = row("Lab", 0, 2.5, 22.0);
        shift_days(&mut week_later, BOOTSTRAP_SHIFT_DAYS);
        week_later.refresh_calendar();

        let (rows, report) = augment(&[first, week_later], &AugmentConfig::default())
            .expect("augment should succeed");

        assert_eq!(rows.len(), 6);
        let keys: HashSet<_> = rows.iter().map(row_key).collect();
        assert_eq!(keys.len(), rows.len());
        assert!(report.locations[0].relocated_rows >= 1);
        assert_eq!(report.relocated_rows, report.locations[0].relocated_rows);
    }

    #[test]
    fn target_rounds_up() {
        assert_eq!(synthetic_target(5, 3.0), 10);
        assert_eq!(synthetic_target(3, 1.5), 2);
        assert_eq!(synthetic_target(0, 3.0), 0);
    }
}
