//! Reading cleaner: validation, deduplication, range rules, outlier rejection
//! and derived energy fields for both telemetry streams.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{require_positive_f64, ConfigError};
use crate::readings::{
    binary_flag, coerce_identifier, coerce_optional_text, CalendarFields, EnergyRow,
    OccupancyRow, RawCurrentReading, RawOccupancyReading, RawReading, RawScalar, TelemetryKind,
    DEFAULT_VOLTAGE_V, HUMIDITY_MAX_PCT, HUMIDITY_MIN_PCT, RSSI_MAX_DBM, RSSI_MIN_DBM,
    TEMPERATURE_MAX_C, TEMPERATURE_MIN_C,
};

pub const STRICT_IQR_MULTIPLIER: f64 = 1.5;
pub const LENIENT_IQR_MULTIPLIER: f64 = 3.0;

const MAX_CURRENT_A: f64 = 100.0;
const MAX_CURRENT_MA: f64 = 20_000.0;
const VREF_MIN_V: f64 = 0.0;
const VREF_MAX_V: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// k in `[Q1 - k*IQR, Q3 + k*IQR]`.
    pub iqr_multiplier: f64,
    /// Outlier rejection is skipped below this many non-null current values.
    pub outlier_min_samples: usize,
    pub default_voltage_v: f64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            iqr_multiplier: LENIENT_IQR_MULTIPLIER,
            outlier_min_samples: 5,
            default_voltage_v: DEFAULT_VOLTAGE_V,
        }
    }
}

impl CleanerConfig {
    pub fn strict() -> Self {
        Self {
            iqr_multiplier: STRICT_IQR_MULTIPLIER,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive_f64("iqr_multiplier", self.iqr_multiplier)?;
        require_positive_f64("default_voltage_v", self.default_voltage_v)?;
        Ok(())
    }
}

/// Per-stream accounting of everything the cleaner excluded or nulled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    pub kind: TelemetryKind,
    pub input_rows: u64,
    pub invalid_timestamp: u64,
    pub duplicates: u64,
    pub disconnected: u64,
    pub outliers: u64,
    pub nulled_fields: u64,
    pub output_rows: u64,
}

impl CleanReport {
    fn new(kind: TelemetryKind, input_rows: usize) -> Self {
        Self {
            kind,
            input_rows: input_rows as u64,
            invalid_timestamp: 0,
            duplicates: 0,
            disconnected: 0,
            outliers: 0,
            nulled_fields: 0,
            output_rows: 0,
        }
    }

    pub fn rejected_rows(&self) -> u64 {
        self.invalid_timestamp + self.duplicates + self.disconnected + self.outliers
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergySummary {
    pub rows: u64,
    pub mean_current_a: Option<f64>,
    pub std_current_a: Option<f64>,
    pub mean_power_w: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancySummary {
    pub rows: u64,
    pub mean_temperature_c: Option<f64>,
    pub mean_humidity_pct: Option<f64>,
    pub occupancy_rate: Option<f64>,
}

/// Cleans raw batches. The only state kept between calls is the summary of
/// the latest pass per stream.
#[derive(Debug, Clone)]
pub struct ReadingCleaner {
    cfg: CleanerConfig,
    energy_summary: Option<EnergySummary>,
    occupancy_summary: Option<OccupancySummary>,
}

impl ReadingCleaner {
    pub fn new(cfg: CleanerConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            energy_summary: None,
            occupancy_summary: None,
        })
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.cfg
    }

    pub fn energy_summary(&self) -> Option<&EnergySummary> {
        self.energy_summary.as_ref()
    }

    pub fn occupancy_summary(&self) -> Option<&OccupancySummary> {
        self.occupancy_summary.as_ref()
    }

    pub fn clean_energy(&mut self, raw: &[RawCurrentReading]) -> (Vec<EnergyRow>, CleanReport) {
        let mut report = CleanReport::new(TelemetryKind::Energy, raw.len());
        let stamped = dedupe_latest(raw, &mut report);

        let mut candidates = Vec::with_capacity(stamped.len());
        for (reading, received_at) in stamped {
            let mut row = coerce_energy(reading, received_at, &mut report.nulled_fields);
            cross_fill_currents(&mut row);
            if is_device_disconnected(&row) {
                report.disconnected += 1;
                continue;
            }
            candidates.push(row);
        }

        let bounds = iqr_bounds(
            candidates.iter().filter_map(|row| row.current_a),
            self.cfg.iqr_multiplier,
            self.cfg.outlier_min_samples,
        );

        let mut rows = Vec::with_capacity(candidates.len());
        for row in candidates {
            if let (Some((lower, upper)), Some(current_a)) = (bounds, row.current_a) {
                if current_a < lower || current_a > upper {
                    report.outliers += 1;
                    continue;
                }
            }
            rows.push(finish_energy(row, self.cfg.default_voltage_v));
        }

        rows.sort_by(|a, b| {
            (a.received_at, &a.location, &a.module).cmp(&(b.received_at, &b.location, &b.module))
        });
        report.output_rows = rows.len() as u64;

        let summary = summarize_energy(&rows);
        log_clean_finish(&report);
        info!(
            component = "cleaner",
            event = "cleaner.energy.summary",
            mean_current_a = ?summary.mean_current_a,
            std_current_a = ?summary.std_current_a,
            mean_power_w = ?summary.mean_power_w,
            iqr_bounds = ?bounds
        );
        self.energy_summary = Some(summary);

        (rows, report)
    }

    pub fn clean_occupancy(
        &mut self,
        raw: &[RawOccupancyReading],
    ) -> (Vec<OccupancyRow>, CleanReport) {
        let mut report = CleanReport::new(TelemetryKind::Occupancy, raw.len());
        let stamped = dedupe_latest(raw, &mut report);

        let mut rows = Vec::with_capacity(stamped.len());
        for (reading, received_at) in stamped {
            match coerce_occupancy(reading, received_at, &mut report.nulled_fields) {
                Some(row) => rows.push(row),
                None => report.disconnected += 1,
            }
        }

        rows.sort_by(|a, b| {
            (a.received_at, &a.location, &a.module).cmp(&(b.received_at, &b.location, &b.module))
        });
        report.output_rows = rows.len() as u64;

        let summary = summarize_occupancy(&rows);
        log_clean_finish(&report);
        info!(
            component = "cleaner",
            event = "cleaner.occupancy.summary",
            mean_temperature_c = ?summary.mean_temperature_c,
            mean_humidity_pct = ?summary.mean_humidity_pct,
            occupancy_rate = ?summary.occupancy_rate
        );
        self.occupancy_summary = Some(summary);

        (rows, report)
    }
}

/// Drops rows without a parseable timestamp, then keeps the last-ingested
/// reading per (module, location, timestamp). Survivors keep the position of
/// the first occurrence of their key.
fn dedupe_latest<'a, R: RawReading>(
    raw: &'a [R],
    report: &mut CleanReport,
) -> Vec<(&'a R, DateTime<Utc>)> {
    let mut positions: HashMap<(String, String, DateTime<Utc>), usize> = HashMap::new();
    let mut kept: Vec<(&'a R, DateTime<Utc>)> = Vec::with_capacity(raw.len());

    for reading in raw {
        let Some(received_at) = reading.timestamp() else {
            report.invalid_timestamp += 1;
            continue;
        };
        let key = (reading.module_id(), reading.location_id(), received_at);
        match positions.get(&key) {
            Some(&idx) => {
                kept[idx] = (reading, received_at);
                report.duplicates += 1;
            }
            None => {
                positions.insert(key, kept.len());
                kept.push((reading, received_at));
            }
        }
    }

    kept
}

#[derive(Debug, Clone)]
struct EnergyCandidate {
    module: String,
    location: String,
    sensor: Option<String>,
    source: Option<String>,
    reading_type: Option<String>,
    received_at: DateTime<Utc>,
    current_ma: Option<f64>,
    current_a: Option<f64>,
    rms_a: Option<f64>,
    adc_samples: Option<f64>,
    vref: Option<f64>,
    wifi_rssi: Option<f64>,
}

fn coerce_energy(
    reading: &RawCurrentReading,
    received_at: DateTime<Utc>,
    nulled: &mut u64,
) -> EnergyCandidate {
    let current_a = coerce_counted(&reading.current_a, nulled)
        .map(|v| v.max(0.0))
        .and_then(|v| keep_within(v, f64::MIN, MAX_CURRENT_A, nulled));
    let current_ma = coerce_counted(&reading.current_ma, nulled)
        .map(|v| v.max(0.0))
        .and_then(|v| keep_within(v, f64::MIN, MAX_CURRENT_MA, nulled));
    let rms_a = coerce_counted(&reading.rms_a, nulled).map(|v| v.max(0.0));
    let vref = coerce_counted(&reading.vref, nulled)
        .and_then(|v| keep_within(v, VREF_MIN_V, VREF_MAX_V, nulled));
    let wifi_rssi = coerce_counted(&reading.wifi_rssi, nulled)
        .and_then(|v| keep_within(v, RSSI_MIN_DBM, RSSI_MAX_DBM, nulled));

    EnergyCandidate {
        module: coerce_identifier(&reading.module),
        location: coerce_identifier(&reading.location),
        sensor: coerce_optional_text(&reading.sensor),
        source: coerce_optional_text(&reading.source),
        reading_type: coerce_optional_text(&reading.reading_type),
        received_at,
        current_ma,
        current_a,
        rms_a,
        adc_samples: coerce_counted(&reading.adc_samples, nulled),
        vref,
        wifi_rssi,
    }
}

fn cross_fill_currents(row: &mut EnergyCandidate) {
    if row.current_a.is_none() {
        row.current_a = row.current_ma.map(|ma| ma / 1_000.0);
    }
    if row.current_ma.is_none() {
        row.current_ma = row.current_a.map(|a| a * 1_000.0);
    }
    if row.rms_a.is_none() {
        row.rms_a = row.current_a;
    }
}

/// A literal zero is indistinguishable from an unplugged clamp sensor, so a
/// row whose every current field is null or zero is not kept.
fn is_device_disconnected(row: &EnergyCandidate) -> bool {
    [row.current_a, row.current_ma, row.rms_a]
        .iter()
        .all(|value| value.map(|v| v == 0.0).unwrap_or(true))
}

fn finish_energy(row: EnergyCandidate, default_voltage_v: f64) -> EnergyRow {
    let voltage_v = row.vref.unwrap_or(default_voltage_v);
    let power_w = row.current_a.map(|a| a * voltage_v);
    EnergyRow {
        module: row.module,
        location: row.location,
        sensor: row.sensor,
        source: row.source,
        reading_type: row.reading_type,
        received_at: row.received_at,
        current_ma: row.current_ma,
        current_a: row.current_a,
        rms_a: row.rms_a,
        adc_samples: row.adc_samples,
        vref: row.vref,
        wifi_rssi: row.wifi_rssi,
        voltage_v,
        power_w,
        power_kwh: power_w.map(|w| w / 1_000.0),
        calendar: CalendarFields::from_timestamp(row.received_at),
    }
}

fn coerce_occupancy(
    reading: &RawOccupancyReading,
    received_at: DateTime<Utc>,
    nulled: &mut u64,
) -> Option<OccupancyRow> {
    let rcwl = binary_flag(coerce_counted(&reading.rcwl, nulled));
    let pir = binary_flag(coerce_counted(&reading.pir, nulled));
    let temperature = coerce_counted(&reading.temperature, nulled);
    let humidity = coerce_counted(&reading.humidity, nulled);

    if temperature == Some(0.0) && humidity == Some(0.0) {
        return None;
    }

    let temperature =
        temperature.and_then(|t| keep_within(t, TEMPERATURE_MIN_C, TEMPERATURE_MAX_C, nulled));
    let humidity = humidity.map(|h| h.clamp(HUMIDITY_MIN_PCT, HUMIDITY_MAX_PCT));
    let rssi = coerce_counted(&reading.rssi, nulled)
        .and_then(|v| keep_within(v, RSSI_MIN_DBM, RSSI_MAX_DBM, nulled));

    Some(OccupancyRow {
        module: coerce_identifier(&reading.module),
        location: coerce_identifier(&reading.location),
        source: coerce_optional_text(&reading.source),
        received_at,
        rcwl,
        pir,
        occupied: rcwl == 1 || pir == 1,
        temperature,
        humidity,
        rssi,
        uptime: coerce_counted(&reading.uptime, nulled),
        heap: coerce_counted(&reading.heap, nulled),
        calendar: CalendarFields::from_timestamp(received_at),
    })
}

fn coerce_counted(field: &Option<RawScalar>, nulled: &mut u64) -> Option<f64> {
    let raw = field.as_ref()?;
    let value = raw.as_f64();
    if value.is_none() {
        *nulled += 1;
    }
    value
}

fn keep_within(value: f64, min: f64, max: f64, nulled: &mut u64) -> Option<f64> {
    if value < min || value > max {
        *nulled += 1;
        None
    } else {
        Some(value)
    }
}

/// Acceptance interval for the IQR rule, or `None` when the rule does not
/// apply (too few samples or a degenerate spread).
pub fn iqr_bounds(
    values: impl Iterator<Item = f64>,
    multiplier: f64,
    min_samples: usize,
) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() || sorted.len() < min_samples {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let q1 = quantile_sorted(&sorted, 0.25);
    let q3 = quantile_sorted(&sorted, 0.75);
    let iqr = q3 - q1;
    if iqr <= 0.0 {
        return None;
    }

    Some(((q1 - multiplier * iqr).max(0.0), q3 + multiplier * iqr))
}

/// Linear-interpolated quantile of an ascending slice.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation; `None` below two samples.
pub(crate) fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - m;
            d * d
        })
        .sum::<f64>()
        / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

fn summarize_energy(rows: &[EnergyRow]) -> EnergySummary {
    let currents: Vec<f64> = rows.iter().filter_map(|row| row.current_a).collect();
    let powers: Vec<f64> = rows.iter().filter_map(|row| row.power_w).collect();
    EnergySummary {
        rows: rows.len() as u64,
        mean_current_a: mean(&currents),
        std_current_a: sample_std(&currents),
        mean_power_w: mean(&powers),
    }
}

fn summarize_occupancy(rows: &[OccupancyRow]) -> OccupancySummary {
    let temperatures: Vec<f64> = rows.iter().filter_map(|row| row.temperature).collect();
    let humidities: Vec<f64> = rows.iter().filter_map(|row| row.humidity).collect();
    let occupied: Vec<f64> = rows
        .iter()
        .map(|row| if row.occupied { 1.0 } else { 0.0 })
        .collect();
    OccupancySummary {
        rows: rows.len() as u64,
        mean_temperature_c: mean(&temperatures),
        mean_humidity_pct: mean(&humidities),
        occupancy_rate: mean(&occupied),
    }
}

fn log_clean_finish(report: &CleanReport) {
    let event = match report.kind {
        TelemetryKind::Energy => "cleaner.energy.finish",
        TelemetryKind::Occupancy => "cleaner.occupancy.finish",
    };
    info!(
        component = "cleaner",
        event = event,
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        invalid_timestamp = report.invalid_timestamp,
        duplicates = report.duplicates,
        disconnected = report.disconnected,
        outliers = report.outliers,
        nulled_fields = report.nulled_fields
    );
    if report.input_rows > 0 && report.output_rows == 0 {
        warn!(
            component = "cleaner",
            event = "cleaner.stream.emptied",
            kind = report.kind.as_str(),
            input_rows = report.input_rows
        );
    }
}
