//! Dataset assembly: ingestion through feature engineering, plus the CSV and
//! metadata files the predictor consumes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::augment::{augment, AugmentConfig, AugmentReport, NoiseConfig};
use crate::cleaner::{CleanReport, EnergySummary, OccupancySummary, ReadingCleaner};
use crate::config::{ConfigError, DatasetConfig};
use crate::features::{create_all_features, FeatureConfig, FeatureTable};
use crate::ingest::{IngestError, TelemetryBatch, TelemetryQuery, TelemetrySource};
use crate::merge::{merge, MergeReport};
use crate::readings::{
    parse_timestamp, CalendarFields, MergedRow, TelemetryKind, MERGED_COLUMNS, UNKNOWN_IDENTIFIER,
};
use crate::sensor_status::{sensor_status, ModuleStatus};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("ingestion error: {0}")]
    Ingest(#[from] IngestError),
    #[error("no telemetry stream could be read (energy: {energy}; occupancy: {occupancy})")]
    SourcesUnavailable { energy: String, occupancy: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dataset {path} is missing required column {column}")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("failed to parse column {column} value '{value}' on line {line}")]
    ParseField {
        column: &'static str,
        line: u64,
        value: String,
    },
}

/// Row counts after every stage. Always reported, including for empty runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Stored documents that were not JSON objects or failed to decode.
    pub energy_skipped: u64,
    pub occupancy_skipped: u64,
    pub energy_input: u64,
    pub occupancy_input: u64,
    pub energy_cleaned: u64,
    pub occupancy_cleaned: u64,
    pub merged: u64,
    pub augmented: Option<u64>,
    pub featured: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hours_back: u32,
    pub location: Option<String>,
    pub module: Option<String>,
}

/// A stream whose fetch failed while the other stream was still read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableStream {
    pub stream: TelemetryKind,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub energy: Option<EnergySummary>,
    pub occupancy: Option<OccupancySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub window: QueryWindow,
    /// Set only when a fetch failed. A stream that was read but returned no
    /// rows leaves this empty.
    pub partial_source: Option<UnavailableStream>,
    pub parameters: DatasetConfig,
    pub num_records: u64,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub feature_columns: Vec<String>,
    pub counts: StageCounts,
    pub energy_clean: CleanReport,
    pub occupancy_clean: CleanReport,
    pub merge: MergeReport,
    pub augment: Option<AugmentReport>,
    pub statistics: SummaryStatistics,
    pub sensor_status: Vec<ModuleStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Merged rows before augmentation and feature engineering.
    pub cleaned: Vec<MergedRow>,
    pub table: FeatureTable,
    pub metadata: DatasetMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatasetOutcome {
    /// Both streams were empty after cleaning.
    Empty {
        counts: StageCounts,
        energy_clean: CleanReport,
        occupancy_clean: CleanReport,
        partial_source: Option<UnavailableStream>,
    },
    Built(Box<Dataset>),
}

impl DatasetOutcome {
    pub fn counts(&self) -> &StageCounts {
        match self {
            Self::Empty { counts, .. } => counts,
            Self::Built(dataset) => &dataset.metadata.counts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenDataset {
    pub dataset_path: PathBuf,
    pub cleaned_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Ingestion → cleaning → merge → optional augmentation → features.
///
/// `now` closes the query window and is the reference time for the sensor
/// offline check.
pub fn assemble_dataset(
    source: &dyn TelemetrySource,
    cfg: &DatasetConfig,
    now: DateTime<Utc>,
) -> Result<DatasetOutcome, DatasetError> {
    cfg.validate()?;
    let query = TelemetryQuery::last_hours(now, cfg.hours_back)
        .with_location(cfg.location.clone())
        .with_module(cfg.module.clone());

    info!(
        component = "dataset",
        event = "dataset.assemble.start",
        source = %source.describe(),
        start = %query.start,
        end = %query.end,
        location = ?query.location,
        module = ?query.module
    );

    let (raw_energy, raw_occupancy, partial_source) =
        match (source.fetch_energy(&query), source.fetch_occupancy(&query)) {
            (Ok(energy), Ok(occupancy)) => (energy, occupancy, None),
            (Ok(energy), Err(err)) => {
                let missing = unavailable(TelemetryKind::Occupancy, &err);
                (energy, TelemetryBatch::new(Vec::new()), Some(missing))
            }
            (Err(err), Ok(occupancy)) => {
                let missing = unavailable(TelemetryKind::Energy, &err);
                (TelemetryBatch::new(Vec::new()), occupancy, Some(missing))
            }
            (Err(energy), Err(occupancy)) => {
                return Err(DatasetError::SourcesUnavailable {
                    energy: energy.to_string(),
                    occupancy: occupancy.to_string(),
                })
            }
        };

    let mut cleaner = ReadingCleaner::new(cfg.cleaner.clone())?;
    let (energy_rows, energy_clean) = cleaner.clean_energy(&raw_energy.documents);
    let (occupancy_rows, occupancy_clean) = cleaner.clean_occupancy(&raw_occupancy.documents);

    let mut counts = StageCounts {
        energy_skipped: raw_energy.skipped_documents,
        occupancy_skipped: raw_occupancy.skipped_documents,
        energy_input: raw_energy.len() as u64,
        occupancy_input: raw_occupancy.len() as u64,
        energy_cleaned: energy_rows.len() as u64,
        occupancy_cleaned: occupancy_rows.len() as u64,
        ..StageCounts::default()
    };

    if energy_rows.is_empty() && occupancy_rows.is_empty() {
        info!(
            component = "dataset",
            event = "dataset.assemble.empty",
            energy_input = counts.energy_input,
            occupancy_input = counts.occupancy_input,
            energy_rejected = energy_clean.rejected_rows(),
            occupancy_rejected = occupancy_clean.rejected_rows()
        );
        return Ok(DatasetOutcome::Empty {
            counts,
            energy_clean,
            occupancy_clean,
            partial_source,
        });
    }
    if energy_rows.is_empty() {
        log_partial_source(TelemetryKind::Energy, "no rows after cleaning");
    } else if occupancy_rows.is_empty() {
        log_partial_source(TelemetryKind::Occupancy, "no rows after cleaning");
    }

    let (merged, merge_report) = merge(&energy_rows, &occupancy_rows, &cfg.merge)?;
    counts.merged = merged.len() as u64;

    let (rows, augment_report) = match &cfg.augment {
        Some(augment_cfg) => {
            let (rows, report) = augment(&merged, augment_cfg)?;
            counts.augmented = Some(rows.len() as u64);
            (rows, Some(report))
        }
        None => (merged.clone(), None),
    };

    let table = create_all_features(&rows, &cfg.features)?;
    counts.featured = table.len() as u64;

    let statuses = sensor_status(
        &energy_rows,
        &occupancy_rows,
        now,
        cfg.offline_threshold_minutes,
    );

    let metadata = DatasetMetadata {
        created_at: now,
        source: source.describe(),
        window: QueryWindow {
            start: query.start,
            end: query.end,
            hours_back: cfg.hours_back,
            location: query.location.clone(),
            module: query.module.clone(),
        },
        partial_source,
        parameters: cfg.clone(),
        num_records: table.len() as u64,
        schema_version: table.schema.version,
        schema_fingerprint: table.schema.fingerprint.clone(),
        feature_columns: table.schema.column_names(),
        counts: counts.clone(),
        energy_clean,
        occupancy_clean,
        merge: merge_report,
        augment: augment_report,
        statistics: SummaryStatistics {
            energy: cleaner.energy_summary().cloned(),
            occupancy: cleaner.occupancy_summary().cloned(),
        },
        sensor_status: statuses,
    };

    info!(
        component = "dataset",
        event = "dataset.assemble.finish",
        energy_skipped = counts.energy_skipped,
        occupancy_skipped = counts.occupancy_skipped,
        energy_input = counts.energy_input,
        occupancy_input = counts.occupancy_input,
        energy_cleaned = counts.energy_cleaned,
        occupancy_cleaned = counts.occupancy_cleaned,
        merged = counts.merged,
        augmented = ?counts.augmented,
        featured = counts.featured,
        fingerprint = %metadata.schema_fingerprint
    );

    Ok(DatasetOutcome::Built(Box::new(Dataset {
        cleaned: merged,
        table,
        metadata,
    })))
}

fn unavailable(stream: TelemetryKind, err: &IngestError) -> UnavailableStream {
    let error = err.to_string();
    log_partial_source(stream, &error);
    UnavailableStream { stream, error }
}

fn log_partial_source(missing: TelemetryKind, reason: &str) {
    warn!(
        component = "dataset",
        event = "dataset.assemble.partial_source",
        missing_stream = missing.as_str(),
        reason = reason
    );
}

/// Writes `<path>`, `<stem>_cleaned.csv` and `<stem>_metadata.json`.
pub fn write_dataset(dataset: &Dataset, path: &Path) -> Result<WrittenDataset, DatasetError> {
    write_feature_csv(path, &dataset.table)?;

    let cleaned_path = sibling_path(path, "cleaned", "csv");
    write_merged_csv(&cleaned_path, &dataset.cleaned)?;

    let metadata_path = metadata_path_for(path);
    write_json(&metadata_path, &dataset.metadata)?;

    Ok(WrittenDataset {
        dataset_path: path.to_path_buf(),
        cleaned_path,
        metadata_path,
    })
}

pub fn metadata_path_for(path: &Path) -> PathBuf {
    sibling_path(path, "metadata", "json")
}

fn sibling_path(path: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    path.with_file_name(format!("{stem}_{suffix}.{extension}"))
}

fn ensure_parent(path: &Path) -> Result<(), DatasetError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DatasetError> {
    ensure_parent(path)?;
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    fs::write(path, body)?;
    Ok(())
}

/// Base columns followed by every engineered column.
pub fn write_feature_csv(path: &Path, table: &FeatureTable) -> Result<(), DatasetError> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;

    let mut header: Vec<&str> = MERGED_COLUMNS.to_vec();
    header.extend(table.engineered_columns.iter().map(String::as_str));
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = merged_record(&row.base);
        record.extend(row.engineered.iter().map(|value| format_number(*value)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_merged_csv(path: &Path, rows: &[MergedRow]) -> Result<(), DatasetError> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(MERGED_COLUMNS)?;
    for row in rows {
        writer.write_record(merged_record(row))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads the base columns of a dataset CSV. Engineered columns and calendar
/// columns are ignored; calendar fields are derived again from `received_at`.
pub fn read_dataset_csv(path: &Path) -> Result<Vec<MergedRow>, DatasetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.trim(), idx))
        .collect();

    for required in ["received_at", "module", "location"] {
        if !index.contains_key(required) {
            return Err(DatasetError::MissingColumn {
                path: path.to_path_buf(),
                column: required,
            });
        }
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(parse_merged_record(&record, &index)?);
    }

    info!(
        component = "dataset",
        event = "dataset.csv.read",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(rows)
}

fn merged_record(row: &MergedRow) -> Vec<String> {
    vec![
        format_timestamp(row.received_at),
        row.module.clone(),
        row.location.clone(),
        row.sensor.clone().unwrap_or_default(),
        row.source.clone().unwrap_or_default(),
        row.reading_type.clone().unwrap_or_default(),
        format_number(row.current_ma),
        format_number(row.current_a),
        format_number(row.rms_a),
        format_number(row.adc_samples),
        format_number(row.vref),
        format_number(row.wifi_rssi),
        format_number(row.voltage_v),
        format_number(row.power_w),
        format_number(row.power_kwh),
        row.rcwl.map(|flag| flag.to_string()).unwrap_or_default(),
        row.pir.map(|flag| flag.to_string()).unwrap_or_default(),
        row.occupied.map(format_flag).unwrap_or_default(),
        format_number(row.temperature),
        format_number(row.humidity),
        row.occupancy_received_at
            .map(format_timestamp)
            .unwrap_or_default(),
        row.calendar.hour.to_string(),
        row.calendar.day_of_week.to_string(),
        format_flag(row.calendar.is_weekend),
    ]
}

struct RecordView<'r> {
    record: &'r StringRecord,
    index: &'r HashMap<&'r str, usize>,
    line: u64,
}

impl<'r> RecordView<'r> {
    fn cell(&self, column: &str) -> Option<&'r str> {
        self.index
            .get(column)
            .and_then(|&idx| self.record.get(idx))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn text(&self, column: &str) -> Option<String> {
        self.cell(column).map(str::to_string)
    }

    fn number(&self, column: &'static str) -> Result<Option<f64>, DatasetError> {
        match self.cell(column) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Some)
                .ok_or_else(|| parse_error(column, self.line, raw)),
        }
    }

    fn flag(&self, column: &'static str) -> Result<Option<u8>, DatasetError> {
        Ok(self.number(column)?.map(|value| u8::from(value >= 1.0)))
    }

    fn boolean(&self, column: &'static str) -> Result<Option<bool>, DatasetError> {
        match self.cell(column) {
            None => Ok(None),
            Some(raw) => parse_flag(raw)
                .map(Some)
                .ok_or_else(|| parse_error(column, self.line, raw)),
        }
    }

    fn timestamp(&self, column: &'static str) -> Result<Option<DateTime<Utc>>, DatasetError> {
        match self.cell(column) {
            None => Ok(None),
            Some(raw) => parse_timestamp(raw)
                .map(Some)
                .ok_or_else(|| parse_error(column, self.line, raw)),
        }
    }
}

fn parse_merged_record(
    record: &StringRecord,
    index: &HashMap<&str, usize>,
) -> Result<MergedRow, DatasetError> {
    let view = RecordView {
        record,
        index,
        line: record.position().map(|pos| pos.line()).unwrap_or(0),
    };
    let received_at = view
        .timestamp("received_at")?
        .ok_or_else(|| parse_error("received_at", view.line, ""))?;

    Ok(MergedRow {
        module: view
            .text("module")
            .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string()),
        location: view
            .text("location")
            .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string()),
        sensor: view.text("sensor"),
        source: view.text("source"),
        reading_type: view.text("type"),
        received_at,
        current_ma: view.number("current_ma")?,
        current_a: view.number("current_a")?,
        rms_a: view.number("rms_a")?,
        adc_samples: view.number("adc_samples")?,
        vref: view.number("vref")?,
        wifi_rssi: view.number("wifi_rssi")?,
        voltage_v: view.number("voltage_v")?,
        power_w: view.number("power_w")?,
        power_kwh: view.number("power_kwh")?,
        rcwl: view.flag("rcwl")?,
        pir: view.flag("pir")?,
        occupied: view.boolean("occupied")?,
        temperature: view.number("temperature")?,
        humidity: view.number("humidity")?,
        occupancy_received_at: view.timestamp("occupancy_received_at")?,
        calendar: CalendarFields::from_timestamp(received_at),
    })
}

fn parse_error(column: &'static str, line: u64, value: &str) -> DatasetError {
    DatasetError::ParseField {
        column,
        line,
        value: value.to_string(),
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn format_flag(flag: bool) -> String {
    let value = if flag { "1" } else { "0" };
    value.to_string()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "1.0" | "true" => Some(true),
        "0" | "0.0" | "false" => Some(false),
        _ => None,
    }
}

/// Provenance written next to an augmented dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationMetadata {
    pub created_at: DateTime<Utc>,
    pub input_csv: PathBuf,
    pub output_csv: PathBuf,
    pub multiplier: f64,
    pub block_size: usize,
    pub seed: u64,
    pub noise: NoiseConfig,
    pub num_records: u64,
    pub schema_fingerprint: String,
    pub feature_columns: Vec<String>,
    pub report: AugmentReport,
}

/// Reads a dataset CSV, augments it, re-derives every feature and writes the
/// result plus `<stem>_metadata.json`.
pub fn augment_dataset_file(
    input: &Path,
    output: &Path,
    augment_cfg: &AugmentConfig,
    feature_cfg: &FeatureConfig,
    created_at: DateTime<Utc>,
) -> Result<AugmentationMetadata, DatasetError> {
    augment_cfg.validate()?;
    let rows = read_dataset_csv(input)?;
    let (augmented, report) = augment(&rows, augment_cfg)?;
    let table = create_all_features(&augmented, feature_cfg)?;
    write_feature_csv(output, &table)?;

    let metadata = AugmentationMetadata {
        created_at,
        input_csv: input.to_path_buf(),
        output_csv: output.to_path_buf(),
        multiplier: augment_cfg.multiplier,
        block_size: augment_cfg.block_size,
        seed: augment_cfg.seed,
        noise: augment_cfg.noise.clone(),
        num_records: table.len() as u64,
        schema_fingerprint: table.schema.fingerprint.clone(),
        feature_columns: table.schema.column_names(),
        report,
    };
    write_json(&metadata_path_for(output), &metadata)?;

    info!(
        component = "dataset",
        event = "dataset.augment.written",
        input = %input.display(),
        output = %output.display(),
        num_records = metadata.num_records
    );
    Ok(metadata)
}
