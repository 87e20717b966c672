//! Ingestion adapters: the injected data-access seam the pipeline reads from.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::readings::{RawCurrentReading, RawOccupancyReading, RawReading, TelemetryKind};

pub const ENERGY_COLLECTION: &str = "energy_readings";
pub const OCCUPANCY_COLLECTION: &str = "occupancy_telemetry";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid query window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Why a stored document was left out of a batch.
#[derive(Debug, Error)]
enum DocumentError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// Documents matching a query, plus the count of stored documents that could
/// not be decoded as readings.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryBatch<T> {
    pub documents: Vec<T>,
    pub skipped_documents: u64,
}

impl<T> TelemetryBatch<T> {
    pub fn new(documents: Vec<T>) -> Self {
        Self {
            documents,
            skipped_documents: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Time window plus optional identity filters for one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location: Option<String>,
    pub module: Option<String>,
}

impl TelemetryQuery {
    /// Saturates at the earliest representable instant instead of
    /// overflowing.
    pub fn last_hours(now: DateTime<Utc>, hours_back: u32) -> Self {
        Self {
            start: now
                .checked_sub_signed(Duration::hours(i64::from(hours_back)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: now,
            location: None,
            module: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_module(mut self, module: Option<String>) -> Self {
        self.module = module;
        self
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.start > self.end {
            return Err(IngestError::InvalidWindow {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Identity filters are exact matches. Rows whose timestamp does not
    /// parse are passed through so the cleaner can account for them.
    pub fn matches<R: RawReading>(&self, reading: &R) -> bool {
        if let Some(location) = &self.location {
            if &reading.location_id() != location {
                return false;
            }
        }
        if let Some(module) = &self.module {
            if &reading.module_id() != module {
                return false;
            }
        }
        match reading.timestamp() {
            Some(ts) => ts >= self.start && ts <= self.end,
            None => true,
        }
    }
}

/// Both raw streams, each returned in ingestion order.
pub trait TelemetrySource: Send + Sync {
    fn describe(&self) -> String;

    fn fetch_energy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawCurrentReading>, IngestError>;

    fn fetch_occupancy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawOccupancyReading>, IngestError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTelemetrySource {
    pub energy: Vec<RawCurrentReading>,
    pub occupancy: Vec<RawOccupancyReading>,
}

impl InMemoryTelemetrySource {
    pub fn new(energy: Vec<RawCurrentReading>, occupancy: Vec<RawOccupancyReading>) -> Self {
        Self { energy, occupancy }
    }
}

impl TelemetrySource for InMemoryTelemetrySource {
    fn describe(&self) -> String {
        "in-memory".to_string()
    }

    fn fetch_energy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawCurrentReading>, IngestError> {
        query.validate()?;
        Ok(TelemetryBatch::new(
            self.energy
                .iter()
                .filter(|reading| query.matches(*reading))
                .cloned()
                .collect(),
        ))
    }

    fn fetch_occupancy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawOccupancyReading>, IngestError> {
        query.validate()?;
        Ok(TelemetryBatch::new(
            self.occupancy
                .iter()
                .filter(|reading| query.matches(*reading))
                .cloned()
                .collect(),
        ))
    }
}

/// Directory holding `energy_readings.jsonl` and `occupancy_telemetry.jsonl`
/// exports, one document per line.
#[derive(Debug, Clone)]
pub struct JsonLinesTelemetrySource {
    dir: PathBuf,
}

impl JsonLinesTelemetrySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn stream_path(&self, kind: TelemetryKind) -> PathBuf {
        self.dir.join(format!("{}.jsonl", collection_name(kind)))
    }
}

impl TelemetrySource for JsonLinesTelemetrySource {
    fn describe(&self) -> String {
        format!("jsonl:{}", self.dir.display())
    }

    fn fetch_energy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawCurrentReading>, IngestError> {
        query.validate()?;
        read_json_lines(&self.stream_path(TelemetryKind::Energy), query)
    }

    fn fetch_occupancy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawOccupancyReading>, IngestError> {
        query.validate()?;
        read_json_lines(&self.stream_path(TelemetryKind::Occupancy), query)
    }
}

/// Readings are JSON objects. Scalars and arrays are rejected before serde
/// gets a chance to bind them to fields positionally.
fn decode_document<T: DeserializeOwned>(raw: &str) -> Result<T, DocumentError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(DocumentError::NotAnObject(json_type_name(&value)));
    }
    Ok(serde_json::from_value(value)?)
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn read_json_lines<T>(
    path: &Path,
    query: &TelemetryQuery,
) -> Result<TelemetryBatch<T>, IngestError>
where
    T: DeserializeOwned + RawReading,
{
    let io_err = |source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut out = Vec::new();
    let mut skipped = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_document::<T>(&line) {
            Ok(doc) if query.matches(&doc) => out.push(doc),
            Ok(_) => {}
            Err(err) => {
                skipped += 1;
                warn!(
                    component = "ingest",
                    event = "ingest.document.skipped",
                    path = %path.display(),
                    line = idx + 1,
                    error = %err
                );
            }
        }
    }

    info!(
        component = "ingest",
        event = "ingest.jsonl.read",
        path = %path.display(),
        documents = out.len(),
        skipped_documents = skipped
    );
    Ok(TelemetryBatch {
        documents: out,
        skipped_documents: skipped,
    })
}

/// SQLite document store: one table per stream, JSON payload per row, rowid
/// order is ingestion order.
#[derive(Debug, Clone)]
pub struct SqliteTelemetrySource {
    path: PathBuf,
}

impl SqliteTelemetrySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn create_schema(conn: &Connection) -> Result<(), IngestError> {
        for table in [ENERGY_COLLECTION, OCCUPANCY_COLLECTION] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    payload TEXT NOT NULL
                );"
            ))?;
        }
        Ok(())
    }

    pub fn insert_document(
        conn: &Connection,
        kind: TelemetryKind,
        document: &serde_json::Value,
    ) -> Result<(), IngestError> {
        let payload = serde_json::to_string(document)?;
        conn.execute(
            &format!("INSERT INTO {} (payload) VALUES (?1)", collection_name(kind)),
            params![payload],
        )?;
        Ok(())
    }

    fn fetch<T>(
        &self,
        kind: TelemetryKind,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<T>, IngestError>
    where
        T: DeserializeOwned + RawReading,
    {
        query.validate()?;
        let table = collection_name(kind);
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!("SELECT id, payload FROM {table} ORDER BY id ASC"))?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        let mut skipped = 0u64;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            match decode_document::<T>(&payload) {
                Ok(doc) if query.matches(&doc) => out.push(doc),
                Ok(_) => {}
                Err(err) => {
                    skipped += 1;
                    warn!(
                        component = "ingest",
                        event = "ingest.document.skipped",
                        table = table,
                        id = id,
                        error = %err
                    );
                }
            }
        }

        info!(
            component = "ingest",
            event = "ingest.sqlite.read",
            store_path = %self.path.display(),
            table = table,
            documents = out.len(),
            skipped_documents = skipped
        );
        Ok(TelemetryBatch {
            documents: out,
            skipped_documents: skipped,
        })
    }
}

impl TelemetrySource for SqliteTelemetrySource {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn fetch_energy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawCurrentReading>, IngestError> {
        self.fetch(TelemetryKind::Energy, query)
    }

    fn fetch_occupancy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawOccupancyReading>, IngestError> {
        self.fetch(TelemetryKind::Occupancy, query)
    }
}

fn collection_name(kind: TelemetryKind) -> &'static str {
    match kind {
        TelemetryKind::Energy => ENERGY_COLLECTION,
        TelemetryKind::Occupancy => OCCUPANCY_COLLECTION,
    }
}
