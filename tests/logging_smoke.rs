use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;
use voltguard::{
    assemble_dataset, log_app_start, log_output_written, log_source_selected, DatasetConfig,
    DatasetOutcome, InMemoryTelemetrySource, JsonLinesTelemetrySource, LoggingConfig,
    RawCurrentReading, RawOccupancyReading, TelemetryBatch, TelemetryKind, TelemetryQuery,
    TelemetrySource,
};

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn energy_doc(location: &str, ts: &str, current_a: f64) -> RawCurrentReading {
    serde_json::from_value(json!({
        "module": "M1", "location": location, "current_a": current_a, "received_at": ts
    }))
    .expect("energy document should decode")
}

fn occupancy_doc(location: &str, ts: &str) -> RawOccupancyReading {
    serde_json::from_value(json!({
        "module": "M2", "location": location, "rcwl": 1, "pir": 0,
        "temperature": 22.0, "humidity": 41.0, "received_at": ts
    }))
    .expect("occupancy document should decode")
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().expect("fixed timestamp should be valid")
}

#[test]
fn pipeline_stages_emit_finish_events() {
    let source = InMemoryTelemetrySource::new(
        vec![
            energy_doc("Room A", "2024-01-01T10:00:00Z", 1.5),
            energy_doc("Room A", "2024-01-01T10:05:00Z", 1.7),
        ],
        vec![occupancy_doc("Room A", "2024-01-01T10:01:00Z")],
    );
    let cfg = DatasetConfig {
        augment: Some(Default::default()),
        ..DatasetConfig::default()
    };

    let logs = capture_logs(Level::INFO, || {
        let outcome = assemble_dataset(&source, &cfg, now()).expect("pipeline should succeed");
        assert!(matches!(outcome, DatasetOutcome::Built(_)));
    });

    for event in [
        "dataset.assemble.start",
        "cleaner.energy.finish",
        "cleaner.occupancy.finish",
        "merge.finish",
        "augment.finish",
        "features.build.finish",
        "dataset.assemble.finish",
        "sensor_status.offline",
    ] {
        assert!(
            logs.contains(&format!("\"event\":\"{event}\"")),
            "missing {event} in {logs}"
        );
    }
}

#[test]
fn empty_window_logs_empty_outcome() {
    let source = InMemoryTelemetrySource::default();
    let logs = capture_logs(Level::INFO, || {
        let outcome = assemble_dataset(&source, &DatasetConfig::default(), now())
            .expect("empty sources are not an error");
        assert!(matches!(outcome, DatasetOutcome::Empty { .. }));
    });

    assert!(logs.contains("\"event\":\"dataset.assemble.empty\""));
    assert!(!logs.contains("\"event\":\"features.build.finish\""));
}

struct OccupancyOutage(InMemoryTelemetrySource);

impl TelemetrySource for OccupancyOutage {
    fn describe(&self) -> String {
        "occupancy-outage".to_string()
    }

    fn fetch_energy(
        &self,
        query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawCurrentReading>, voltguard::IngestError> {
        self.0.fetch_energy(query)
    }

    fn fetch_occupancy(
        &self,
        _query: &TelemetryQuery,
    ) -> Result<TelemetryBatch<RawOccupancyReading>, voltguard::IngestError> {
        Err(voltguard::IngestError::InvalidWindow {
            start: now(),
            end: now(),
        })
    }
}

#[test]
fn missing_stream_is_logged_as_partial_source() {
    let source = OccupancyOutage(InMemoryTelemetrySource::new(
        vec![energy_doc("Room A", "2024-01-01T11:50:00Z", 2.0)],
        Vec::new(),
    ));

    let logs = capture_logs(Level::INFO, || {
        let outcome = assemble_dataset(&source, &DatasetConfig::default(), now())
            .expect("one stream is enough");
        assert_eq!(outcome.counts().merged, 1);
    });

    assert!(logs.contains("\"event\":\"dataset.assemble.partial_source\""));
    assert!(logs.contains(TelemetryKind::Occupancy.as_str()));
}

#[test]
fn malformed_jsonl_documents_are_skipped_with_a_warning() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let source = JsonLinesTelemetrySource::new(dir.path());
    std::fs::write(
        source.stream_path(TelemetryKind::Energy),
        "{\"module\":\"M1\",\"location\":\"Room A\",\"current_a\":1.0,\"received_at\":\"2024-01-01T10:00:00Z\"}\nnot json\n[1,2]\n",
    )
    .expect("stream file should be written");

    let logs = capture_logs(Level::INFO, || {
        let query = TelemetryQuery::last_hours(now(), 48);
        let batch = source.fetch_energy(&query).expect("readable file");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.skipped_documents, 2);
    });

    assert!(logs.contains("\"event\":\"ingest.document.skipped\""));
    assert!(logs.contains("\"event\":\"ingest.jsonl.read\""));
    assert!(logs.contains("expected a JSON object, found an array"));
    assert!(logs.contains("\"skipped_documents\":2"));
}

#[test]
fn binary_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("build_dataset", &cfg);
        log_source_selected("build_dataset", "jsonl:data/telemetry", Some("VOLTGUARD_SOURCE_DIR"));
        log_output_written("build_dataset", "dataset", Path::new("data/clean_dataset.csv"), 12);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"source.selected\""));
    assert!(logs.contains("\"event\":\"output.written\""));
    assert!(logs.contains("\"component\":\"build_dataset\""));
}
