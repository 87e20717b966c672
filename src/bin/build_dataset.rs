use std::env;
use std::path::PathBuf;

use chrono::Utc;
use voltguard::{
    assemble_dataset, dataset_config_from_env, init_logging, log_app_start, log_output_written,
    log_source_selected, logging_config_from_env, write_dataset, DatasetOutcome,
    JsonLinesTelemetrySource, SqliteTelemetrySource, TelemetrySource,
};

const APP: &str = "build_dataset";
const DEFAULT_SOURCE_DIR: &str = "data/telemetry";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(APP, &logging);

    let cfg = dataset_config_from_env()?;
    let source = source_from_env();
    let now = Utc::now();

    println!(
        "Building dataset from {} for the last {} hours (location: {}, module: {})",
        source.describe(),
        cfg.hours_back,
        cfg.location.as_deref().unwrap_or("all"),
        cfg.module.as_deref().unwrap_or("all")
    );

    match assemble_dataset(source.as_ref(), &cfg, now)? {
        DatasetOutcome::Empty {
            counts,
            partial_source,
            ..
        } => {
            println!(
                "No usable telemetry in window: energy input={} occupancy input={}",
                counts.energy_input, counts.occupancy_input
            );
            if let Some(missing) = partial_source {
                println!("{} stream unavailable: {}", missing.stream.as_str(), missing.error);
            }
        }
        DatasetOutcome::Built(dataset) => {
            let written = write_dataset(&dataset, &cfg.output_path)?;
            log_output_written(APP, "dataset", &written.dataset_path, dataset.table.len());
            log_output_written(APP, "cleaned", &written.cleaned_path, dataset.cleaned.len());
            log_output_written(APP, "metadata", &written.metadata_path, 1);

            let counts = &dataset.metadata.counts;
            println!(
                "energy: {} -> {} cleaned, occupancy: {} -> {} cleaned, merged: {}, featured: {}",
                counts.energy_input,
                counts.energy_cleaned,
                counts.occupancy_input,
                counts.occupancy_cleaned,
                counts.merged,
                counts.featured
            );
            if counts.energy_skipped + counts.occupancy_skipped > 0 {
                println!(
                    "skipped undecodable documents: energy {}, occupancy {}",
                    counts.energy_skipped, counts.occupancy_skipped
                );
            }
            if let Some(missing) = &dataset.metadata.partial_source {
                println!("{} stream unavailable: {}", missing.stream.as_str(), missing.error);
            }
            println!(
                "{} feature columns, fingerprint {}",
                dataset.metadata.feature_columns.len(),
                dataset.metadata.schema_fingerprint
            );
            for status in dataset.metadata.sensor_status.iter().filter(|s| s.offline) {
                println!(
                    "OFFLINE {} @ {} ({}): last seen {} ({} min ago)",
                    status.module,
                    status.location,
                    status.kind.as_str(),
                    status.last_seen,
                    status.minutes_since_last_seen
                );
            }
            println!("Wrote {}", written.dataset_path.display());
        }
    }

    Ok(())
}

fn source_from_env() -> Box<dyn TelemetrySource> {
    if let Some(path) = env_path("VOLTGUARD_SOURCE_SQLITE") {
        log_source_selected(APP, "sqlite", Some("VOLTGUARD_SOURCE_SQLITE"));
        return Box::new(SqliteTelemetrySource::new(path));
    }
    match env_path("VOLTGUARD_SOURCE_DIR") {
        Some(dir) => {
            log_source_selected(APP, "jsonl", Some("VOLTGUARD_SOURCE_DIR"));
            Box::new(JsonLinesTelemetrySource::new(dir))
        }
        None => {
            log_source_selected(APP, "jsonl", None);
            Box::new(JsonLinesTelemetrySource::new(DEFAULT_SOURCE_DIR))
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}
