use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use voltguard::{
    augment_config_from_env, augment_dataset_file, dataset_config_from_env, init_logging,
    log_app_start, log_output_written, logging_config_from_env,
};

const APP: &str = "augment_dataset";
const DEFAULT_INPUT: &str = "data/clean_dataset.csv";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(APP, &logging);

    let input = env_path("VOLTGUARD_AUGMENT_INPUT").unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT));
    let output = env_path("VOLTGUARD_AUGMENT_OUTPUT").unwrap_or_else(|| augmented_path(&input));
    let augment_cfg = augment_config_from_env()?;
    let feature_cfg = dataset_config_from_env()?.features;

    println!(
        "Augmenting {} x{} (block size {}, seed {})",
        input.display(),
        augment_cfg.multiplier,
        augment_cfg.block_size,
        augment_cfg.seed
    );

    let metadata = augment_dataset_file(&input, &output, &augment_cfg, &feature_cfg, Utc::now())?;
    log_output_written(APP, "dataset", &output, metadata.num_records as usize);

    for location in &metadata.report.locations {
        println!(
            "{}: {} original + {} synthetic{}",
            location.location,
            location.original_rows,
            location.synthetic_rows,
            if location.resampled_rows {
                " (row resampling)"
            } else {
                ""
            }
        );
    }
    println!(
        "Wrote {} records to {}",
        metadata.num_records,
        output.display()
    );

    Ok(())
}

fn augmented_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    input.with_file_name(format!("{stem}_augmented.csv"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}
