//! VoltGuard telemetry dataset pipeline.
//!
//! Raw energy and occupancy readings go through cleaning, a time-window
//! merge and feature engineering, and come out as an ML-ready CSV with
//! metadata. An offline augmentor grows existing datasets by block bootstrap.

mod augment;
mod cleaner;
mod config;
mod dataset;
mod features;
mod ingest;
mod merge;
mod observability;
mod readings;
mod sensor_status;

pub use augment::{
    augment, synthetic_target, AugmentConfig, AugmentReport, LocationAugmentation, NoiseConfig,
    BOOTSTRAP_SHIFT_DAYS, DEFAULT_AUGMENT_MULTIPLIER, DEFAULT_AUGMENT_SEED, DEFAULT_BLOCK_SIZE,
};
pub use cleaner::{
    iqr_bounds, CleanReport, CleanerConfig, EnergySummary, OccupancySummary, ReadingCleaner,
    LENIENT_IQR_MULTIPLIER, STRICT_IQR_MULTIPLIER,
};
pub use config::{
    augment_config_from_env, dataset_config_from_env, ConfigError, DatasetConfig,
    DEFAULT_HOURS_BACK, DEFAULT_OFFLINE_THRESHOLD_MINUTES, MAX_HOURS_BACK,
};
pub use dataset::{
    assemble_dataset, augment_dataset_file, metadata_path_for, read_dataset_csv,
    write_dataset, write_feature_csv, write_merged_csv, AugmentationMetadata, Dataset,
    DatasetError, DatasetMetadata, DatasetOutcome, QueryWindow, StageCounts, SummaryStatistics,
    UnavailableStream, WrittenDataset,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, create_all_features, feature_column_names,
    FeatureColumn, FeatureConfig, FeatureDType, FeatureSchema, FeatureTable, FeaturedRow,
    RollingWindow, SchemaError, ADAPTIVE_WINDOW_CAP, EXCLUDED_COLUMNS, FEATURE_SCHEMA_VERSION,
    FIXED_WINDOW_SIZE, LOCATION_FEATURE_COLUMNS,
};
pub use ingest::{
    IngestError, InMemoryTelemetrySource, JsonLinesTelemetrySource, SqliteTelemetrySource,
    TelemetryBatch, TelemetryQuery, TelemetrySource, ENERGY_COLLECTION, OCCUPANCY_COLLECTION,
};
pub use merge::{
    bucket_of, merge, JoinPolicy, MergeConfig, MergeReport, DEFAULT_MERGE_WINDOW_MINUTES,
};
pub use observability::{
    init_logging, log_app_start, log_output_written, log_source_selected,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use readings::{
    parse_timestamp, CalendarFields, EnergyRow, ExtendedDate, ExtendedDateValue, MergedRow,
    OccupancyRow, RawCurrentReading, RawOccupancyReading, RawReading, RawScalar, TelemetryKind,
    DEFAULT_VOLTAGE_V, HUMIDITY_MAX_PCT, HUMIDITY_MIN_PCT, MERGED_COLUMNS, RSSI_MAX_DBM,
    RSSI_MIN_DBM, TEMPERATURE_MAX_C, TEMPERATURE_MIN_C, UNKNOWN_IDENTIFIER,
};
pub use sensor_status::{sensor_status, ModuleStatus};
