use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;
use voltguard::{
    assert_schema_compatible, build_feature_schema, create_all_features, read_dataset_csv,
    write_feature_csv, CalendarFields, FeatureConfig, MergedRow, RollingWindow, SchemaError,
    DEFAULT_VOLTAGE_V, EXCLUDED_COLUMNS, FEATURE_SCHEMA_VERSION, LOCATION_FEATURE_COLUMNS,
};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).single().expect("fixed timestamp should be valid")
}

fn row(
    location: &str,
    module: &str,
    minutes: i64,
    current_a: Option<f64>,
    occupied: bool,
) -> MergedRow {
    let ts = start() + Duration::minutes(minutes);
    let power_w = current_a.map(|a| a * DEFAULT_VOLTAGE_V);
    MergedRow {
        module: module.to_string(),
        location: location.to_string(),
        sensor: None,
        source: Some("esp32".to_string()),
        reading_type: Some("current".to_string()),
        received_at: ts,
        current_ma: current_a.map(|a| a * 1_000.0),
        current_a,
        rms_a: current_a,
        adc_samples: None,
        vref: None,
        wifi_rssi: Some(-58.0),
        voltage_v: Some(DEFAULT_VOLTAGE_V),
        power_w,
        power_kwh: power_w.map(|w| w / 1_000.0),
        rcwl: Some(u8::from(occupied)),
        pir: Some(0),
        occupied: Some(occupied),
        temperature: Some(21.0 + minutes as f64 * 0.05),
        humidity: Some(40.0),
        occupancy_received_at: Some(ts),
        calendar: CalendarFields::from_timestamp(ts),
    }
}

fn two_room_rows() -> Vec<MergedRow> {
    let mut rows = Vec::new();
    for i in 0..16 {
        let current = if i == 7 { None } else { Some(0.5 + i as f64 * 0.125) };
        rows.push(row("Room A", "M1", i * 5, current, i % 4 != 0));
    }
    for i in 0..6 {
        rows.push(row("Lab", "M7", i * 5 + 1, Some(3.0 - i as f64 * 0.25), i >= 3));
    }
    rows
}

#[test]
fn schema_order_and_fingerprint_are_deterministic() {
    let cfg = FeatureConfig::default();
    let engineered: Vec<String> = LOCATION_FEATURE_COLUMNS
        .iter()
        .map(|name| name.to_string())
        .collect();

    let schema_a = build_feature_schema(&engineered, &cfg);
    let schema_b = build_feature_schema(&engineered, &cfg);

    assert_eq!(schema_a.version, FEATURE_SCHEMA_VERSION);
    assert_eq!(schema_a.columns.len(), 13 + LOCATION_FEATURE_COLUMNS.len());
    assert_eq!(schema_a.columns[0].name, "current_a");
    assert_eq!(schema_a.columns[1].name, "rms_a");
    assert_eq!(schema_a.columns[12].name, "is_weekend");
    assert_eq!(schema_a.columns[13].name, "month");
    assert_eq!(schema_a.columns[36].name, "daily_occupancy_rate");
    assert_eq!(schema_a, schema_b);
    let sha256_hex = Regex::new(r"^[0-9a-f]{64}$").expect("regex should compile");
    assert!(sha256_hex.is_match(&schema_a.fingerprint));
    for excluded in EXCLUDED_COLUMNS {
        assert!(!schema_a.column_names().iter().any(|name| name == excluded));
    }

    let fixed = FeatureConfig {
        rolling_window: RollingWindow::Fixed { size: 12 },
        ..FeatureConfig::default()
    };
    assert_ne!(
        build_feature_schema(&engineered, &fixed).fingerprint,
        schema_a.fingerprint
    );
}

#[test]
fn schema_compatibility_checks_version_then_fingerprint() {
    let table = create_all_features(&two_room_rows(), &FeatureConfig::default())
        .expect("features should build");
    let schema = &table.schema;

    assert_eq!(
        assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, schema),
        Ok(())
    );
    assert!(matches!(
        assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &schema.fingerprint, schema),
        Err(SchemaError::VersionMismatch { .. })
    ));
    assert!(matches!(
        assert_schema_compatible(FEATURE_SCHEMA_VERSION, "deadbeef", schema),
        Err(SchemaError::FingerprintMismatch { .. })
    ));
}

#[test]
fn transform_is_deterministic_and_partitions_by_location() {
    let rows = two_room_rows();
    let cfg = FeatureConfig::default();

    let table_a = create_all_features(&rows, &cfg).expect("features should build");
    let mut shuffled = rows.clone();
    shuffled.reverse();
    let table_b = create_all_features(&shuffled, &cfg).expect("features should build");
    assert_eq!(table_a, table_b);

    assert_eq!(table_a.len(), rows.len());
    // Location partitions are ordered by name, so the lab rows come first.
    assert_eq!(table_a.rows[0].base.location, "Lab");
    assert_eq!(table_a.rows[6].base.location, "Room A");

    // Lags never reach across the partition boundary.
    assert_eq!(table_a.value(6, "current_a_lag_1"), table_a.value(6, "current_a"));
    assert_eq!(table_a.value(7, "current_a_lag_1"), table_a.value(6, "current_a"));
    assert_eq!(table_a.value(6, "power_w_change"), Some(0.0));

    for idx in 0..table_a.len() {
        let vector = table_a.feature_vector(idx);
        assert_eq!(vector.len(), table_a.schema.columns.len());
        let hour_sin = table_a.value(idx, "hour_sin").expect("feature value should be present");
        let hour_cos = table_a.value(idx, "hour_cos").expect("feature value should be present");
        assert!((hour_sin * hour_sin + hour_cos * hour_cos - 1.0).abs() < 1e-9);
        assert_eq!(table_a.value(idx, "month"), Some(3.0));
    }
}

#[test]
fn features_are_idempotent_through_the_csv_export() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let first_path = dir.path().join("first.csv");
    let second_path = dir.path().join("second.csv");
    let cfg = FeatureConfig::default();

    let table = create_all_features(&two_room_rows(), &cfg).expect("features should build");
    write_feature_csv(&first_path, &table).expect("csv should be written");

    let reread = read_dataset_csv(&first_path).expect("csv should parse");
    let table_again = create_all_features(&reread, &cfg).expect("features should build");
    assert_eq!(table_again, table);

    write_feature_csv(&second_path, &table_again).expect("csv should be written");
    assert_eq!(
        std::fs::read(&first_path).expect("file should be readable"),
        std::fs::read(&second_path).expect("file should be readable")
    );
}
