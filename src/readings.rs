//! Telemetry record types shared by every pipeline stage.
//!
//! Raw documents carry loosely typed scalars; coercion into typed values happens
//! here so that the cleaner is the only place that decides what survives.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_VOLTAGE_V: f64 = 230.0;
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

pub const TEMPERATURE_MIN_C: f64 = -10.0;
pub const TEMPERATURE_MAX_C: f64 = 60.0;
pub const HUMIDITY_MIN_PCT: f64 = 0.0;
pub const HUMIDITY_MAX_PCT: f64 = 100.0;
pub const RSSI_MIN_DBM: f64 = -100.0;
pub const RSSI_MAX_DBM: f64 = 0.0;

// Epoch values at or above this magnitude are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryKind {
    Energy,
    Occupancy,
}

impl TelemetryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Occupancy => "occupancy",
        }
    }
}

/// A loosely typed field value as it arrives from a sensor document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScalar {
    Bool(bool),
    Number(f64),
    Text(String),
    ExtendedDate(ExtendedDate),
    Other(serde_json::Value),
}

/// Document-store extended JSON date, e.g. `{"$date": "2024-01-01T10:00:00Z"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedDate {
    #[serde(rename = "$date")]
    pub date: ExtendedDateValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtendedDateValue {
    Millis(i64),
    Text(String),
}

impl RawScalar {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Numeric coercion; anything that is not a finite number becomes `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Bool(flag) => {
                if *flag {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(value) => *value,
            Self::Text(raw) => raw.trim().parse::<f64>().ok()?,
            Self::ExtendedDate(_) | Self::Other(_) => return None,
        };
        value.is_finite().then_some(value)
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Text(raw) => parse_timestamp(raw),
            Self::Number(value) => timestamp_from_epoch(*value),
            Self::ExtendedDate(ExtendedDate { date }) => match date {
                ExtendedDateValue::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
                ExtendedDateValue::Text(raw) => parse_timestamp(raw),
            },
            Self::Bool(_) | Self::Other(_) => None,
        }
    }

    pub fn as_identifier(&self) -> Option<String> {
        match self {
            Self::Text(raw) => {
                let trimmed = raw.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Self::Number(value) if value.fract() == 0.0 => Some(format!("{}", *value as i64)),
            Self::Number(value) => Some(value.to_string()),
            Self::Bool(flag) => Some(flag.to_string()),
            Self::ExtendedDate(_) | Self::Other(_) => None,
        }
    }
}

impl From<f64> for RawScalar {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RawScalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

pub(crate) fn coerce_f64(field: &Option<RawScalar>) -> Option<f64> {
    field.as_ref().and_then(RawScalar::as_f64)
}

pub(crate) fn coerce_identifier(field: &Option<RawScalar>) -> String {
    field
        .as_ref()
        .and_then(RawScalar::as_identifier)
        .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
}

pub(crate) fn coerce_optional_text(field: &Option<RawScalar>) -> Option<String> {
    field.as_ref().and_then(RawScalar::as_identifier)
}

/// Parses RFC 3339, naive `YYYY-MM-DD HH:MM:SS[.fff]` (assumed UTC) and
/// offset-suffixed space-separated timestamps.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    trimmed
        .parse::<f64>()
        .ok()
        .and_then(timestamp_from_epoch)
}

fn timestamp_from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1_000.0
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCurrentReading {
    #[serde(default)]
    pub module: Option<RawScalar>,
    #[serde(default)]
    pub location: Option<RawScalar>,
    #[serde(default)]
    pub sensor: Option<RawScalar>,
    #[serde(default)]
    pub current_ma: Option<RawScalar>,
    #[serde(default)]
    pub current_a: Option<RawScalar>,
    #[serde(default)]
    pub rms_a: Option<RawScalar>,
    #[serde(default)]
    pub adc_samples: Option<RawScalar>,
    #[serde(default)]
    pub vref: Option<RawScalar>,
    #[serde(default)]
    pub wifi_rssi: Option<RawScalar>,
    #[serde(default)]
    pub received_at: Option<RawScalar>,
    #[serde(default)]
    pub source: Option<RawScalar>,
    /// Firmware-reported reading type, e.g. `current`. Carried for audit.
    #[serde(default, rename = "type")]
    pub reading_type: Option<RawScalar>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOccupancyReading {
    #[serde(default)]
    pub module: Option<RawScalar>,
    #[serde(default)]
    pub location: Option<RawScalar>,
    #[serde(default)]
    pub rcwl: Option<RawScalar>,
    #[serde(default)]
    pub pir: Option<RawScalar>,
    #[serde(default)]
    pub temperature: Option<RawScalar>,
    #[serde(default)]
    pub humidity: Option<RawScalar>,
    #[serde(default)]
    pub rssi: Option<RawScalar>,
    #[serde(default)]
    pub uptime: Option<RawScalar>,
    #[serde(default)]
    pub heap: Option<RawScalar>,
    #[serde(default)]
    pub received_at: Option<RawScalar>,
    #[serde(default)]
    pub source: Option<RawScalar>,
}

/// Identity accessors used by the ingestion filters.
pub trait RawReading {
    fn module_id(&self) -> String;
    fn location_id(&self) -> String;
    fn timestamp(&self) -> Option<DateTime<Utc>>;
}

impl RawReading for RawCurrentReading {
    fn module_id(&self) -> String {
        coerce_identifier(&self.module)
    }

    fn location_id(&self) -> String {
        coerce_identifier(&self.location)
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.received_at.as_ref().and_then(RawScalar::as_timestamp)
    }
}

impl RawReading for RawOccupancyReading {
    fn module_id(&self) -> String {
        coerce_identifier(&self.module)
    }

    fn location_id(&self) -> String {
        coerce_identifier(&self.location)
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.received_at.as_ref().and_then(RawScalar::as_timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFields {
    pub hour: u32,
    /// 0 = Monday.
    pub day_of_week: u32,
    pub is_weekend: bool,
}

impl CalendarFields {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        let day_of_week = ts.weekday().num_days_from_monday();
        Self {
            hour: ts.hour(),
            day_of_week,
            is_weekend: day_of_week >= 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyRow {
    pub module: String,
    pub location: String,
    pub sensor: Option<String>,
    pub source: Option<String>,
    pub reading_type: Option<String>,
    pub received_at: DateTime<Utc>,
    pub current_ma: Option<f64>,
    pub current_a: Option<f64>,
    pub rms_a: Option<f64>,
    pub adc_samples: Option<f64>,
    pub vref: Option<f64>,
    pub wifi_rssi: Option<f64>,
    pub voltage_v: f64,
    pub power_w: Option<f64>,
    pub power_kwh: Option<f64>,
    pub calendar: CalendarFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyRow {
    pub module: String,
    pub location: String,
    pub source: Option<String>,
    pub received_at: DateTime<Utc>,
    pub rcwl: u8,
    pub pir: u8,
    pub occupied: bool,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub rssi: Option<f64>,
    pub uptime: Option<f64>,
    pub heap: Option<f64>,
    pub calendar: CalendarFields,
}

/// Column order of a merged row in every tabular export.
pub const MERGED_COLUMNS: [&str; 24] = [
    "received_at",
    "module",
    "location",
    "sensor",
    "source",
    "type",
    "current_ma",
    "current_a",
    "rms_a",
    "adc_samples",
    "vref",
    "wifi_rssi",
    "voltage_v",
    "power_w",
    "power_kwh",
    "rcwl",
    "pir",
    "occupied",
    "temperature",
    "humidity",
    "occupancy_received_at",
    "hour",
    "day_of_week",
    "is_weekend",
];

/// Energy-side row with the occupancy fields attached by the merger.
///
/// Occupancy-only datasets reuse the same shape with every energy field null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRow {
    pub module: String,
    pub location: String,
    pub sensor: Option<String>,
    pub source: Option<String>,
    pub reading_type: Option<String>,
    pub received_at: DateTime<Utc>,
    pub current_ma: Option<f64>,
    pub current_a: Option<f64>,
    pub rms_a: Option<f64>,
    pub adc_samples: Option<f64>,
    pub vref: Option<f64>,
    pub wifi_rssi: Option<f64>,
    pub voltage_v: Option<f64>,
    pub power_w: Option<f64>,
    pub power_kwh: Option<f64>,
    pub rcwl: Option<u8>,
    pub pir: Option<u8>,
    pub occupied: Option<bool>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub occupancy_received_at: Option<DateTime<Utc>>,
    pub calendar: CalendarFields,
}

impl MergedRow {
    pub fn from_energy(row: &EnergyRow) -> Self {
        Self {
            module: row.module.clone(),
            location: row.location.clone(),
            sensor: row.sensor.clone(),
            source: row.source.clone(),
            reading_type: row.reading_type.clone(),
            received_at: row.received_at,
            current_ma: row.current_ma,
            current_a: row.current_a,
            rms_a: row.rms_a,
            adc_samples: row.adc_samples,
            vref: row.vref,
            wifi_rssi: row.wifi_rssi,
            voltage_v: Some(row.voltage_v),
            power_w: row.power_w,
            power_kwh: row.power_kwh,
            rcwl: None,
            pir: None,
            occupied: None,
            temperature: None,
            humidity: None,
            occupancy_received_at: None,
            calendar: row.calendar,
        }
    }

    pub fn from_occupancy(row: &OccupancyRow) -> Self {
        let mut merged = Self {
            module: row.module.clone(),
            location: row.location.clone(),
            sensor: None,
            source: row.source.clone(),
            reading_type: None,
            received_at: row.received_at,
            current_ma: None,
            current_a: None,
            rms_a: None,
            adc_samples: None,
            vref: None,
            wifi_rssi: None,
            voltage_v: None,
            power_w: None,
            power_kwh: None,
            rcwl: None,
            pir: None,
            occupied: None,
            temperature: None,
            humidity: None,
            occupancy_received_at: None,
            calendar: row.calendar,
        };
        merged.attach_occupancy(row);
        merged
    }

    pub fn attach_occupancy(&mut self, row: &OccupancyRow) {
        self.rcwl = Some(row.rcwl);
        self.pir = Some(row.pir);
        self.occupied = Some(row.occupied);
        self.temperature = row.temperature;
        self.humidity = row.humidity;
        self.occupancy_received_at = Some(row.received_at);
    }

    /// Numeric view of a base column; text and timestamp columns yield `None`.
    pub fn numeric_value(&self, column: &str) -> Option<f64> {
        match column {
            "current_ma" => self.current_ma,
            "current_a" => self.current_a,
            "rms_a" => self.rms_a,
            "adc_samples" => self.adc_samples,
            "vref" => self.vref,
            "wifi_rssi" => self.wifi_rssi,
            "voltage_v" => self.voltage_v,
            "power_w" => self.power_w,
            "power_kwh" => self.power_kwh,
            "rcwl" => self.rcwl.map(f64::from),
            "pir" => self.pir.map(f64::from),
            "occupied" => self.occupied.map(|flag| if flag { 1.0 } else { 0.0 }),
            "temperature" => self.temperature,
            "humidity" => self.humidity,
            "hour" => Some(f64::from(self.calendar.hour)),
            "day_of_week" => Some(f64::from(self.calendar.day_of_week)),
            "is_weekend" => Some(if self.calendar.is_weekend { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn refresh_calendar(&mut self) {
        self.calendar = CalendarFields::from_timestamp(self.received_at);
    }

    /// Re-applies the physical envelope to a row that may have been perturbed
    /// after cleaning. Values are clamped rather than nulled.
    pub fn enforce_physical_constraints(&mut self) {
        if let Some(current_a) = self.current_a {
            let clamped = current_a.max(0.0);
            self.current_a = Some(clamped);
            self.current_ma = Some(clamped * 1_000.0);
        }
        if let Some(rms_a) = self.rms_a {
            self.rms_a = Some(rms_a.max(0.0));
        }

        if self.voltage_v.is_none() && self.current_a.is_some() {
            self.voltage_v = Some(self.vref.unwrap_or(DEFAULT_VOLTAGE_V));
        }
        if let (Some(current_a), Some(voltage_v)) = (self.current_a, self.voltage_v) {
            let power_w = current_a * voltage_v;
            self.power_w = Some(power_w);
            self.power_kwh = Some(power_w / 1_000.0);
        }

        self.temperature = self
            .temperature
            .map(|t| t.clamp(TEMPERATURE_MIN_C, TEMPERATURE_MAX_C));
        self.humidity = self
            .humidity
            .map(|h| h.clamp(HUMIDITY_MIN_PCT, HUMIDITY_MAX_PCT));
        self.wifi_rssi = self.wifi_rssi.map(|r| r.clamp(RSSI_MIN_DBM, RSSI_MAX_DBM));

        self.rcwl = self.rcwl.map(|flag| flag.min(1));
        self.pir = self.pir.map(|flag| flag.min(1));
        if self.rcwl.is_some() || self.pir.is_some() {
            self.occupied = Some(self.rcwl == Some(1) || self.pir == Some(1));
        }
    }
}

/// Binary sensor flag: null → 0, clamp to [0, 1], fractional values truncate.
pub(crate) fn binary_flag(value: Option<f64>) -> u8 {
    match value {
        Some(v) if v >= 1.0 => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_numbers_text_and_booleans() {
        assert_eq!(RawScalar::from(5.5).as_f64(), Some(5.5));
        assert_eq!(RawScalar::text(" 12.25 ").as_f64(), Some(12.25));
        assert_eq!(RawScalar::Bool(true).as_f64(), Some(1.0));
        assert_eq!(RawScalar::text("garbage").as_f64(), None);
        assert_eq!(RawScalar::text("NaN").as_f64(), None);
        assert_eq!(RawScalar::Other(serde_json::json!([1, 2])).as_f64(), None);
    }

    #[test]
    fn parses_supported_timestamp_shapes() {
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .single()
            .expect("fixed timestamp should be valid");

        assert_eq!(parse_timestamp("2024-01-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 10:00:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 10:00:00.000"), Some(expected));
        assert_eq!(parse_timestamp("1704103200"), Some(expected));
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp("   "), None);
    }

    #[test]
    fn decodes_extended_json_dates_and_epochs() {
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .single()
            .expect("fixed timestamp should be valid");
        let doc: RawCurrentReading = serde_json::from_str(
            r#"{"module":"M1","location":"Room A","received_at":{"$date":"2024-01-01T10:00:00Z"}}"#,
        )
        .expect("document should decode");
        assert_eq!(doc.timestamp(), Some(expected));

        let doc: RawCurrentReading =
            serde_json::from_str(r#"{"received_at":1704103200000,"current_a":"oops"}"#)
                .expect("document should decode");
        assert_eq!(doc.timestamp(), Some(expected));
        assert_eq!(doc.module_id(), UNKNOWN_IDENTIFIER);
        assert_eq!(coerce_f64(&doc.current_a), None);
    }

    #[test]
    fn type_field_maps_to_reading_type() {
        let doc: RawCurrentReading =
            serde_json::from_str(r#"{"type":"current","current_a":1.5}"#)
                .expect("document should decode");
        assert_eq!(doc.reading_type, Some(RawScalar::text("current")));

        let encoded = serde_json::to_value(&doc).expect("document should encode");
        assert_eq!(encoded["type"], "current");
        assert!(encoded.get("reading_type").is_none());
    }

    #[test]
    fn unexpected_payload_shapes_do_not_fail_deserialization() {
        let doc: RawOccupancyReading = serde_json::from_str(
            r#"{"module":7,"location":"Lab","rcwl":{"nested":true},"pir":[1],"received_at":"2024-01-01T10:00:00Z"}"#,
        )
        .expect("document should decode");
        assert_eq!(doc.module_id(), "7");
        assert_eq!(coerce_f64(&doc.rcwl), None);
        assert_eq!(coerce_f64(&doc.pir), None);
    }

    #[test]
    fn calendar_fields_use_monday_as_day_zero() {
        // 2024-01-06 is a Saturday.
        let ts = Utc
            .with_ymd_and_hms(2024, 1, 6, 23, 59, 0)
            .single()
            .expect("fixed timestamp should be valid");
        let cal = CalendarFields::from_timestamp(ts);
        assert_eq!(cal.hour, 23);
        assert_eq!(cal.day_of_week, 5);
        assert!(cal.is_weekend);
    }

    #[test]
    fn physical_constraints_clamp_and_rederive_power() {
        let ts = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .single()
            .expect("fixed timestamp should be valid");
        let mut row = MergedRow {
            module: "M1".to_string(),
            location: "Room A".to_string(),
            sensor: None,
            source: None,
            reading_type: None,
            received_at: ts,
            current_ma: Some(1.0),
            current_a: Some(-0.5),
            rms_a: Some(-1.0),
            adc_samples: None,
            vref: None,
            wifi_rssi: Some(-130.0),
            voltage_v: None,
            power_w: Some(99.0),
            power_kwh: Some(0.099),
            rcwl: Some(3),
            pir: Some(0),
            occupied: Some(false),
            temperature: Some(75.0),
            humidity: Some(-4.0),
            occupancy_received_at: Some(ts),
            calendar: CalendarFields::from_timestamp(ts),
        };

        row.enforce_physical_constraints();

        assert_eq!(row.current_a, Some(0.0));
        assert_eq!(row.current_ma, Some(0.0));
        assert_eq!(row.rms_a, Some(0.0));
        assert_eq!(row.voltage_v, Some(DEFAULT_VOLTAGE_V));
        assert_eq!(row.power_w, Some(0.0));
        assert_eq!(row.wifi_rssi, Some(RSSI_MIN_DBM));
        assert_eq!(row.temperature, Some(TEMPERATURE_MAX_C));
        assert_eq!(row.humidity, Some(HUMIDITY_MIN_PCT));
        assert_eq!(row.rcwl, Some(1));
        assert_eq!(row.occupied, Some(true));
    }

    #[test]
    fn binary_flag_truncates_fractions_and_defaults_to_zero() {
        assert_eq!(binary_flag(None), 0);
        assert_eq!(binary_flag(Some(0.7)), 0);
        assert_eq!(binary_flag(Some(1.0)), 1);
        assert_eq!(binary_flag(Some(4.0)), 1);
        assert_eq!(binary_flag(Some(-2.0)), 0);
    }
}
