//! Last-seen tracking and offline detection per sensor module.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::readings::{EnergyRow, OccupancyRow, TelemetryKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub module: String,
    pub location: String,
    pub kind: TelemetryKind,
    pub last_seen: DateTime<Utc>,
    pub minutes_since_last_seen: i64,
    pub offline: bool,
}

/// One entry per (location, module, stream), ordered by that key. A module is
/// offline when its newest cleaned reading is more than `threshold_minutes`
/// older than `as_of`.
pub fn sensor_status(
    energy: &[EnergyRow],
    occupancy: &[OccupancyRow],
    as_of: DateTime<Utc>,
    threshold_minutes: u32,
) -> Vec<ModuleStatus> {
    let mut last_seen: BTreeMap<(String, String, &'static str), (TelemetryKind, DateTime<Utc>)> =
        BTreeMap::new();

    let observations = energy
        .iter()
        .map(|row| (&row.location, &row.module, TelemetryKind::Energy, row.received_at))
        .chain(
            occupancy
                .iter()
                .map(|row| (&row.location, &row.module, TelemetryKind::Occupancy, row.received_at)),
        );
    for (location, module, kind, ts) in observations {
        last_seen
            .entry((location.clone(), module.clone(), kind.as_str()))
            .and_modify(|(_, seen)| {
                if ts > *seen {
                    *seen = ts;
                }
            })
            .or_insert((kind, ts));
    }

    let statuses: Vec<ModuleStatus> = last_seen
        .into_iter()
        .map(|((location, module, _), (kind, seen))| {
            let minutes_since_last_seen = (as_of - seen).num_minutes().max(0);
            ModuleStatus {
                module,
                location,
                kind,
                last_seen: seen,
                minutes_since_last_seen,
                offline: minutes_since_last_seen > i64::from(threshold_minutes),
            }
        })
        .collect();

    for status in statuses.iter().filter(|status| status.offline) {
        warn!(
            component = "sensor_status",
            event = "sensor_status.offline",
            module = %status.module,
            location = %status.location,
            kind = status.kind.as_str(),
            last_seen = %status.last_seen,
            minutes_since_last_seen = status.minutes_since_last_seen,
            threshold_minutes = threshold_minutes
        );
    }

    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::{CalendarFields, DEFAULT_VOLTAGE_V};
    use chrono::{Duration, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .expect("fixed timestamp should be valid")
    }

    fn energy(module: &str, minutes_ago: i64) -> EnergyRow {
        let ts = as_of() - Duration::minutes(minutes_ago);
        EnergyRow {
            module: module.to_string(),
            location: "Room A".to_string(),
            sensor: None,
            source: None,
            reading_type: None,
            received_at: ts,
            current_ma: Some(1_000.0),
            current_a: Some(1.0),
            rms_a: Some(1.0),
            adc_samples: None,
            vref: None,
            wifi_rssi: None,
            voltage_v: DEFAULT_VOLTAGE_V,
            power_w: Some(230.0),
            power_kwh: Some(0.23),
            calendar: CalendarFields::from_timestamp(ts),
        }
    }

    fn occupancy(module: &str, minutes_ago: i64) -> OccupancyRow {
        let ts = as_of() - Duration::minutes(minutes_ago);
        OccupancyRow {
            module: module.to_string(),
            location: "Room A".to_string(),
            source: None,
            received_at: ts,
            rcwl: 0,
            pir: 0,
            occupied: false,
            temperature: Some(20.0),
            humidity: Some(40.0),
            rssi: None,
            uptime: None,
            heap: None,
            calendar: CalendarFields::from_timestamp(ts),
        }
    }

    #[test]
    fn flags_modules_silent_past_the_threshold() {
        let statuses = sensor_status(
            &[energy("M1", 90), energy("M1", 10), energy("M2", 45)],
            &[occupancy("M3", 31), occupancy("M3", 30)],
            as_of(),
            30,
        );

        assert_eq!(statuses.len(), 3);
        let by_module: BTreeMap<&str, &ModuleStatus> =
            statuses.iter().map(|s| (s.module.as_str(), s)).collect();
        assert!(!by_module["M1"].offline);
        assert_eq!(by_module["M1"].minutes_since_last_seen, 10);
        assert!(by_module["M2"].offline);
        assert!(!by_module["M3"].offline);
        assert_eq!(by_module["M3"].kind, TelemetryKind::Occupancy);
    }

    #[test]
    fn same_module_reports_each_stream_separately() {
        let statuses = sensor_status(&[energy("M1", 5)], &[occupancy("M1", 120)], as_of(), 30);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].kind, TelemetryKind::Energy);
        assert!(!statuses[0].offline);
        assert_eq!(statuses[1].kind, TelemetryKind::Occupancy);
        assert!(statuses[1].offline);
    }
}
