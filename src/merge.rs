//! Time-window join of the cleaned energy and occupancy streams.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::readings::{EnergyRow, MergedRow, OccupancyRow};

pub const DEFAULT_MERGE_WINDOW_MINUTES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Closest occupancy reading within one window either side.
    Nearest,
    /// Latest occupancy reading at or before the energy timestamp.
    ForwardFill,
}

impl JoinPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::ForwardFill => "forward_fill",
        }
    }
}

impl FromStr for JoinPolicy {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "forward_fill" | "forward-fill" | "ffill" => Ok(Self::ForwardFill),
            _ => Err(ConfigError::UnknownJoinPolicy(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub window_minutes: u32,
    pub policy: JoinPolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_MERGE_WINDOW_MINUTES,
            policy: JoinPolicy::Nearest,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_minutes == 0 {
            return Err(ConfigError::NonPositive {
                name: "merge.window_minutes",
            });
        }
        Ok(())
    }

    fn window_ms(&self) -> i64 {
        i64::from(self.window_minutes) * 60_000
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub energy_rows: u64,
    pub occupancy_rows: u64,
    pub matched_bucket: u64,
    pub matched_nearest: u64,
    pub matched_forward_fill: u64,
    pub unmatched: u64,
    pub occupancy_only_locations: Vec<String>,
    pub output_rows: u64,
}

/// Joins occupancy fields onto energy rows location by location.
///
/// When the energy stream is empty the occupancy rows are passed through
/// with null energy fields instead, so a dataset can still be built from the
/// stream that is available. Output is ordered by (location, timestamp).
pub fn merge(
    energy: &[EnergyRow],
    occupancy: &[OccupancyRow],
    cfg: &MergeConfig,
) -> Result<(Vec<MergedRow>, MergeReport), ConfigError> {
    cfg.validate()?;

    let mut report = MergeReport {
        energy_rows: energy.len() as u64,
        occupancy_rows: occupancy.len() as u64,
        ..MergeReport::default()
    };

    if energy.is_empty() {
        let mut rows: Vec<MergedRow> = occupancy.iter().map(MergedRow::from_occupancy).collect();
        rows.sort_by(|a, b| {
            (&a.location, a.received_at, &a.module).cmp(&(&b.location, b.received_at, &b.module))
        });
        report.output_rows = rows.len() as u64;
        if !rows.is_empty() {
            warn!(
                component = "merge",
                event = "merge.occupancy_only",
                occupancy_rows = report.occupancy_rows
            );
        }
        log_merge_finish(cfg, &report);
        return Ok((rows, report));
    }

    let energy_by_location = partition_by_location(energy, |row| &row.location);
    let occupancy_by_location = partition_by_location(occupancy, |row| &row.location);

    let energy_locations: BTreeSet<&str> = energy_by_location.keys().copied().collect();
    report.occupancy_only_locations = occupancy_by_location
        .keys()
        .filter(|location| !energy_locations.contains(*location))
        .map(|location| location.to_string())
        .collect();

    let mut merged = Vec::with_capacity(energy.len());
    for (location, mut energy_rows) in energy_by_location {
        energy_rows.sort_by(|a, b| (a.received_at, &a.module).cmp(&(b.received_at, &b.module)));
        let mut candidates = occupancy_by_location
            .get(location)
            .cloned()
            .unwrap_or_default();
        candidates.sort_by_key(|row| row.received_at);
        let index = OccupancyIndex::new(&candidates, cfg.window_ms());

        for row in energy_rows {
            let mut out = MergedRow::from_energy(row);
            match index.resolve(row.received_at, cfg.policy) {
                Some((matched, MatchKind::Bucket)) => {
                    report.matched_bucket += 1;
                    out.attach_occupancy(matched);
                }
                Some((matched, MatchKind::Nearest)) => {
                    report.matched_nearest += 1;
                    out.attach_occupancy(matched);
                }
                Some((matched, MatchKind::ForwardFill)) => {
                    report.matched_forward_fill += 1;
                    out.attach_occupancy(matched);
                }
                None => report.unmatched += 1,
            }
            merged.push(out);
        }
    }

    report.output_rows = merged.len() as u64;
    log_merge_finish(cfg, &report);
    Ok((merged, report))
}

/// Rounds to the nearest multiple of `window_ms`; exact midpoints round up.
pub fn bucket_of(ts: DateTime<Utc>, window_ms: i64) -> i64 {
    (ts.timestamp_millis() + window_ms / 2).div_euclid(window_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Bucket,
    Nearest,
    ForwardFill,
}

struct OccupancyIndex<'a> {
    rows: &'a [&'a OccupancyRow],
    buckets: BTreeMap<i64, Vec<usize>>,
    window_ms: i64,
}

impl<'a> OccupancyIndex<'a> {
    fn new(rows: &'a [&'a OccupancyRow], window_ms: i64) -> Self {
        let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (idx, row) in rows.iter().enumerate() {
            buckets
                .entry(bucket_of(row.received_at, window_ms))
                .or_default()
                .push(idx);
        }
        Self {
            rows,
            buckets,
            window_ms,
        }
    }

    fn resolve(
        &self,
        ts: DateTime<Utc>,
        policy: JoinPolicy,
    ) -> Option<(&'a OccupancyRow, MatchKind)> {
        if let Some(row) = self.bucket_match(ts) {
            return Some((row, MatchKind::Bucket));
        }
        match policy {
            JoinPolicy::Nearest => self
                .nearest_within_window(ts)
                .map(|row| (row, MatchKind::Nearest)),
            JoinPolicy::ForwardFill => self
                .latest_at_or_before(ts)
                .map(|row| (row, MatchKind::ForwardFill)),
        }
    }

    fn bucket_match(&self, ts: DateTime<Utc>) -> Option<&'a OccupancyRow> {
        let members = self.buckets.get(&bucket_of(ts, self.window_ms))?;
        // Members are in time order, so min_by_key keeps the earlier row on ties.
        members
            .iter()
            .map(|&idx| self.rows[idx])
            .min_by_key(|row| distance_ms(row.received_at, ts))
    }

    fn nearest_within_window(&self, ts: DateTime<Utc>) -> Option<&'a OccupancyRow> {
        let split = self.rows.partition_point(|row| row.received_at <= ts);
        let before = split.checked_sub(1).map(|idx| self.rows[idx]);
        let after = self.rows.get(split).copied();

        let best = match (before, after) {
            (Some(b), Some(a)) => {
                if distance_ms(a.received_at, ts) < distance_ms(b.received_at, ts) {
                    a
                } else {
                    b
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        (distance_ms(best.received_at, ts) <= self.window_ms).then_some(best)
    }

    fn latest_at_or_before(&self, ts: DateTime<Utc>) -> Option<&'a OccupancyRow> {
        let split = self.rows.partition_point(|row| row.received_at <= ts);
        split.checked_sub(1).map(|idx| self.rows[idx])
    }
}

fn distance_ms(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (a.timestamp_millis() - b.timestamp_millis()).abs()
}

fn partition_by_location<'a, T>(
    rows: &'a [T],
    location: impl Fn(&'a T) -> &'a String,
) -> BTreeMap<&'a str, Vec<&'a T>> {
    let mut partitions: BTreeMap<&'a str, Vec<&'a T>> = BTreeMap::new();
    for row in rows {
        partitions.entry(location(row).as_str()).or_default().push(row);
    }
    partitions
}

fn log_merge_finish(cfg: &MergeConfig, report: &MergeReport) {
    info!(
        component = "merge",
        event = "merge.finish",
        policy = cfg.policy.as_str(),
        window_minutes = cfg.window_minutes,
        energy_rows = report.energy_rows,
        occupancy_rows = report.occupancy_rows,
        matched_bucket = report.matched_bucket,
        matched_nearest = report.matched_nearest,
        matched_forward_fill = report.matched_forward_fill,
        unmatched = report.unmatched,
        occupancy_only_locations = ?report.occupancy_only_locations,
        output_rows = report.output_rows
    );
}
