use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::db::models::{Quantity, Reading};

/// How long readings are kept per sensor.
pub const RETENTION_DAYS: i64 = 30;

/// Per-sensor time series of readings, ascending by timestamp.
///
/// No two entries of a series share a timestamp, and no entry is older than
/// [`RETENTION_DAYS`] relative to the `now` of the latest append.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    series: HashMap<String, Vec<Reading>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty series for `sensor_id` unless one exists.
    pub fn init(&mut self, sensor_id: &str) {
        self.series.entry(sensor_id.to_owned()).or_default();
    }

    /// Replace the series for `sensor_id` with a previously persisted one.
    pub fn restore(&mut self, sensor_id: &str, mut readings: Vec<Reading>) {
        readings.sort_by_key(|r| r.timestamp);
        readings.dedup_by_key(|r| r.timestamp);
        self.series.insert(sensor_id.to_owned(), readings);
    }

    /// Insert `reading` in timestamp order, then evict everything older than
    /// `now - RETENTION_DAYS`.
    ///
    /// A reading with the same timestamp as an existing entry replaces it.
    pub fn append(&mut self, sensor_id: &str, reading: Reading, now: DateTime<Utc>) {
        let series = self.series.entry(sensor_id.to_owned()).or_default();
        match series.binary_search_by_key(&reading.timestamp, |r| r.timestamp) {
            Ok(i) => series[i] = reading,
            Err(i) => series.insert(i, reading),
        }

        let cutoff = now - Duration::days(RETENTION_DAYS);
        let stale = series.partition_point(|r| r.timestamp < cutoff);
        series.drain(..stale);
    }

    /// Entries with `timestamp >= now - days`, ascending. Unknown sensors yield
    /// an empty vector.
    pub fn query(&self, sensor_id: &str, days: i64, now: DateTime<Utc>) -> Vec<Reading> {
        let Some(series) = self.series.get(sensor_id) else {
            return Vec::new();
        };
        let cutoff = now - Duration::days(days);
        let start = series.partition_point(|r| r.timestamp < cutoff);
        series[start..].to_vec()
    }

    pub fn latest(&self, sensor_id: &str) -> Option<&Reading> {
        self.series.get(sensor_id).and_then(|s| s.last())
    }

    pub fn series(&self, sensor_id: &str) -> &[Reading] {
        self.series.get(sensor_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty_for(&self, sensor_id: &str) -> bool {
        self.series(sensor_id).is_empty()
    }

    /// Drop the series for `sensor_id` entirely.
    pub fn remove(&mut self, sensor_id: &str) {
        self.series.remove(sensor_id);
    }

    pub fn contains(&self, sensor_id: &str) -> bool {
        self.series.contains_key(sensor_id)
    }
}

/// Reduce `series` to at most `target_points` points for charting.
///
/// Each chunk of `ceil(len / target_points)` readings collapses to one point
/// stamped with the chunk's middle timestamp. Values are averaged with
/// triangular weights peaking at the chunk center.
pub fn downsample(series: &[Reading], target_points: usize) -> Vec<Reading> {
    if target_points == 0 || series.len() <= target_points {
        return series.to_vec();
    }
    let chunk_size = series.len().div_ceil(target_points);
    series.chunks(chunk_size).map(collapse_chunk).collect()
}

fn collapse_chunk(chunk: &[Reading]) -> Reading {
    let weights = triangular_weights(chunk.len());
    let middle = &chunk[chunk.len() / 2];

    let mut point = Reading {
        timestamp: middle.timestamp,
        sensor_id: middle.sensor_id.clone(),
        temperature: None,
        moisture: None,
        battery: weighted_mean(chunk.iter().map(|r| Some(r.battery)), &weights)
            .unwrap_or(middle.battery),
    };
    for q in Quantity::ALL {
        point.set_value(q, weighted_mean(chunk.iter().map(|r| r.value(q)), &weights));
    }
    point
}

/// Weights decaying linearly from 1 at the center toward 0 past the edges.
fn triangular_weights(n: usize) -> Vec<f64> {
    let center = (n as f64 - 1.0) / 2.0;
    let half = n as f64 / 2.0;
    (0..n)
        .map(|i| 1.0 - (i as f64 - center).abs() / half)
        .collect()
}

/// Weighted mean over the present values; `None` when none are present.
fn weighted_mean(values: impl Iterator<Item = Option<f64>>, weights: &[f64]) -> Option<f64> {
    let (sum, total) = values
        .zip(weights)
        .filter_map(|(v, w)| v.map(|v| (v * w, *w)))
        .fold((0.0, 0.0), |(s, t), (vw, w)| (s + vw, t + w));
    (total > 0.0).then(|| sum / total)
}
