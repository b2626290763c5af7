//! # Track Accumulator
//!
//! Folds filtered fixes into the growing track and keeps the running statistics.
//!
//! - Distance: haversine between consecutive points, accumulated per point
//! - Elevation: gain/loss counted against a reference altitude that only moves
//!   once the change reaches `min_elevation_delta_meters`
//! - Duration: sum of recording segments; paused time is never counted
//! - Current pace: trailing window of the last `pace_window_ms` or the last
//!   `pace_window_points` points of the current segment, whichever spans more
//! - Average pace: total duration over total distance, `None` while distance is 0

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::AccumulatorConfig;
use crate::geo_utils::haversine_distance;
use crate::{GeoSample, TrackPoint};

/// Derived statistics for a session. Produced by the accumulator only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    /// Total distance in meters
    pub total_distance: f64,
    /// Active (non-paused) time in seconds
    pub duration_seconds: f64,
    /// Seconds per kilometer over the whole session (None while distance is 0)
    pub average_pace: Option<f64>,
    /// Seconds per kilometer over the trailing window (None without movement)
    pub current_pace: Option<f64>,
    /// Elevation gain in meters
    pub elevation_gain: f64,
    /// Elevation loss in meters (positive number)
    pub elevation_loss: f64,
    /// Number of accepted track points
    pub point_count: u32,
}

/// Seconds per kilometer, or `None` when no distance was covered.
pub fn pace_seconds_per_km(seconds: f64, meters: f64) -> Option<f64> {
    if meters > 0.0 && seconds > 0.0 {
        Some(seconds / (meters / 1000.0))
    } else {
        None
    }
}

/// Running track and statistics of one session.
#[derive(Debug, Clone)]
pub struct TrackAccumulator {
    config: AccumulatorConfig,
    points: Vec<TrackPoint>,
    elevation_gain: f64,
    elevation_loss: f64,
    /// Altitude that elevation deltas are measured against
    elevation_ref: Option<f64>,
    /// Active time of closed segments
    closed_ms: i64,
    /// Start of the open recording segment
    segment_started_at: Option<i64>,
    /// First point index of the current segment
    segment_first_index: usize,
    snapshot: StatisticsSnapshot,
}

impl TrackAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            points: Vec::new(),
            elevation_gain: 0.0,
            elevation_loss: 0.0,
            elevation_ref: None,
            closed_ms: 0,
            segment_started_at: None,
            segment_first_index: 0,
            snapshot: StatisticsSnapshot::default(),
        }
    }

    /// Rebuild from stored points and closed active time. No segment is open.
    pub fn restore(config: AccumulatorConfig, points: Vec<TrackPoint>, closed_ms: i64) -> Self {
        let mut acc = Self::new(config);
        for point in &points {
            if let Some(altitude) = point.altitude {
                acc.apply_elevation(altitude);
            }
        }
        acc.points = points;
        acc.closed_ms = closed_ms.max(0);
        acc.refresh(None);
        acc
    }

    /// Open a recording segment at `at_ms`.
    pub fn begin_segment(&mut self, at_ms: i64) {
        if self.segment_started_at.is_none() {
            self.segment_started_at = Some(at_ms);
            self.segment_first_index = self.points.len();
        }
    }

    /// Close the open segment at `at_ms` and fold it into the active time.
    pub fn end_segment(&mut self, at_ms: i64) {
        if let Some(start) = self.segment_started_at.take() {
            self.closed_ms += (at_ms - start).max(0);
            self.refresh(None);
        }
    }

    /// Append a filtered fix and return the updated statistics.
    ///
    /// Distance is always measured from the previous point, including across a
    /// pause. Ground covered while paused therefore adds to `total_distance`
    /// but not to the active time, which lowers the average pace (seconds per
    /// km) after a pause with travel. Current pace is unaffected because its
    /// window never crosses a segment boundary.
    ///
    /// Returns `None` (and appends nothing) if the fix is older than the last
    /// point; the filter normally guarantees this never happens.
    pub fn append(&mut self, sample: GeoSample) -> Option<StatisticsSnapshot> {
        let (cumulative_distance, prev_ts) = match self.points.last() {
            Some(prev) => (
                prev.cumulative_distance
                    + haversine_distance(
                        prev.latitude,
                        prev.longitude,
                        sample.latitude,
                        sample.longitude,
                    ),
                Some(prev.timestamp_ms),
            ),
            None => (0.0, None),
        };

        if prev_ts.is_some_and(|ts| sample.timestamp_ms < ts) {
            warn!(
                "[TrackAccumulator] Ignoring fix at {} older than last point",
                sample.timestamp_ms
            );
            return None;
        }

        if let Some(altitude) = sample.altitude {
            self.apply_elevation(altitude);
        }

        self.points.push(TrackPoint {
            timestamp_ms: sample.timestamp_ms,
            latitude: sample.latitude,
            longitude: sample.longitude,
            altitude: sample.altitude,
            horizontal_accuracy: sample.horizontal_accuracy,
            speed: sample.speed,
            cumulative_distance,
            cumulative_elevation_gain: self.elevation_gain,
        });

        self.refresh(Some(sample.timestamp_ms));
        Some(self.snapshot.clone())
    }

    fn apply_elevation(&mut self, altitude: f64) {
        let Some(reference) = self.elevation_ref else {
            self.elevation_ref = Some(altitude);
            return;
        };
        let delta = altitude - reference;
        if delta.abs() < self.config.min_elevation_delta_meters {
            return;
        }
        if delta > 0.0 {
            self.elevation_gain += delta;
        } else {
            self.elevation_loss += -delta;
        }
        self.elevation_ref = Some(altitude);
    }

    fn refresh(&mut self, now_ms: Option<i64>) {
        let total_distance = self.total_distance();
        let duration_seconds = self.active_ms(now_ms) as f64 / 1000.0;
        self.snapshot = StatisticsSnapshot {
            total_distance,
            duration_seconds,
            average_pace: pace_seconds_per_km(duration_seconds, total_distance),
            current_pace: self.current_pace(),
            elevation_gain: self.elevation_gain,
            elevation_loss: self.elevation_loss,
            point_count: self.points.len() as u32,
        };
    }

    fn current_pace(&self) -> Option<f64> {
        let segment = &self.points[self.segment_first_index.min(self.points.len())..];
        let last = segment.last()?;
        if segment.len() < 2 {
            return None;
        }

        let by_time = segment
            .iter()
            .position(|p| last.timestamp_ms - p.timestamp_ms <= self.config.pace_window_ms)
            .unwrap_or(segment.len() - 1);
        let by_count = segment.len().saturating_sub(self.config.pace_window_points);
        let first = &segment[by_time.min(by_count)];

        pace_seconds_per_km(
            (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0,
            last.cumulative_distance - first.cumulative_distance,
        )
    }

    /// Active time in ms, counting the open segment up to `now_ms`.
    pub fn active_ms(&self, now_ms: Option<i64>) -> i64 {
        let open = match (self.segment_started_at, now_ms) {
            (Some(start), Some(now)) => (now - start).max(0),
            _ => 0,
        };
        self.closed_ms + open
    }

    /// Statistics with the open segment extended to `now_ms`, for live display
    /// between fixes.
    pub fn snapshot_at(&self, now_ms: i64) -> StatisticsSnapshot {
        let mut snapshot = self.snapshot.clone();
        if self.segment_started_at.is_some() {
            snapshot.duration_seconds = self.active_ms(Some(now_ms)) as f64 / 1000.0;
            snapshot.average_pace =
                pace_seconds_per_km(snapshot.duration_seconds, snapshot.total_distance);
        }
        snapshot
    }

    /// Statistics as of the last point or transition.
    pub fn snapshot(&self) -> &StatisticsSnapshot {
        &self.snapshot
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn last_point(&self) -> Option<&TrackPoint> {
        self.points.last()
    }

    pub fn total_distance(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.cumulative_distance)
    }

    pub fn closed_ms(&self) -> i64 {
        self.closed_ms
    }

    pub fn segment_started_at(&self) -> Option<i64> {
        self.segment_started_at
    }

    pub fn into_points(self) -> Vec<TrackPoint> {
        self.points
    }
}
