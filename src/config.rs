//! Configuration for filtering, accumulation, workers and sync.
//!
//! Every struct has a `Default` carrying the documented defaults and can be
//! loaded from a partial JSON document; missing keys keep their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Configuration for raw fix filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Fixes with a worse horizontal accuracy are dropped.
    /// Default: 30.0 meters
    pub max_accuracy_meters: f64,

    /// Ceiling on the speed implied between two accepted fixes.
    /// Default: 12.0 m/s (a fast sprint; GPS jumps are usually far above this)
    pub max_speed_mps: f64,

    /// Weight of the new fix in exponential smoothing, in (0, 1].
    /// Default: 0.5
    pub smoothing_factor: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_meters: 30.0,
            max_speed_mps: 12.0,
            smoothing_factor: 0.5,
        }
    }
}

/// Configuration for the track accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Altitude changes smaller than this are treated as sensor noise.
    /// Default: 1.0 meters
    pub min_elevation_delta_meters: f64,

    /// Trailing time window for current pace.
    /// Default: 30_000 ms
    pub pace_window_ms: i64,

    /// Minimum number of points in the current pace window.
    /// Default: 3
    pub pace_window_points: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            min_elevation_delta_meters: 1.0,
            pace_window_ms: 30_000,
            pace_window_points: 3,
        }
    }
}

/// Configuration for the per-session worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Capacity of the bounded sample/command queue.
    /// Default: 256
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// First retry delay after a transient failure.
    /// Default: 2_000 ms
    pub base_backoff_ms: u64,

    /// Upper bound for the retry delay.
    /// Default: 300_000 ms (5 minutes)
    pub max_backoff_ms: u64,

    /// Random spread applied to each delay, as a fraction in [0, 1).
    /// Default: 0.2 (±20%)
    pub jitter: f64,

    /// Distinct sessions uploaded concurrently.
    /// Default: 4
    pub max_concurrency: usize,

    /// Uploaded sessions stay on the device this long for offline viewing.
    /// Default: 7 days
    pub uploaded_retention_days: u32,

    /// Wake-up interval of the background loop when nothing is scheduled.
    /// Default: 60_000 ms
    pub idle_poll_ms: u64,

    /// Per-request timeout for network remotes.
    /// Default: 30_000 ms
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 2_000,
            max_backoff_ms: 300_000,
            jitter: 0.2,
            max_concurrency: 4,
            uploaded_retention_days: 7,
            idle_poll_ms: 60_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// All engine configuration in one document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub filter: FilterConfig,
    pub accumulator: AccumulatorConfig,
    pub worker: WorkerConfig,
    pub sync: SyncConfig,
}

impl TrackerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(json)
            .map_err(|e| TrackerError::config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.filter;
        if !(f.max_accuracy_meters > 0.0) {
            return Err(TrackerError::config("filter.max_accuracy_meters must be positive"));
        }
        if !(f.max_speed_mps > 0.0) {
            return Err(TrackerError::config("filter.max_speed_mps must be positive"));
        }
        if !(f.smoothing_factor > 0.0 && f.smoothing_factor <= 1.0) {
            return Err(TrackerError::config("filter.smoothing_factor must be in (0, 1]"));
        }

        let a = &self.accumulator;
        if a.min_elevation_delta_meters < 0.0 {
            return Err(TrackerError::config(
                "accumulator.min_elevation_delta_meters must not be negative",
            ));
        }
        if a.pace_window_ms <= 0 || a.pace_window_points < 2 {
            return Err(TrackerError::config(
                "accumulator pace window needs a positive duration and at least 2 points",
            ));
        }

        if self.worker.queue_capacity == 0 {
            return Err(TrackerError::config("worker.queue_capacity must be at least 1"));
        }

        let s = &self.sync;
        if s.base_backoff_ms > s.max_backoff_ms {
            return Err(TrackerError::config(
                "sync.base_backoff_ms must not exceed sync.max_backoff_ms",
            ));
        }
        if !(0.0..1.0).contains(&s.jitter) {
            return Err(TrackerError::config("sync.jitter must be in [0, 1)"));
        }
        if s.max_concurrency == 0 {
            return Err(TrackerError::config("sync.max_concurrency must be at least 1"));
        }
        Ok(())
    }
}
