//! # trackrs
//!
//! Workout session tracking and sync engine for GPS-recorded runs, walks and rides.
//!
//! This library provides:
//! - Filtering of noisy location fixes (accuracy, GPS jumps, out-of-order delivery)
//! - Incremental route and statistics accumulation (haversine distance, pace, elevation)
//! - A session state machine running on a dedicated worker per active session
//! - Crash-safe SQLite persistence with recovery of interrupted sessions
//! - An offline-first sync engine with retry, idempotent upload and conflict handling
//!
//! ## Features
//!
//! - **`http`** (default) - Enable the reqwest-backed remote for session upload
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackrs::{ActivityKind, GeoSample, SessionStore, SystemClock, Clock, Tracker, TrackerConfig};
//!
//! let store = Arc::new(SessionStore::in_memory().unwrap());
//! let tracker = Tracker::with_system_clock(store, TrackerConfig::default());
//!
//! let worker = tracker.start_workout(ActivityKind::Run, None).unwrap();
//! let now = SystemClock.now_ms();
//! worker.push_sample(GeoSample::new(now, 51.5074, -0.1278, 5.0)).unwrap();
//! worker.push_sample(GeoSample::new(now + 1_000, 51.5075, -0.1278, 5.0)).unwrap();
//!
//! let session = worker.stop().unwrap();
//! println!("{:.1} m", session.header.statistics.total_distance);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{FailureKind, OptionExt, RejectReason, RemoteError, Result, TrackerError};

// Tunables with documented defaults
pub mod config;
pub use config::{AccumulatorConfig, FilterConfig, SyncConfig, TrackerConfig, WorkerConfig};

// Injectable time source
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Geographic utilities (haversine distance, polyline length)
pub mod geo_utils;

// Raw fix cleaning
pub mod filter;
pub use filter::{FilterStats, GeoFilter};

// Route + running statistics
pub mod accumulator;
pub use accumulator::{StatisticsSnapshot, TrackAccumulator};

// Session records
pub mod session;
pub use session::{Session, SessionHeader, SessionState, SyncRecord, SyncStatus};

// Lifecycle state machine
pub mod machine;
pub use machine::{ActiveSessionSlot, MachineContext, SampleOutcome, SessionMachine, WriteStatus};

// Dedicated sequential worker per active session
pub mod worker;
pub use worker::{LiveStatus, SampleSink, SessionWorker, SnapshotListener};

// Application facade
pub mod tracker;
pub use tracker::Tracker;

// SQLite-backed local session store
pub mod persistence;
pub use persistence::{ConflictRecord, SessionStore, StoreStats};

// Route rendering data
pub mod route;
pub use route::{Bounds, ElevationSample, RouteOverview};

// Upload queue, retry and conflict handling
pub mod sync;
pub use sync::{
    Backoff, DrainReport, MemoryRemote, PutOutcome, RemoteSession, RemoteStore, SessionPayload,
    SyncEngine, SyncEvent, SyncListener, SyncOutcome, SyncTrigger,
};

// HTTP remote for `PUT /sessions/{id}`
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpRemote;

/// Initialize logging for Android hosts.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("trackrs"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms; hosts install their own logger
}

// ============================================================================
// Core Types
// ============================================================================

/// Kind of outdoor workout being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    #[default]
    Run,
    Walk,
    Ride,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Run => "run",
            ActivityKind::Walk => "walk",
            ActivityKind::Ride => "ride",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = error::ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "run" => Ok(ActivityKind::Run),
            "walk" => Ok(ActivityKind::Walk),
            "ride" => Ok(ActivityKind::Ride),
            other => Err(error::ParseEnumError::new("activity kind", other)),
        }
    }
}

/// A single raw location fix from the platform location service.
///
/// # Example
/// ```
/// use trackrs::GeoSample;
/// let fix = GeoSample::new(1_700_000_000_000, 51.5074, -0.1278, 4.0).with_altitude(35.0);
/// assert!(fix.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoSample {
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude in meters (optional)
    pub altitude: Option<f64>,
    /// Horizontal accuracy radius in meters
    pub horizontal_accuracy: f64,
    /// Sensor-reported speed in m/s (optional)
    pub speed: Option<f64>,
}

impl GeoSample {
    /// Create a fix without altitude or speed.
    pub fn new(timestamp_ms: i64, latitude: f64, longitude: f64, horizontal_accuracy: f64) -> Self {
        Self {
            timestamp_ms,
            latitude,
            longitude,
            altitude: None,
            horizontal_accuracy,
            speed: None,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Check if the fix has usable coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A fix that passed filtering, with running totals at this point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPoint {
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub horizontal_accuracy: f64,
    pub speed: Option<f64>,
    /// Distance travelled since the session started, in meters
    pub cumulative_distance: f64,
    /// Elevation gained since the session started, in meters
    pub cumulative_elevation_gain: f64,
}

impl TrackPoint {
    /// The fix this point was built from.
    pub fn sample(&self) -> GeoSample {
        GeoSample {
            timestamp_ms: self.timestamp_ms,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            horizontal_accuracy: self.horizontal_accuracy,
            speed: self.speed,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
