//! # GeoSample Filter
//!
//! Cleans the raw fix stream of one session before it reaches the accumulator.
//!
//! A fix is dropped when:
//! 1. its coordinates are not usable
//! 2. its horizontal accuracy is worse than `max_accuracy_meters`
//! 3. its timestamp is not after the last accepted fix (duplicates, late delivery)
//!    or lies before the start of the current recording segment
//! 4. reaching it from the last accepted fix needs more than `max_speed_mps`,
//!    counting only the distance beyond both fixes' accuracy radii
//!
//! The jump reference survives pauses; the elapsed time since the last accepted
//! fix includes the paused interval. If [`JUMP_CONFIRMATIONS`] rejected fixes in
//! a row agree with each other, the device really is somewhere else and the
//! filter re-anchors on the last of them.
//!
//! Accepted fixes are smoothed. A fix that lands within its own accuracy radius
//! of the smoothed position is jitter and gets blended in with the smoothing
//! factor; a fix outside that radius is real motion and the smoothed position
//! snaps to it, so lag never exceeds the accuracy radius.

use log::debug;

use crate::config::FilterConfig;
use crate::error::RejectReason;
use crate::geo_utils::haversine_distance;
use crate::{GeoSample, TrackPoint};

/// Consecutive mutually consistent jump rejections that re-anchor the filter.
pub const JUMP_CONFIRMATIONS: u32 = 3;

/// Acceptance counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub accepted: u64,
    pub invalid_coordinates: u64,
    pub low_accuracy: u64,
    pub implausible_speed: u64,
    pub out_of_order: u64,
}

impl FilterStats {
    pub fn rejected(&self) -> u64 {
        self.invalid_coordinates + self.low_accuracy + self.implausible_speed + self.out_of_order
    }

    fn count(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::InvalidCoordinates => self.invalid_coordinates += 1,
            RejectReason::LowAccuracy => self.low_accuracy += 1,
            RejectReason::ImplausibleSpeed => self.implausible_speed += 1,
            RejectReason::OutOfOrder => self.out_of_order += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Smoothed {
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
}

/// Per-session fix filter. Holds only smoothing state for its own session.
#[derive(Debug, Clone)]
pub struct GeoFilter {
    config: FilterConfig,
    /// Last accepted fix as delivered (unsmoothed), the reference for jump detection
    last_accepted: Option<GeoSample>,
    last_timestamp_ms: Option<i64>,
    /// Fixes stamped before this belong to an earlier phase
    segment_start_ms: Option<i64>,
    /// Latest jump rejection and how many agreeing ones led up to it
    jump_candidate: Option<(GeoSample, u32)>,
    smoothed: Option<Smoothed>,
    stats: FilterStats,
}

impl GeoFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            last_accepted: None,
            last_timestamp_ms: None,
            segment_start_ms: None,
            jump_candidate: None,
            smoothed: None,
            stats: FilterStats::default(),
        }
    }

    /// Continue filtering after the given stored point (used after recovery).
    pub fn seeded(config: FilterConfig, last: &TrackPoint) -> Self {
        let mut filter = Self::new(config);
        filter.last_accepted = Some(last.sample());
        filter.last_timestamp_ms = Some(last.timestamp_ms);
        filter.smoothed = Some(Smoothed {
            latitude: last.latitude,
            longitude: last.longitude,
            altitude: last.altitude,
        });
        filter
    }

    /// Start a recording segment at `segment_start_ms`.
    ///
    /// Fixes stamped before it are dropped as out of order. The jump reference
    /// is kept; only the smoothing state and any pending jump streak are reset.
    pub fn restart(&mut self, segment_start_ms: i64) {
        self.segment_start_ms = Some(segment_start_ms);
        self.jump_candidate = None;
        self.smoothed = None;
    }

    /// Filter a fix, returning the smoothed fix or `None` if it was dropped.
    ///
    /// Drops are silent apart from a debug log line and the counters.
    pub fn accept(&mut self, sample: GeoSample) -> Option<GeoSample> {
        match self.evaluate(sample) {
            Ok(smoothed) => Some(smoothed),
            Err(reason) => {
                debug!(
                    "[GeoFilter] Dropped fix at {} ({}, acc {:.1}m): {}",
                    sample.timestamp_ms, sample.latitude, sample.horizontal_accuracy, reason
                );
                None
            }
        }
    }

    /// Filter a fix, returning why it was dropped.
    pub fn evaluate(&mut self, sample: GeoSample) -> Result<GeoSample, RejectReason> {
        let verdict = match self.check(&sample) {
            Err(RejectReason::ImplausibleSpeed) if self.confirm_jump(sample) => {
                debug!(
                    "[GeoFilter] Re-anchored at fix {} after {} agreeing jumps",
                    sample.timestamp_ms, JUMP_CONFIRMATIONS
                );
                self.smoothed = None;
                Ok(())
            }
            other => other,
        };
        match verdict {
            Ok(()) => {
                self.stats.accepted += 1;
                self.last_accepted = Some(sample);
                self.last_timestamp_ms = Some(sample.timestamp_ms);
                self.jump_candidate = None;
                Ok(self.smooth(sample))
            }
            Err(reason) => {
                self.stats.count(reason);
                Err(reason)
            }
        }
    }

    fn check(&self, sample: &GeoSample) -> Result<(), RejectReason> {
        if !sample.is_valid() {
            return Err(RejectReason::InvalidCoordinates);
        }
        if !(sample.horizontal_accuracy <= self.config.max_accuracy_meters) {
            // NaN accuracy lands here too
            return Err(RejectReason::LowAccuracy);
        }

        let before_last = self
            .last_timestamp_ms
            .is_some_and(|last| sample.timestamp_ms <= last);
        let before_segment = self
            .segment_start_ms
            .is_some_and(|start| sample.timestamp_ms < start);
        if before_last || before_segment {
            return Err(RejectReason::OutOfOrder);
        }

        match self.last_accepted {
            Some(last) if !self.plausible(&last, sample) => Err(RejectReason::ImplausibleSpeed),
            _ => Ok(()),
        }
    }

    /// Whether `to` is reachable from `from` within the speed ceiling. Only
    /// movement beyond both accuracy radii counts.
    fn plausible(&self, from: &GeoSample, to: &GeoSample) -> bool {
        let dt_seconds = (to.timestamp_ms - from.timestamp_ms) as f64 / 1000.0;
        if dt_seconds <= 0.0 {
            return false;
        }
        let distance = haversine_distance(from.latitude, from.longitude, to.latitude, to.longitude);
        let excess = (distance - from.horizontal_accuracy - to.horizontal_accuracy).max(0.0);
        excess / dt_seconds <= self.config.max_speed_mps
    }

    /// Track a jump rejection. True once enough agreeing rejections arrived.
    fn confirm_jump(&mut self, sample: GeoSample) -> bool {
        let streak = match self.jump_candidate {
            Some((prev, n)) if self.plausible(&prev, &sample) => n + 1,
            _ => 1,
        };
        if streak >= JUMP_CONFIRMATIONS {
            self.jump_candidate = None;
            true
        } else {
            self.jump_candidate = Some((sample, streak));
            false
        }
    }

    fn smooth(&mut self, sample: GeoSample) -> GeoSample {
        let alpha = self.config.smoothing_factor;

        let next = match self.smoothed {
            None => Smoothed {
                latitude: sample.latitude,
                longitude: sample.longitude,
                altitude: sample.altitude,
            },
            Some(prev) => {
                let offset =
                    haversine_distance(prev.latitude, prev.longitude, sample.latitude, sample.longitude);
                let (latitude, longitude) = if offset <= sample.horizontal_accuracy {
                    (
                        prev.latitude + alpha * (sample.latitude - prev.latitude),
                        prev.longitude + alpha * (sample.longitude - prev.longitude),
                    )
                } else {
                    (sample.latitude, sample.longitude)
                };

                let altitude = match (prev.altitude, sample.altitude) {
                    (Some(p), Some(a)) => Some(p + alpha * (a - p)),
                    (_, a) => a,
                };

                Smoothed {
                    latitude,
                    longitude,
                    altitude,
                }
            }
        };

        self.smoothed = Some(next);
        GeoSample {
            latitude: next.latitude,
            longitude: next.longitude,
            altitude: next.altitude,
            ..sample
        }
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(t_ms: i64, lat: f64, lon: f64, acc: f64) -> GeoSample {
        GeoSample::new(t_ms, lat, lon, acc)
    }

    #[test]
    fn test_first_fix_passes_unchanged() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        let out = filter.accept(fix(0, 51.5, -0.12, 5.0)).unwrap();
        assert_eq!(out.latitude, 51.5);
        assert_eq!(out.longitude, -0.12);
    }

    #[test]
    fn test_low_accuracy_always_rejected() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        assert_eq!(
            filter.evaluate(fix(0, 0.0, 0.0, 30.1)),
            Err(RejectReason::LowAccuracy)
        );
        filter.accept(fix(1_000, 0.0, 0.0, 5.0)).unwrap();
        // Same position, plausible in every other way
        assert_eq!(
            filter.evaluate(fix(2_000, 0.0, 0.0, 100.0)),
            Err(RejectReason::LowAccuracy)
        );
        assert_eq!(
            filter.evaluate(fix(3_000, 0.0, 0.0, f64::NAN)),
            Err(RejectReason::LowAccuracy)
        );
        assert_eq!(filter.stats().low_accuracy, 3);
    }

    #[test]
    fn test_out_of_order_and_duplicate_dropped() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(5_000, 0.0, 0.0, 5.0)).unwrap();
        assert_eq!(
            filter.evaluate(fix(5_000, 0.0, 0.00001, 5.0)),
            Err(RejectReason::OutOfOrder)
        );
        assert_eq!(
            filter.evaluate(fix(4_000, 0.0, 0.00001, 5.0)),
            Err(RejectReason::OutOfOrder)
        );
        assert!(filter.accept(fix(6_000, 0.0, 0.00001, 5.0)).is_some());
    }

    #[test]
    fn test_gps_jump_rejected() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 5.0)).unwrap();
        // ~111m in one second
        assert_eq!(
            filter.evaluate(fix(1_000, 0.001, 0.0, 5.0)),
            Err(RejectReason::ImplausibleSpeed)
        );
        // Same spot 20s later is a plausible ~5.6 m/s
        assert!(filter.accept(fix(20_000, 0.001, 0.0, 5.0)).is_some());
    }

    #[test]
    fn test_speed_allows_for_accuracy_radii() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 5.0)).unwrap();
        // 15.7m in 1s, but only 5.7m lies outside the two 5m radii
        assert!(filter.accept(fix(1_000, 0.0001, 0.0001, 5.0)).is_some());
    }

    #[test]
    fn test_invalid_coordinates_rejected() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        assert_eq!(
            filter.evaluate(fix(0, 95.0, 0.0, 5.0)),
            Err(RejectReason::InvalidCoordinates)
        );
        assert_eq!(filter.stats().rejected(), 1);
        assert_eq!(filter.stats().accepted, 0);
    }

    #[test]
    fn test_jitter_is_smoothed() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 10.0)).unwrap();
        // ~3.3m offset, inside the 10m accuracy radius
        let out = filter.accept(fix(1_000, 0.00003, 0.0, 10.0)).unwrap();
        assert!((out.latitude - 0.000015).abs() < 1e-12);
    }

    #[test]
    fn test_real_motion_is_not_lagged() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 5.0)).unwrap();
        let out = filter.accept(fix(1_000, 0.0001, 0.0001, 5.0)).unwrap();
        assert_eq!(out.latitude, 0.0001);
        assert_eq!(out.longitude, 0.0001);
    }

    #[test]
    fn test_altitude_smoothing() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 5.0).with_altitude(100.0)).unwrap();
        let out = filter
            .accept(fix(1_000, 0.0, 0.00002, 5.0).with_altitude(110.0))
            .unwrap();
        assert_eq!(out.altitude, Some(105.0));

        let out = filter.accept(fix(2_000, 0.0, 0.00004, 5.0)).unwrap();
        assert_eq!(out.altitude, None);
    }

    #[test]
    fn test_restart_keeps_jump_reference() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(10_000, 0.0, 0.0, 5.0)).unwrap();
        filter.restart(20_000);
        // ~11km, 11s after the last accepted fix
        assert_eq!(
            filter.evaluate(fix(21_000, 0.1, 0.0, 5.0)),
            Err(RejectReason::ImplausibleSpeed)
        );
        // Walking pace across the pause is fine
        assert!(filter.accept(fix(22_000, 0.0003, 0.0, 5.0)).is_some());
    }

    #[test]
    fn test_restart_drops_fixes_before_segment() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(10_000, 0.0, 0.0, 5.0)).unwrap();
        filter.restart(70_000);
        assert_eq!(
            filter.evaluate(fix(40_000, 0.0, 0.00001, 5.0)),
            Err(RejectReason::OutOfOrder)
        );
        assert!(filter.accept(fix(70_000, 0.0, 0.00001, 5.0)).is_some());
        assert_eq!(filter.stats().out_of_order, 1);
    }

    #[test]
    fn test_agreeing_jumps_re_anchor() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 5.0)).unwrap();
        // The device really moved ~5.5km; fixes there agree with each other
        for t in [1_000, 2_000] {
            assert_eq!(
                filter.evaluate(fix(t, 0.05, 0.0, 5.0)),
                Err(RejectReason::ImplausibleSpeed)
            );
        }
        let out = filter.accept(fix(3_000, 0.05, 0.0, 5.0)).unwrap();
        assert_eq!(out.latitude, 0.05);
        assert!(filter.accept(fix(4_000, 0.05001, 0.0, 5.0)).is_some());
    }

    #[test]
    fn test_scattered_jumps_never_re_anchor() {
        let mut filter = GeoFilter::new(FilterConfig::default());
        filter.accept(fix(0, 0.0, 0.0, 5.0)).unwrap();
        for (i, lat) in [0.05, -0.05, 0.05, -0.05, 0.05].into_iter().enumerate() {
            assert_eq!(
                filter.evaluate(fix((i as i64 + 1) * 1_000, lat, 0.0, 5.0)),
                Err(RejectReason::ImplausibleSpeed)
            );
        }
        assert_eq!(filter.stats().implausible_speed, 5);
    }

    #[test]
    fn test_seeded_filter_continues_after_point() {
        let last = TrackPoint {
            timestamp_ms: 10_000,
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            horizontal_accuracy: 5.0,
            speed: None,
            cumulative_distance: 120.0,
            cumulative_elevation_gain: 0.0,
        };
        let mut filter = GeoFilter::seeded(FilterConfig::default(), &last);
        assert_eq!(
            filter.evaluate(fix(9_000, 0.0, 0.0, 5.0)),
            Err(RejectReason::OutOfOrder)
        );
        assert!(filter.accept(fix(11_000, 0.0, 0.00005, 5.0)).is_some());
    }
}
