//! Route rendering data for map and chart collaborators.
//!
//! Tracks are exchanged as Google encoded polylines (precision 5), optionally
//! simplified with Douglas-Peucker first.

use geo::{Coord, LineString, Simplify};
use serde::{Deserialize, Serialize};

use crate::TrackPoint;

/// Default Douglas-Peucker tolerance in degrees (~1m at the equator).
pub const DEFAULT_SIMPLIFY_TOLERANCE: f64 = 0.00001;

/// Bounding box of a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// `None` for an empty track.
    pub fn from_points(points: &[TrackPoint]) -> Option<Self> {
        let first = points.first()?;
        let mut bounds = Bounds {
            min_lat: first.latitude,
            max_lat: first.latitude,
            min_lng: first.longitude,
            max_lng: first.longitude,
        };
        for p in &points[1..] {
            bounds.min_lat = bounds.min_lat.min(p.latitude);
            bounds.max_lat = bounds.max_lat.max(p.latitude);
            bounds.min_lng = bounds.min_lng.min(p.longitude);
            bounds.max_lng = bounds.max_lng.max(p.longitude);
        }
        Some(bounds)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// One point of the elevation chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElevationSample {
    /// Distance from the start in meters
    pub distance: f64,
    pub altitude: f64,
}

/// Everything a detail screen needs to draw a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOverview {
    pub polyline: String,
    pub simplified_polyline: String,
    pub bounds: Option<Bounds>,
    pub elevation_profile: Vec<ElevationSample>,
    pub total_distance: f64,
}

impl RouteOverview {
    pub fn build(points: &[TrackPoint], tolerance: f64) -> Self {
        Self {
            polyline: encode_track(points),
            simplified_polyline: encode_line(simplify_track(points, tolerance)),
            bounds: Bounds::from_points(points),
            elevation_profile: elevation_profile(points),
            total_distance: points.last().map_or(0.0, |p| p.cumulative_distance),
        }
    }
}

fn to_line(points: &[TrackPoint]) -> LineString<f64> {
    // geo expects (x, y) = (lng, lat)
    points
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect()
}

fn encode_line(line: LineString<f64>) -> String {
    if line.0.len() < 2 {
        return String::new();
    }
    polyline::encode_coordinates(line, 5).unwrap_or_default()
}

/// Encode the full track as a polyline. Empty for fewer than two points.
pub fn encode_track(points: &[TrackPoint]) -> String {
    encode_line(to_line(points))
}

/// Decode a polyline into `(lat, lng)` pairs.
pub fn decode_track(encoded: &str) -> Vec<(f64, f64)> {
    if encoded.is_empty() {
        return Vec::new();
    }
    polyline::decode_polyline(encoded, 5)
        .map(|line| line.coords().map(|c| (c.y, c.x)).collect())
        .unwrap_or_default()
}

/// Douglas-Peucker simplification with `tolerance` in degrees.
pub fn simplify_track(points: &[TrackPoint], tolerance: f64) -> LineString<f64> {
    let line = to_line(points);
    if points.len() < 3 {
        return line;
    }
    line.simplify(&tolerance)
}

/// `(distance, altitude)` pairs for the points that carry an altitude.
pub fn elevation_profile(points: &[TrackPoint]) -> Vec<ElevationSample> {
    points
        .iter()
        .filter_map(|p| {
            p.altitude.map(|altitude| ElevationSample {
                distance: p.cumulative_distance,
                altitude,
            })
        })
        .collect()
}
