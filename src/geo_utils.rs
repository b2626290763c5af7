//! Geographic utilities.
//!
//! Distances are always great-circle (haversine) so they stay correct at any
//! latitude; there is no planar shortcut.

use geo::{Distance, Haversine, Point};

use crate::TrackPoint;

/// Calculate haversine distance between two coordinates in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let point1 = Point::new(lon1, lat1);
    let point2 = Point::new(lon2, lat2);
    Haversine::distance(point1, point2)
}

/// Haversine distance between two track points in meters.
pub fn point_distance(a: &TrackPoint, b: &TrackPoint) -> f64 {
    haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Sum of pairwise haversine distances along a track.
pub fn polyline_length(points: &[TrackPoint]) -> f64 {
    points.windows(2).map(|w| point_distance(&w[0], &w[1])).sum()
}
