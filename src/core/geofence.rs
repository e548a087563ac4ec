//! Geofence judge
//!
//! Great-circle distance on a spherical earth and the inclusive
//! "inside radius" test used to decide whether a race arrived.

use super::types::GeoPoint;

/// Mean earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points, in kilometers
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// A circular target region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub center: GeoPoint,
    pub radius_km: f64,
}

impl Geofence {
    pub fn new(center: GeoPoint, radius_km: f64) -> Self {
        Self { center, radius_km }
    }

    pub fn distance_from_center(&self, point: GeoPoint) -> f64 {
        distance_km(point, self.center)
    }

    /// Boundary is inclusive
    pub fn contains_distance(&self, distance_km: f64) -> bool {
        distance_km <= self.radius_km
    }
}
