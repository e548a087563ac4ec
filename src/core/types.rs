//! Core types - platform-independent data structures
//!
//! These types describe what a path probe observes: hops, and where
//! each hop appears to be on the globe.

use serde::{Deserialize, Serialize};

use super::format::format_location;

// =============================================================================
// GEO POINT
// =============================================================================

/// A point on the globe in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

// =============================================================================
// HOP LOCATION
// =============================================================================

/// Geolocation of one hop address, as returned by the lookup service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// Network operator, when the lookup service knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// Address the lookup answered for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl HopLocation {
    pub fn new(lat: f64, lon: f64, city: &str, country: &str) -> Self {
        Self {
            lat,
            lon,
            city: Some(city.to_string()),
            country: Some(country.to_string()),
            org: None,
            query: None,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    /// "City, Country" with "Unknown" standing in for missing parts
    pub fn display_name(&self) -> String {
        format_location(self.city.as_deref(), self.country.as_deref())
    }
}

// =============================================================================
// HOP
// =============================================================================

/// One element of a path probe: 1-based index and the responding address.
///
/// `address` is `None` when the hop did not answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub index: u32,
    pub address: Option<String>,
}

impl Hop {
    pub fn new(index: u32, address: Option<&str>) -> Self {
        Self {
            index,
            address: address.map(str::to_string),
        }
    }

    pub fn answered(index: u32, address: &str) -> Self {
        Self::new(index, Some(address))
    }

    pub fn silent(index: u32) -> Self {
        Self::new(index, None)
    }
}
