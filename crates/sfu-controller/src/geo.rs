//! Geo-IP resolution for worker placement.
//!
//! The resolver is an external collaborator; [`GeoIpResolver`] is the seam.
//! [`StaticGeoIp`] serves a fixed table (from configuration or tests).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub long: f64,
}

impl Coordinate {
    /// Returns `None` for out-of-range or non-finite values.
    pub fn new(lat: f64, long: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && long.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&long);
        valid.then_some(Self { lat, long })
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_long = (other.long - self.long).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos()
                * other.lat.to_radians().cos()
                * (d_long / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// Resolves an IP address to a coordinate, or `None` when unknown.
pub trait GeoIpResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Option<Coordinate>;
}

/// Table-backed resolver.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoIp {
    table: HashMap<String, Coordinate>,
}

impl StaticGeoIp {
    pub fn new(table: HashMap<String, Coordinate>) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn with_entry(mut self, ip: impl Into<String>, coordinate: Coordinate) -> Self {
        self.table.insert(ip.into(), coordinate);
        self
    }
}

impl GeoIpResolver for StaticGeoIp {
    fn resolve(&self, ip: &str) -> Option<Coordinate> {
        self.table.get(ip).copied()
    }
}
