//! Geofence checks using great-circle distance

use serde::{Deserialize, Serialize};

use crate::error::ProgressError;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A validated WGS84 coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range coordinates
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ProgressError> {
        let point = Self { latitude, longitude };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> Result<(), ProgressError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ProgressError::Validation(format!(
                "latitude must be within [-90, 90], got {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ProgressError::Validation(format!(
                "longitude must be within [-180, 180], got {}",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Haversine distance between two points in meters
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Whether `player` is within `radius_m + tolerance_m` of `checkpoint`
pub fn is_within_geofence(
    player: &GeoPoint,
    checkpoint: &GeoPoint,
    radius_m: f64,
    tolerance_m: f64,
) -> bool {
    distance_m(player, checkpoint) <= radius_m + tolerance_m
}
