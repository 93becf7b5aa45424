//! Office geofence and mock-location rejection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// One reading from the position provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionReading {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported by software rather than GPS hardware.
    #[serde(default)]
    pub is_mocked: bool,
    /// Horizontal accuracy in meters, if known.
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

impl PositionReading {
    /// Finite coordinates inside the WGS84 range.
    pub fn is_plausible(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("location service is disabled")]
    ServiceDisabled,
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position read timed out")]
    TimedOut,
    #[error("position unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceReason {
    Inside,
    LocationDisabled,
    PermissionDenied,
    /// The provider could not produce a reading (timeout or hardware error).
    PositionUnavailable,
    /// Coordinates that are not finite or out of WGS84 range.
    InvalidPosition,
    MockLocationDetected,
    OutsideRadius,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeofenceResult {
    pub valid: bool,
    pub reason: GeofenceReason,
    /// Distance to the office, when a reading was available.
    pub distance_m: Option<f64>,
}

impl GeofenceResult {
    fn invalid(reason: GeofenceReason, distance_m: Option<f64>) -> Self {
        Self {
            valid: false,
            reason,
            distance_m,
        }
    }
}

/// Fixed office location and allowed radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Geofence {
    /// Check a position fix. The first failing precondition wins:
    /// service, permission, coordinate range, mock flag, then distance.
    pub fn validate(&self, fix: &Result<PositionReading, PositionError>) -> GeofenceResult {
        let reading = match fix {
            Ok(reading) => reading,
            Err(PositionError::ServiceDisabled) => return GeofenceResult::invalid(GeofenceReason::LocationDisabled, None),
            Err(PositionError::PermissionDenied) => return GeofenceResult::invalid(GeofenceReason::PermissionDenied, None),
            Err(_) => return GeofenceResult::invalid(GeofenceReason::PositionUnavailable, None),
        };

        if !reading.is_plausible() {
            tracing::warn!(latitude = reading.latitude, longitude = reading.longitude, "unusable position fix");
            return GeofenceResult::invalid(GeofenceReason::InvalidPosition, None);
        }

        let distance = haversine_m(reading.latitude, reading.longitude, self.latitude, self.longitude);
        if !distance.is_finite() {
            return GeofenceResult::invalid(GeofenceReason::InvalidPosition, None);
        }

        // Unconditional: being close enough never excuses a mocked reading.
        if reading.is_mocked {
            tracing::warn!(distance_m = distance, "mock location detected");
            return GeofenceResult::invalid(GeofenceReason::MockLocationDetected, Some(distance));
        }

        if distance > self.radius_m {
            tracing::info!(distance_m = distance, radius_m = self.radius_m, "position outside office radius");
            return GeofenceResult::invalid(GeofenceReason::OutsideRadius, Some(distance));
        }

        GeofenceResult {
            valid: true,
            reason: GeofenceReason::Inside,
            distance_m: Some(distance),
        }
    }
}

/// Great-circle distance in meters between two WGS84 coordinates.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFICE: Geofence = Geofence {
        latitude: -6.200000,
        longitude: 106.816666,
        radius_m: 100.0,
    };

    fn reading(lat: f64, lng: f64, mocked: bool) -> Result<PositionReading, PositionError> {
        Ok(PositionReading { latitude: lat, longitude: lng, is_mocked: mocked, accuracy_m: Some(5.0) })
    }

    /// Latitude offset (degrees) that moves `meters` due north.
    fn north(meters: f64) -> f64 {
        (meters / EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn test_at_office_is_valid() {
        let r = OFFICE.validate(&reading(OFFICE.latitude, OFFICE.longitude, false));
        assert!(r.valid);
        assert_eq!(r.reason, GeofenceReason::Inside);
        assert!(r.distance_m.unwrap() < 1e-6);
    }

    #[test]
    fn test_just_outside_radius() {
        let r = OFFICE.validate(&reading(OFFICE.latitude + north(101.0), OFFICE.longitude, false));
        assert!(!r.valid);
        assert_eq!(r.reason, GeofenceReason::OutsideRadius);
        assert!((r.distance_m.unwrap() - 101.0).abs() < 0.01);
    }

    #[test]
    fn test_just_inside_radius() {
        let r = OFFICE.validate(&reading(OFFICE.latitude + north(99.0), OFFICE.longitude, false));
        assert!(r.valid);
    }

    #[test]
    fn test_mocked_is_always_invalid() {
        let r = OFFICE.validate(&reading(OFFICE.latitude, OFFICE.longitude, true));
        assert!(!r.valid);
        assert_eq!(r.reason, GeofenceReason::MockLocationDetected);
        assert!(r.distance_m.unwrap() < 1e-6);
    }

    #[test]
    fn test_provider_errors() {
        assert_eq!(
            OFFICE.validate(&Err(PositionError::ServiceDisabled)).reason,
            GeofenceReason::LocationDisabled
        );
        assert_eq!(
            OFFICE.validate(&Err(PositionError::PermissionDenied)).reason,
            GeofenceReason::PermissionDenied
        );
        let r = OFFICE.validate(&Err(PositionError::TimedOut));
        assert_eq!(r.reason, GeofenceReason::PositionUnavailable);
        assert!(r.distance_m.is_none());
    }

    #[test]
    fn test_non_finite_coordinates_are_rejected() {
        for (lat, lng) in [
            (f64::NAN, OFFICE.longitude),
            (OFFICE.latitude, f64::NAN),
            (f64::INFINITY, OFFICE.longitude),
            (OFFICE.latitude, f64::NEG_INFINITY),
        ] {
            let r = OFFICE.validate(&reading(lat, lng, false));
            assert!(!r.valid, "({lat}, {lng}) accepted");
            assert_eq!(r.reason, GeofenceReason::InvalidPosition);
            assert!(r.distance_m.is_none());
        }
    }

    #[test]
    fn test_out_of_range_coordinates_are_rejected() {
        for (lat, lng) in [(90.5, 0.0), (-91.0, 0.0), (0.0, 180.1), (0.0, -200.0)] {
            let r = OFFICE.validate(&reading(lat, lng, false));
            assert_eq!(r.reason, GeofenceReason::InvalidPosition);
        }
        // A mocked fix with garbage coordinates is still invalid.
        assert!(!OFFICE.validate(&reading(f64::NAN, 0.0, true)).valid);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London, roughly 343.5 km.
        let d = haversine_m(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 343_500.0).abs() < 1_500.0, "d = {d}");
    }

    #[test]
    fn test_haversine_symmetric() {
        let a = haversine_m(1.0, 2.0, 3.0, 4.0);
        let b = haversine_m(3.0, 4.0, 1.0, 2.0);
        assert!((a - b).abs() < 1e-6);
    }
}
