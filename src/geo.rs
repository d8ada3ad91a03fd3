//! great-circle distance between two decimal-degree coordinates.

use serde::{Deserialize, Serialize};

/// earth radius in kilometres (equatorial, spherical approximation)
pub const EARTH_RADIUS_KM: f64 = 6378.137;

/// a point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// haversine distance in kilometres.
///
/// well-formed input only; NaN or out-of-range coordinates give an
/// unspecified result and must be rejected upstream.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    // clamp guards asin against rounding just above 1.0
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_is_zero() {
        let p = GeoPoint::new(41.0082, 28.9784);
        assert_eq!(distance_km(p, p), 0.0);
    }

    #[test]
    fn symmetric() {
        let a = GeoPoint::new(39.9334, 32.8597);
        let b = GeoPoint::new(41.0082, 28.9784);
        assert!((distance_km(a, b) - distance_km(b, a)).abs() < 1e-9);
    }

    #[test]
    fn small_longitude_step_on_equator() {
        // 0.05 degrees of longitude on the equator is ~5.57 km
        let d = distance_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.05));
        assert!((d - 5.566).abs() < 0.01, "got {d}");
    }

    #[test]
    fn ankara_to_istanbul() {
        // roughly 350 km as the crow flies
        let d = distance_km(GeoPoint::new(39.9334, 32.8597), GeoPoint::new(41.0082, 28.9784));
        assert!(d > 340.0 && d < 360.0, "got {d}");
    }
}
