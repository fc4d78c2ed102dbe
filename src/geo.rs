/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two lat/lng points (degrees),
/// using the haversine formula.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Validates WGS84 coordinate ranges.
pub fn coordinates_in_range(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && lat.abs() <= 90.0 && lng.abs() <= 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_points_are_zero_meters() {
        assert_eq!(haversine_m(37.5, 127.0, 37.5, 127.0), 0.0);
    }

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let d = haversine_m(0.0, 0.0, 0.0, 1.0);
        let expected = 111_195.0;
        assert!((d - expected).abs() / expected < 0.01, "got {}", d);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = haversine_m(37.5, 127.0, 35.1, 129.0);
        let b = haversine_m(35.1, 129.0, 37.5, 127.0);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn range_check_rejects_out_of_bounds() {
        assert!(coordinates_in_range(90.0, -180.0));
        assert!(!coordinates_in_range(90.1, 0.0));
        assert!(!coordinates_in_range(0.0, 180.5));
        assert!(!coordinates_in_range(f64::NAN, 0.0));
    }
}
