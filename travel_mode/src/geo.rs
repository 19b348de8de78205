//! Spherical-earth distance helpers shared by the kinematics and activity stages.

/// Mean earth radius used by the trajectory pipeline (meters).
pub const EARTH_RADIUS_M: f64 = 6_367_000.0;

/// Great-circle distance in meters between two (lat, lon) pairs given in degrees.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64, radius_m: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair above 1 for antipodal points.
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();
    radius_m * c
}

/// Round half away from zero to two decimal places, matching a `decimal(10,2)` cast.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
