//! Coordinate helpers shared by nodes and the spatial index

use geo::Point;

/// Half the width of the Web Mercator plane in meters (EPSG:3857)
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;

/// Latitudes beyond this are clamped before projecting
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Precision of coordinates stored by the remote server, in degrees
pub const MAX_SERVER_PRECISION: f64 = 1e-7;

const LON_TO_X_FACTOR: f64 = EARTH_MERCATOR_MAX / 180.0;
const Y_FACTOR: f64 = EARTH_MERCATOR_MAX / std::f64::consts::PI;

/// Project a WGS84 coordinate to Web Mercator easting/northing in meters
///
/// Latitude is clamped to ±[`MAX_LATITUDE`] so poles stay finite.
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let north = (lat_rad.tan() + lat_rad.cos().recip()).ln() * Y_FACTOR;
    Point::new(lon * LON_TO_X_FACTOR, north)
}

/// Check if a WGS84 coordinate lies on the globe
#[inline(always)]
pub fn is_valid_wgs84(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Round a coordinate value to the precision stored by the remote server
#[inline]
pub fn round_to_server_precision(value: f64) -> f64 {
    (value / MAX_SERVER_PRECISION).round() * MAX_SERVER_PRECISION
}
