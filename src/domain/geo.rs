//! Geographic and session-local coordinate types.
//!
//! Observations arrive georeferenced (WGS84 lat/lon/alt). All fusion math
//! runs in a session-local East-North-Up (ENU) frame anchored at the
//! session's reference origin, so state vectors and covariances are in
//! metres and metres/second.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres (WGS84 sphere approximation).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Floor on the longitude cosine scale; keeps the frame invertible for
/// origins at or near the poles, where meridians converge.
const MIN_LON_COS: f64 = 1e-6;

/// A WGS84 geographic position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Latitude in degrees, [-90, 90]
    pub lat_deg: f64,
    /// Longitude in degrees, [-180, 180]
    pub lon_deg: f64,
    /// Altitude above the WGS84 ellipsoid in metres
    pub alt_m: f64,
}

impl GeoPosition {
    /// Validated constructor. Returns `None` for non-finite or
    /// out-of-range coordinates.
    pub fn new(lat_deg: f64, lon_deg: f64, alt_m: f64) -> Option<Self> {
        if !lat_deg.is_finite() || !lon_deg.is_finite() || !alt_m.is_finite() {
            return None;
        }
        if lat_deg.abs() > 90.0 || lon_deg.abs() > 180.0 {
            return None;
        }
        Some(Self {
            lat_deg,
            lon_deg,
            alt_m,
        })
    }

    /// Great-circle surface distance to another position in metres
    /// (haversine, ignores altitude).
    pub fn surface_distance_m(&self, other: &GeoPosition) -> f64 {
        let lat1 = self.lat_deg.to_radians();
        let lat2 = other.lat_deg.to_radians();
        let dlat = (other.lat_deg - self.lat_deg).to_radians();
        let dlon = (other.lon_deg - self.lon_deg).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// A position in a session-local ENU frame, metres from the origin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EnuPosition {
    /// East offset (m)
    pub east: f64,
    /// North offset (m)
    pub north: f64,
    /// Up offset (m)
    pub up: f64,
}

impl EnuPosition {
    /// Construct from raw components.
    pub fn new(east: f64, north: f64, up: f64) -> Self {
        Self { east, north, up }
    }

    /// Euclidean 3-D distance to another ENU point in metres.
    pub fn distance_to(&self, other: &EnuPosition) -> f64 {
        let de = self.east - other.east;
        let dn = self.north - other.north;
        let du = self.up - other.up;
        (de * de + dn * dn + du * du).sqrt()
    }

    /// Horizontal (2-D) distance only.
    pub fn horizontal_distance_to(&self, other: &EnuPosition) -> f64 {
        let de = self.east - other.east;
        let dn = self.north - other.north;
        (de * de + dn * dn).sqrt()
    }
}

/// Converts between WGS84 and a local ENU frame anchored at a reference
/// origin.
///
/// Uses the equirectangular small-area approximation, which is accurate to
/// well under a metre across the tens-of-kilometres regions a single fusion
/// session covers.
#[derive(Debug, Clone, Copy)]
pub struct EnuFrame {
    origin: GeoPosition,
    /// Metres per degree of latitude at the origin.
    m_per_deg_lat: f64,
    /// Metres per degree of longitude at the origin.
    m_per_deg_lon: f64,
}

impl EnuFrame {
    /// Anchor a frame at the given origin.
    pub fn new(origin: GeoPosition) -> Self {
        let lat_rad = origin.lat_deg.to_radians();
        let m_per_deg = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        Self {
            origin,
            m_per_deg_lat: m_per_deg,
            m_per_deg_lon: m_per_deg * lat_rad.cos().max(MIN_LON_COS),
        }
    }

    /// The frame's reference origin.
    pub fn origin(&self) -> GeoPosition {
        self.origin
    }

    /// Project a geographic position into this frame.
    pub fn to_enu(&self, geo: &GeoPosition) -> EnuPosition {
        EnuPosition {
            east: (geo.lon_deg - self.origin.lon_deg) * self.m_per_deg_lon,
            north: (geo.lat_deg - self.origin.lat_deg) * self.m_per_deg_lat,
            up: geo.alt_m - self.origin.alt_m,
        }
    }

    /// Lift an ENU position back to WGS84.
    pub fn to_geo(&self, enu: &EnuPosition) -> GeoPosition {
        GeoPosition {
            lat_deg: self.origin.lat_deg + enu.north / self.m_per_deg_lat,
            lon_deg: self.origin.lon_deg + enu.east / self.m_per_deg_lon,
            alt_m: self.origin.alt_m + enu.up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPosition::new(91.0, 0.0, 0.0).is_none());
        assert!(GeoPosition::new(-90.5, 0.0, 0.0).is_none());
        assert!(GeoPosition::new(0.0, 180.5, 0.0).is_none());
        assert!(GeoPosition::new(f64::NAN, 0.0, 0.0).is_none());
        assert!(GeoPosition::new(45.0, 7.0, 300.0).is_some());
    }

    #[test]
    fn enu_round_trip() {
        let origin = GeoPosition::new(48.1, 11.5, 500.0).unwrap();
        let frame = EnuFrame::new(origin);

        let p = GeoPosition::new(48.15, 11.58, 620.0).unwrap();
        let enu = frame.to_enu(&p);
        let back = frame.to_geo(&enu);

        assert_relative_eq!(back.lat_deg, p.lat_deg, epsilon = 1e-9);
        assert_relative_eq!(back.lon_deg, p.lon_deg, epsilon = 1e-9);
        assert_relative_eq!(back.alt_m, p.alt_m, epsilon = 1e-9);
    }

    #[test]
    fn enu_distance_matches_haversine_locally() {
        let origin = GeoPosition::new(0.0, 0.0, 0.0).unwrap();
        let frame = EnuFrame::new(origin);

        // ~1.1 km north of the origin on the equator
        let p = GeoPosition::new(0.01, 0.0, 0.0).unwrap();
        let enu = frame.to_enu(&p);
        let flat = enu.distance_to(&EnuPosition::default());
        let curved = origin.surface_distance_m(&p);

        assert_relative_eq!(flat, curved, max_relative = 1e-3);
    }

    #[test]
    fn polar_origin_stays_finite() {
        let origin = GeoPosition::new(90.0, 0.0, 0.0).unwrap();
        let frame = EnuFrame::new(origin);

        let geo = frame.to_geo(&EnuPosition::new(100.0, 100.0, 0.0));
        assert!(geo.lat_deg.is_finite());
        assert!(geo.lon_deg.is_finite());

        let back = frame.to_enu(&geo);
        assert_relative_eq!(back.east, 100.0, epsilon = 1e-6);
        assert_relative_eq!(back.north, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn origin_maps_to_zero() {
        let origin = GeoPosition::new(-33.9, 18.4, 10.0).unwrap();
        let frame = EnuFrame::new(origin);
        let enu = frame.to_enu(&origin);
        assert!(enu.east.abs() < 1e-9);
        assert!(enu.north.abs() < 1e-9);
        assert!(enu.up.abs() < 1e-9);
    }
}
