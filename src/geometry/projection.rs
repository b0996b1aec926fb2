//! CRS helpers: closed-form Web Mercator math plus `proj4rs` for everything else
//!
//! Scene rasters usually come in a UTM zone while output grids are either Web
//! Mercator (map tiles) or plain lon/lat (bbox crops). [`Reprojector`] picks the
//! cheapest way to get from one to the other once, then reuses it per pixel.

use std::f64::consts::PI;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

pub const EPSG_WGS84: i32 = 4326;
pub const EPSG_WEB_MERCATOR: i32 = 3857;

/// Half the earth's circumference in Web Mercator meters
pub const HALF_EARTH: f64 = 20_037_508.342_789_244;

/// Latitude limit of the square Web Mercator world
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Longitude (degrees) to Web Mercator X (meters)
#[inline(always)]
#[must_use]
pub fn lon_to_merc_x(lon: f64) -> f64 {
    lon * HALF_EARTH / 180.0
}

/// Latitude (degrees) to Web Mercator Y (meters), clamped to the mercator world
#[inline(always)]
#[must_use]
pub fn lat_to_merc_y(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    (PI / 4.0 + lat / 2.0).tan().ln() * HALF_EARTH / PI
}

/// Web Mercator X (meters) to longitude (degrees)
#[inline(always)]
#[must_use]
pub fn merc_x_to_lon(x: f64) -> f64 {
    x * 180.0 / HALF_EARTH
}

/// Web Mercator Y (meters) to latitude (degrees)
#[inline(always)]
#[must_use]
pub fn merc_y_to_lat(y: f64) -> f64 {
    let y_rad = y * PI / HALF_EARTH;
    (2.0 * y_rad.exp().atan() - PI / 2.0).to_degrees()
}

/// Get PROJ4 string for an EPSG code using the crs-definitions database
#[inline]
#[must_use]
pub fn get_proj_string(epsg: i32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: i32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        epsg == EPSG_WGS84 || (4000..5000).contains(&epsg)
    }
}

enum Strategy {
    Identity,
    GeoToMerc,
    MercToGeo,
    Proj {
        source: Box<Proj>,
        target: Box<Proj>,
        source_is_geographic: bool,
        target_is_geographic: bool,
    },
}

/// Point transformer between two EPSG codes
pub struct Reprojector {
    source_epsg: i32,
    target_epsg: i32,
    strategy: Strategy,
}

impl Reprojector {
    pub fn new(source_epsg: i32, target_epsg: i32) -> Result<Self, String> {
        let strategy = match (source_epsg, target_epsg) {
            (s, t) if s == t => Strategy::Identity,
            (EPSG_WGS84, EPSG_WEB_MERCATOR) => Strategy::GeoToMerc,
            (EPSG_WEB_MERCATOR, EPSG_WGS84) => Strategy::MercToGeo,
            _ => {
                let source_str = get_proj_string(source_epsg).ok_or_else(|| {
                    format!("EPSG:{source_epsg} is not in the crs-definitions database")
                })?;
                let target_str = get_proj_string(target_epsg).ok_or_else(|| {
                    format!("EPSG:{target_epsg} is not in the crs-definitions database")
                })?;
                let source = Proj::from_proj_string(source_str)
                    .map_err(|e| format!("Invalid projection EPSG:{source_epsg}: {e:?}"))?;
                let target = Proj::from_proj_string(target_str)
                    .map_err(|e| format!("Invalid projection EPSG:{target_epsg}: {e:?}"))?;
                Strategy::Proj {
                    source: Box::new(source),
                    target: Box::new(target),
                    source_is_geographic: is_geographic_crs(source_epsg),
                    target_is_geographic: is_geographic_crs(target_epsg),
                }
            }
        };

        Ok(Self { source_epsg, target_epsg, strategy })
    }

    #[must_use]
    pub fn source_epsg(&self) -> i32 {
        self.source_epsg
    }

    #[must_use]
    pub fn target_epsg(&self) -> i32 {
        self.target_epsg
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        matches!(self.strategy, Strategy::Identity)
    }

    /// True when points go through `proj4rs` rather than closed-form math
    #[must_use]
    pub fn uses_proj(&self) -> bool {
        matches!(self.strategy, Strategy::Proj { .. })
    }

    /// Transform one point from the source CRS to the target CRS
    #[inline]
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), String> {
        match &self.strategy {
            Strategy::Identity => Ok((x, y)),
            Strategy::GeoToMerc => Ok((lon_to_merc_x(x), lat_to_merc_y(y))),
            Strategy::MercToGeo => Ok((merc_x_to_lon(x), merc_y_to_lat(y))),
            Strategy::Proj { source, target, source_is_geographic, target_is_geographic } => {
                // proj4rs works in radians for geographic systems
                let mut point = if *source_is_geographic {
                    (x.to_radians(), y.to_radians(), 0.0)
                } else {
                    (x, y, 0.0)
                };
                transform(source, target, &mut point).map_err(|e| {
                    format!(
                        "Transform from EPSG:{} to EPSG:{} failed: {e:?}",
                        self.source_epsg, self.target_epsg
                    )
                })?;
                if *target_is_geographic {
                    Ok((point.0.to_degrees(), point.1.to_degrees()))
                } else {
                    Ok((point.0, point.1))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn test_mercator_origin() {
        assert!(lon_to_merc_x(0.0).abs() < EPS);
        assert!(lat_to_merc_y(0.0).abs() < EPS);
        assert!((lon_to_merc_x(180.0) - HALF_EARTH).abs() < EPS);
        assert!((lat_to_merc_y(MAX_MERCATOR_LAT) - HALF_EARTH).abs() < 1e-3);
    }

    #[test]
    fn test_fast_roundtrip() {
        for (lon, lat) in [(10.0, 51.5), (-122.4, 37.8), (139.7, -35.7)] {
            let back_lon = merc_x_to_lon(lon_to_merc_x(lon));
            let back_lat = merc_y_to_lat(lat_to_merc_y(lat));
            assert!((lon - back_lon).abs() < 1e-9);
            assert!((lat - back_lat).abs() < 1e-9);
        }
    }

    #[test]
    fn test_identity_strategy() {
        let r = Reprojector::new(32633, 32633).unwrap();
        assert!(r.is_identity());
        assert_eq!(r.transform(1.0, 2.0).unwrap(), (1.0, 2.0));
    }

    #[test]
    fn test_utm_roundtrip() {
        let to_utm = Reprojector::new(EPSG_WGS84, 32633).unwrap();
        let back = Reprojector::new(32633, EPSG_WGS84).unwrap();

        let (x, y) = to_utm.transform(15.0, 52.0).unwrap();
        assert!(x > 400_000.0 && x < 600_000.0, "UTM easting: {x}");
        assert!(y > 5_000_000.0 && y < 6_000_000.0, "UTM northing: {y}");

        let (lon, lat) = back.transform(x, y).unwrap();
        assert!((lon - 15.0).abs() < 1e-5);
        assert!((lat - 52.0).abs() < 1e-5);
    }

    #[test]
    fn test_merc_to_utm_matches_geo_path() {
        let merc_to_utm = Reprojector::new(EPSG_WEB_MERCATOR, 32613).unwrap();
        let geo_to_utm = Reprojector::new(EPSG_WGS84, 32613).unwrap();

        let (lon, lat) = (-105.05, 39.95);
        let direct = merc_to_utm
            .transform(lon_to_merc_x(lon), lat_to_merc_y(lat))
            .unwrap();
        let via_geo = geo_to_utm.transform(lon, lat).unwrap();
        assert!((direct.0 - via_geo.0).abs() < 0.01);
        assert!((direct.1 - via_geo.1).abs() < 0.01);
    }

    #[test]
    fn test_unsupported_epsg() {
        let err = Reprojector::new(EPSG_WGS84, 999_999).err().unwrap();
        assert!(err.contains("not in the crs-definitions database"));
    }

    #[test]
    fn test_is_geographic_crs() {
        assert!(is_geographic_crs(4326));
        assert!(!is_geographic_crs(3857));
        assert!(!is_geographic_crs(32633));
    }
}
