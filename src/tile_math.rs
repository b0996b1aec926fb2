//! Web Mercator tile-grid math
//!
//! Converts between geographic bounding boxes and `(zoom, x, y)` tile addresses
//! of the standard slippy-map quad tree. All functions are pure and assume their
//! bounding box was already validated by [`GeoBoundingBox::new`].

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{MosaicError, Result};
use crate::geometry::GeoBoundingBox;
use crate::geometry::projection::{HALF_EARTH, MAX_MERCATOR_LAT};

/// Deepest zoom level the grid math accepts
pub const MAX_ZOOM: u8 = 24;

/// Inward nudge applied to every edge so a bbox lying exactly on a tile
/// boundary does not pull in the neighbouring tile
const EDGE_EPSILON: f64 = 1e-11;

/// Address of a tile in the Web Mercator grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoordinate {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    /// Create a tile address, rejecting indices outside the zoom level's grid
    pub fn new(zoom: u8, x: u32, y: u32) -> Result<Self> {
        if zoom > MAX_ZOOM || u64::from(x) >= tiles_per_side(zoom) || u64::from(y) >= tiles_per_side(zoom) {
            return Err(MosaicError::InvalidTile { z: zoom, x, y });
        }
        Ok(Self { zoom, x, y })
    }
}

impl std::fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Extent of a tile in Web Mercator meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MercatorBounds {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

#[inline]
fn tiles_per_side(zoom: u8) -> u64 {
    1_u64 << zoom
}

/// Fractional tile index of a lon/lat position
fn fractional_tile(lon: f64, lat: f64, zoom: u8) -> (f64, f64) {
    let n = tiles_per_side(zoom) as f64;
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;
    (x, y)
}

fn clamp_index(value: f64, zoom: u8) -> u32 {
    let max = (tiles_per_side(zoom) - 1) as f64;
    value.floor().clamp(0.0, max) as u32
}

/// Inclusive rectangle of tile indices at one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    /// Tiles intersecting `bbox` at `zoom`
    pub fn covering(bbox: &GeoBoundingBox, zoom: u8) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(MosaicError::InvalidZoom { zoom, max: MAX_ZOOM });
        }
        let (west_x, north_y) = fractional_tile(
            bbox.west() + EDGE_EPSILON,
            bbox.north() - EDGE_EPSILON,
            zoom,
        );
        let (east_x, south_y) = fractional_tile(
            bbox.east() - EDGE_EPSILON,
            bbox.south() + EDGE_EPSILON,
            zoom,
        );

        let min_x = clamp_index(west_x, zoom);
        let min_y = clamp_index(north_y, zoom);
        Ok(Self {
            zoom,
            min_x,
            max_x: clamp_index(east_x, zoom).max(min_x),
            min_y,
            max_y: clamp_index(south_y, zoom).max(min_y),
        })
    }

    #[must_use]
    pub fn columns(&self) -> u64 {
        u64::from(self.max_x - self.min_x) + 1
    }

    #[must_use]
    pub fn rows(&self) -> u64 {
        u64::from(self.max_y - self.min_y) + 1
    }

    /// Number of tiles; at most `4^MAX_ZOOM`, so it cannot overflow
    #[must_use]
    pub fn count(&self) -> u64 {
        self.columns() * self.rows()
    }

    /// Row-major from the north-west corner
    pub fn tiles(self) -> impl Iterator<Item = TileCoordinate> {
        let Self { zoom, min_x, max_x, min_y, max_y } = self;
        (min_y..=max_y).flat_map(move |y| (min_x..=max_x).map(move |x| TileCoordinate { zoom, x, y }))
    }
}

/// Enumerate every tile intersecting `bbox` at `zoom`.
///
/// The result has no duplicates. Its order (row-major from the north-west
/// corner) is an implementation detail. Callers bounding the request size
/// should check [`TileRange::count`] first.
pub fn tiles_for_bbox(bbox: &GeoBoundingBox, zoom: u8) -> Result<Vec<TileCoordinate>> {
    Ok(TileRange::covering(bbox, zoom)?.tiles().collect())
}

/// Geographic bounds covered by a tile
#[must_use]
pub fn bounds_for_tile(tile: TileCoordinate) -> GeoBoundingBox {
    let n = tiles_per_side(tile.zoom) as f64;
    let lon = |x: f64| x / n * 360.0 - 180.0;
    let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();

    GeoBoundingBox::from_trusted(
        lon(f64::from(tile.x)),
        lat(f64::from(tile.y) + 1.0),
        lon(f64::from(tile.x) + 1.0),
        lat(f64::from(tile.y)),
    )
}

/// Tile extent in Web Mercator meters (EPSG:3857)
#[must_use]
pub fn mercator_bounds_for_tile(tile: TileCoordinate) -> MercatorBounds {
    let tile_span = 2.0 * HALF_EARTH / tiles_per_side(tile.zoom) as f64;

    let minx = -HALF_EARTH + f64::from(tile.x) * tile_span;
    let maxy = HALF_EARTH - f64::from(tile.y) * tile_span;

    MercatorBounds {
        minx,
        miny: maxy - tile_span,
        maxx: minx + tile_span,
        maxy,
    }
}
