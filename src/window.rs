//! Windowed reads with reprojection
//!
//! An [`OutputGrid`] describes the pixels a caller wants (a map tile or a bbox
//! crop, both in Web Mercator). Every output pixel centre is mapped into the
//! source raster, the coarsest overview that still resolves the output is
//! picked, only the blocks the window touches are fetched (concurrently,
//! through the block cache), and pixels are filled by nearest neighbour.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use futures::future::try_join_all;
use ndarray::Array3;
use tracing::debug;

use crate::cache::{BlockCache, BlockKey};
use crate::cog_reader::{CogHeader, CogReader, GeoTransform};
use crate::error::{MosaicError, Result};
use crate::geometry::GeoBoundingBox;
use crate::geometry::projection::{EPSG_WEB_MERCATOR, Reprojector, lat_to_merc_y, lon_to_merc_x};
use crate::raster::RawTile;
use crate::tile_math::{MercatorBounds, TileCoordinate, mercator_bounds_for_tile};

/// Spacing (in output pixels) of exactly transformed nodes when `proj4rs` is
/// involved; pixels in between are interpolated bilinearly
const INTERPOLATION_STEP: usize = 16;

/// Regular north-up grid of output pixels
#[derive(Debug, Clone, PartialEq)]
pub struct OutputGrid {
    pub crs: i32,
    /// Top-left corner
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
}

impl OutputGrid {
    #[must_use]
    pub fn from_mercator_bounds(bounds: &MercatorBounds, width: usize, height: usize) -> Self {
        Self {
            crs: EPSG_WEB_MERCATOR,
            origin_x: bounds.minx,
            origin_y: bounds.maxy,
            pixel_width: (bounds.maxx - bounds.minx) / width as f64,
            pixel_height: (bounds.maxy - bounds.miny) / height as f64,
            width,
            height,
        }
    }

    #[must_use]
    pub fn for_tile(tile: TileCoordinate, tile_size: usize) -> Self {
        Self::from_mercator_bounds(&mercator_bounds_for_tile(tile), tile_size, tile_size)
    }

    /// Web Mercator grid over a geographic bbox
    #[must_use]
    pub fn for_bbox(bbox: &GeoBoundingBox, width: usize, height: usize) -> Self {
        let bounds = MercatorBounds {
            minx: lon_to_merc_x(bbox.west()),
            miny: lat_to_merc_y(bbox.south()),
            maxx: lon_to_merc_x(bbox.east()),
            maxy: lat_to_merc_y(bbox.north()),
        };
        Self::from_mercator_bounds(&bounds, width, height)
    }

    /// World position of a (fractional) pixel position
    fn position(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y - row * self.pixel_height,
        )
    }
}

/// Full-resolution source pixel position of every output pixel centre,
/// row-major. NaN marks a position that could not be transformed.
fn source_positions(grid: &OutputGrid, source_crs: i32, transform: &GeoTransform) -> Result<Vec<(f64, f64)>, String> {
    let reprojector = Reprojector::new(grid.crs, source_crs)?;
    let exact = |col: f64, row: f64| -> (f64, f64) {
        let (x, y) = grid.position(col, row);
        reprojector
            .transform(x, y)
            .ok()
            .and_then(|(sx, sy)| transform.world_to_pixel(sx, sy))
            .unwrap_or((f64::NAN, f64::NAN))
    };

    let mut positions = Vec::with_capacity(grid.width * grid.height);
    if !reprojector.uses_proj() {
        for row in 0..grid.height {
            for col in 0..grid.width {
                positions.push(exact(col as f64 + 0.5, row as f64 + 0.5));
            }
        }
        return Ok(positions);
    }

    let node_cols = node_positions(grid.width);
    let node_rows = node_positions(grid.height);
    let nodes: Vec<(f64, f64)> = node_rows
        .iter()
        .flat_map(|&v| node_cols.iter().map(move |&u| (u, v)))
        .map(|(u, v)| exact(u, v))
        .collect();
    let stride = node_cols.len();

    for row in 0..grid.height {
        let v = row as f64 + 0.5;
        let (j, tv) = locate(&node_rows, v);
        for col in 0..grid.width {
            let u = col as f64 + 0.5;
            let (i, tu) = locate(&node_cols, u);
            let corner = |dj: usize, di: usize| nodes[(j + dj) * stride + i + di];
            let lerp = |a: (f64, f64), b: (f64, f64), t: f64| (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t);
            let top = lerp(corner(0, 0), corner(0, 1), tu);
            let bottom = lerp(corner(1, 0), corner(1, 1), tu);
            positions.push(lerp(top, bottom, tv));
        }
    }
    Ok(positions)
}

/// Node offsets `0, STEP, 2*STEP, ..., extent`
fn node_positions(extent: usize) -> Vec<f64> {
    let cells = extent.div_ceil(INTERPOLATION_STEP).max(1);
    (0..=cells)
        .map(|i| (i * INTERPOLATION_STEP).min(extent) as f64)
        .collect()
}

/// Cell index and fractional offset of `value` among the nodes
fn locate(nodes: &[f64], value: f64) -> (usize, f64) {
    let last_cell = nodes.len().saturating_sub(2);
    let cell = ((value / INTERPOLATION_STEP as f64) as usize).min(last_cell);
    let span = nodes[cell + 1] - nodes[cell];
    let t = if span > 0.0 { (value - nodes[cell]) / span } else { 0.0 };
    (cell, t)
}

/// Full-resolution source pixels covered by one output pixel, measured across
/// the middle row and column of the window
fn source_pixels_per_output(positions: &[(f64, f64)], width: usize, height: usize) -> f64 {
    let distance = |a: (f64, f64), b: (f64, f64), steps: usize| {
        ((b.0 - a.0).hypot(b.1 - a.1)) / steps as f64
    };
    let mut ratios = Vec::with_capacity(2);
    if width > 1 {
        let row = height / 2;
        ratios.push(distance(positions[row * width], positions[row * width + width - 1], width - 1));
    }
    if height > 1 {
        let col = width / 2;
        ratios.push(distance(positions[col], positions[(height - 1) * width + col], height - 1));
    }
    ratios
        .into_iter()
        .filter(|r| r.is_finite() && *r > 0.0)
        .fold(None, |min: Option<f64>, r| Some(min.map_or(r, |m| m.min(r))))
        .unwrap_or(1.0)
}

async fn cached_block(cog: &CogReader, cache: &BlockCache, level: usize, index: usize) -> Result<(usize, Arc<Vec<f32>>)> {
    let key = BlockKey::new(cog.identifier(), level, index);
    if let Some(block) = cache.get(&key) {
        return Ok((index, block));
    }
    let block = Arc::new(cog.read_block(level, index).await?);
    cache.insert(key, Arc::clone(&block));
    Ok((index, block))
}

fn georeferencing(header: &CogHeader, source: &str) -> Result<(i32, GeoTransform)> {
    let crs = header
        .crs_code
        .ok_or_else(|| MosaicError::server(source, "raster has no EPSG code in its GeoKeys"))?;
    let transform = header
        .geo_transform
        .ok_or_else(|| MosaicError::server(source, "raster has no geotransform"))?;
    Ok((crs, transform))
}

/// Read `grid` out of `cog`: all bands, nearest neighbour.
///
/// Pixels outside the raster footprint hold the source nodata value (NaN when
/// the source declares none).
pub async fn read_window(cog: &CogReader, cache: &BlockCache, grid: &OutputGrid) -> Result<RawTile> {
    let header = cog.header();
    let (source_crs, transform) = georeferencing(header, cog.identifier())?;
    let bands = header.bands;
    let fill = header.fill_value();

    // The reprojector lives only inside this synchronous call
    let positions = source_positions(grid, source_crs, &transform)
        .map_err(|e| MosaicError::server(cog.identifier(), e))?;

    let level = header.best_level_for(source_pixels_per_output(&positions, grid.width, grid.height));
    let (scale_x, scale_y) = header.level_scale(level);
    let lvl = &header.levels[level];

    let mut lookups: Vec<Option<(usize, usize)>> = Vec::with_capacity(positions.len());
    let mut needed: AHashSet<usize> = AHashSet::new();
    for &(col, row) in &positions {
        let (px, py) = ((col / scale_x).floor(), (row / scale_y).floor());
        if !(px >= 0.0 && py >= 0.0 && px < lvl.width as f64 && py < lvl.height as f64) {
            lookups.push(None);
            continue;
        }
        let (px, py) = (px as usize, py as usize);
        if let Some(index) = lvl.block_index(px, py) {
            needed.insert(index);
            lookups.push(Some((px, py)));
        } else {
            lookups.push(None);
        }
    }

    let mut data = Array3::from_elem((bands, grid.height, grid.width), fill);
    if needed.is_empty() {
        debug!(source = cog.identifier(), "Window outside raster footprint");
        return Ok(RawTile::new(data, header.nodata));
    }

    debug!(
        source = cog.identifier(),
        level,
        blocks = needed.len(),
        "Reading window"
    );
    let blocks: AHashMap<usize, Arc<Vec<f32>>> =
        try_join_all(needed.iter().map(|&index| cached_block(cog, cache, level, index)))
            .await?
            .into_iter()
            .collect();

    for (pixel, lookup) in lookups.iter().enumerate() {
        let Some((px, py)) = *lookup else {
            continue;
        };
        let Some(index) = lvl.block_index(px, py) else {
            continue;
        };
        let Some(block) = blocks.get(&index) else {
            continue;
        };
        let (block_x, block_y) = lvl.block_origin(index);
        let offset = ((py - block_y) * lvl.block_width + (px - block_x)) * bands;
        let (row, col) = (pixel / grid.width, pixel % grid.width);
        for band in 0..bands {
            if let Some(&value) = block.get(offset + band) {
                data[[band, row, col]] = value;
            }
        }
    }

    Ok(RawTile::new(data, header.nodata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog_reader::test_support::TestCog;
    use crate::range_reader::{MemoryRangeReader, RangeReader};

    async fn open(cog: &TestCog) -> CogReader {
        let reader: Arc<dyn RangeReader> = Arc::new(MemoryRangeReader::new("mem://window.tif", cog.build()));
        CogReader::open(reader).await.unwrap()
    }

    /// 64x64 Web Mercator raster with 10 m pixels whose value encodes its position
    fn mercator_cog() -> TestCog {
        let mut cog = TestCog::from_fn(64, 64, 2, |x, y, b| (x + y * 100 + b * 10_000) as u16);
        cog.origin = (1_000.0, 2_000.0);
        cog.pixel_size = (10.0, 10.0);
        cog
    }

    #[tokio::test]
    async fn test_identity_window_reads_exact_pixels() {
        let reader = open(&mercator_cog()).await;
        let cache = BlockCache::new(0);
        // 8x8 output over source pixels 20..28 x 30..38
        let bounds = MercatorBounds { minx: 1_200.0, miny: 1_620.0, maxx: 1_280.0, maxy: 1_700.0 };
        let grid = OutputGrid::from_mercator_bounds(&bounds, 8, 8);

        let tile = read_window(&reader, &cache, &grid).await.unwrap();
        assert_eq!((tile.band_count(), tile.width(), tile.height()), (2, 8, 8));
        assert_eq!(tile.sample(0, 0, 0), Some((20 + 30 * 100) as f32));
        assert_eq!(tile.sample(0, 7, 7), Some((27 + 37 * 100) as f32));
        assert_eq!(tile.sample(1, 3, 2), Some((23 + 32 * 100 + 10_000) as f32));
        // Window spans four 16px blocks: 16..32 x 16..32 and 16..32 x 32..48
        assert!(cache.size_bytes() > 0);
    }

    #[tokio::test]
    async fn test_window_outside_footprint_is_filled() {
        let mut cog = mercator_cog();
        cog.nodata = Some(0.0);
        let reader = open(&cog).await;
        let bounds = MercatorBounds { minx: -5_000.0, miny: -5_000.0, maxx: -4_000.0, maxy: -4_000.0 };
        let grid = OutputGrid::from_mercator_bounds(&bounds, 4, 4);

        let tile = read_window(&reader, &BlockCache::new(0), &grid).await.unwrap();
        assert!(tile.data.iter().all(|&v| v == 0.0));
        assert_eq!(tile.nodata, Some(0.0));
    }

    #[tokio::test]
    async fn test_partial_overlap_without_nodata_is_nan() {
        let reader = open(&mercator_cog()).await;
        // Left half of the window lies west of the raster
        let bounds = MercatorBounds { minx: 920.0, miny: 1_920.0, maxx: 1_000.0 + 80.0, maxy: 2_000.0 };
        let grid = OutputGrid::from_mercator_bounds(&bounds, 16, 8);

        let tile = read_window(&reader, &BlockCache::new(0), &grid).await.unwrap();
        assert!(tile.sample(0, 0, 0).unwrap().is_nan());
        assert_eq!(tile.sample(0, 8, 0), Some(0.0));
        assert_eq!(tile.sample(0, 15, 7), Some((7 + 7 * 100) as f32));
    }

    #[tokio::test]
    async fn test_coarse_window_uses_overview() {
        let mut cog = mercator_cog();
        cog.overviews = 2;
        let reader = open(&cog).await;
        // 16 output pixels over the full 640 m raster: 4 source pixels each
        let bounds = MercatorBounds { minx: 1_000.0, miny: 1_360.0, maxx: 1_640.0, maxy: 2_000.0 };
        let grid = OutputGrid::from_mercator_bounds(&bounds, 16, 16);

        let tile = read_window(&reader, &BlockCache::new(0), &grid).await.unwrap();
        // Level 2 pixel (1, 1) is full-res pixel (4, 4)
        assert_eq!(tile.sample(0, 1, 1), Some(404.0));
    }

    #[tokio::test]
    async fn test_missing_georeferencing_is_server_error() {
        let mut cog = mercator_cog();
        cog.epsg = 32767;
        let reader = open(&cog).await;
        let grid = OutputGrid::for_tile(TileCoordinate::new(0, 0, 0).unwrap(), 4);
        let err = read_window(&reader, &BlockCache::new(0), &grid).await.unwrap_err();
        assert!(matches!(err, MosaicError::AssetServerError(_)), "{err:?}");
    }

    #[test]
    fn test_interpolated_positions_follow_exact_transform() {
        let transform = GeoTransform { a: 10.0, b: 0.0, c: 480_000.0, d: 0.0, e: -10.0, f: 4_430_000.0 };
        let tile = TileCoordinate::new(14, 3410, 6205).unwrap();
        let grid = OutputGrid::for_tile(tile, 64);
        let positions = source_positions(&grid, 32613, &transform).unwrap();

        let reprojector = Reprojector::new(EPSG_WEB_MERCATOR, 32613).unwrap();
        for (col, row) in [(0, 0), (5, 37), (63, 63), (40, 9)] {
            let (x, y) = grid.position(col as f64 + 0.5, row as f64 + 0.5);
            let (sx, sy) = reprojector.transform(x, y).unwrap();
            let expected = transform.world_to_pixel(sx, sy).unwrap();
            let actual = positions[row * 64 + col];
            assert!((actual.0 - expected.0).abs() < 0.05, "col {col} row {row}: {actual:?} vs {expected:?}");
            assert!((actual.1 - expected.1).abs() < 0.05, "col {col} row {row}: {actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn test_grid_for_bbox_is_north_up() {
        let bbox = GeoBoundingBox::new(-105.1, 39.9, -105.0, 40.0).unwrap();
        let grid = OutputGrid::for_bbox(&bbox, 100, 100);
        let (x0, y0) = grid.position(0.0, 0.0);
        let (x1, y1) = grid.position(100.0, 100.0);
        assert!((x0 - lon_to_merc_x(-105.1)).abs() < 1e-6);
        assert!((y0 - lat_to_merc_y(40.0)).abs() < 1e-6);
        assert!((x1 - lon_to_merc_x(-105.0)).abs() < 1e-6);
        assert!((y1 - lat_to_merc_y(39.9)).abs() < 1e-6);
    }
}
