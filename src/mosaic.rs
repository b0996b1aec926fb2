//! Stitching rescaled tiles into one canvas and cropping it to a bbox
//!
//! The canvas covers the tile range `min_x..=max_x` x `min_y..=max_y`; row 0 is
//! its northern edge. Cropping happens in Web Mercator metres, where the canvas
//! is linear in both axes, so a bbox equal to the canvas bounds keeps every pixel.

use image::{RgbImage, imageops};
use tracing::debug;

use crate::error::{MosaicError, Result};
use crate::geometry::GeoBoundingBox;
use crate::geometry::projection::{lat_to_merc_y, lon_to_merc_x};
use crate::raster::RescaledTile;
use crate::tile_math::{MercatorBounds, TileCoordinate, mercator_bounds_for_tile};

/// Slack when snapping fractional crop edges to whole pixels
const PIXEL_EPSILON: f64 = 1e-6;

/// Largest canvas `assemble` will allocate (3 bytes per pixel)
pub const MAX_CANVAS_PIXELS: u64 = 1 << 30;

/// Pixel length of `tiles` tiles of `tile_size`, if it fits an image side
fn canvas_side(tiles: u64, tile_size: u32) -> Option<u32> {
    tiles
        .checked_mul(u64::from(tile_size))
        .and_then(|v| u32::try_from(v).ok())
}

/// Pixel rectangle `(left, top, width, height)` of `bbox` on a canvas of
/// `canvas_width` x `canvas_height` pixels spanning `bounds`
fn crop_window(
    bounds: &MercatorBounds,
    canvas_width: u32,
    canvas_height: u32,
    bbox: &GeoBoundingBox,
) -> (u32, u32, u32, u32) {
    let x_scale = f64::from(canvas_width) / (bounds.maxx - bounds.minx);
    let y_scale = f64::from(canvas_height) / (bounds.maxy - bounds.miny);

    let left = (lon_to_merc_x(bbox.west()) - bounds.minx) * x_scale;
    let right = (lon_to_merc_x(bbox.east()) - bounds.minx) * x_scale;
    let top = (bounds.maxy - lat_to_merc_y(bbox.north())) * y_scale;
    let bottom = (bounds.maxy - lat_to_merc_y(bbox.south())) * y_scale;

    let snap = |start: f64, end: f64, limit: u32| -> (u32, u32) {
        let limit = f64::from(limit);
        let start = (start + PIXEL_EPSILON).floor().clamp(0.0, limit - 1.0);
        let end = (end - PIXEL_EPSILON).ceil().clamp(start + 1.0, limit);
        (start as u32, (end - start) as u32)
    };
    let (left, width) = snap(left, right, canvas_width);
    let (top, height) = snap(top, bottom, canvas_height);
    (left, top, width, height)
}

/// Paste `tiles` onto one canvas and crop it to `bbox`.
///
/// All tiles must share a zoom level. Tiles absent from the range leave black
/// gaps. Fails with `AssetNotFound` when there is nothing to assemble and with
/// `RequestTooLarge` when the canvas would exceed [`MAX_CANVAS_PIXELS`].
pub fn assemble(tiles: Vec<RescaledTile>, bbox: &GeoBoundingBox, tile_size: u32) -> Result<RgbImage> {
    if tile_size == 0 {
        return Err(MosaicError::Config("tile_size must be positive".to_string()));
    }
    let Some(first) = tiles.first() else {
        return Err(MosaicError::AssetNotFound(format!("no imagery for {bbox:?}")));
    };
    let zoom = first.tile.zoom;
    if let Some(other) = tiles.iter().find(|t| t.tile.zoom != zoom) {
        let TileCoordinate { zoom: z, x, y } = other.tile;
        return Err(MosaicError::InvalidTile { z, x, y });
    }

    let min_x = tiles.iter().map(|t| t.tile.x).min().unwrap_or(0);
    let max_x = tiles.iter().map(|t| t.tile.x).max().unwrap_or(0);
    let min_y = tiles.iter().map(|t| t.tile.y).min().unwrap_or(0);
    let max_y = tiles.iter().map(|t| t.tile.y).max().unwrap_or(0);

    let columns = u64::from(max_x - min_x) + 1;
    let rows = u64::from(max_y - min_y) + 1;
    let (canvas_width, canvas_height) = match (canvas_side(columns, tile_size), canvas_side(rows, tile_size)) {
        (Some(w), Some(h)) if u64::from(w) * u64::from(h) <= MAX_CANVAS_PIXELS => (w, h),
        _ => {
            return Err(MosaicError::RequestTooLarge(format!(
                "{columns} x {rows} tiles of {tile_size} px exceed {MAX_CANVAS_PIXELS} pixels"
            )));
        }
    };
    let mut canvas = RgbImage::new(canvas_width, canvas_height);

    for tile in &tiles {
        let offset_x = i64::from((tile.tile.x - min_x) * tile_size);
        let offset_y = i64::from((tile.tile.y - min_y) * tile_size);
        imageops::replace(&mut canvas, &tile.image, offset_x, offset_y);
    }

    let north_west = mercator_bounds_for_tile(TileCoordinate { zoom, x: min_x, y: min_y });
    let south_east = mercator_bounds_for_tile(TileCoordinate { zoom, x: max_x, y: max_y });
    let bounds = MercatorBounds {
        minx: north_west.minx,
        miny: south_east.miny,
        maxx: south_east.maxx,
        maxy: north_west.maxy,
    };

    let (left, top, width, height) = crop_window(&bounds, canvas_width, canvas_height, bbox);
    debug!(
        tiles = tiles.len(),
        canvas_width,
        canvas_height,
        left,
        top,
        width,
        height,
        "Assembled mosaic"
    );
    Ok(imageops::crop_imm(&canvas, left, top, width, height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile_math::{bounds_for_tile, tiles_for_bbox};
    use chrono::Utc;
    use image::Rgb;

    fn solid(tile: TileCoordinate, size: u32, value: u8) -> RescaledTile {
        RescaledTile {
            tile,
            scene_id: "scene".to_string(),
            timestamp: Utc::now(),
            image: RgbImage::from_pixel(size, size, Rgb([value, value, value])),
        }
    }

    #[test]
    fn test_single_tile_cropped_to_own_bounds() {
        let tile = TileCoordinate::new(14, 3410, 6205).unwrap();
        let image = assemble(vec![solid(tile, 256, 9)], &bounds_for_tile(tile), 256).unwrap();
        assert_eq!(image.dimensions(), (256, 256));
        assert!(image.pixels().all(|p| p.0 == [9, 9, 9]));
    }

    #[test]
    fn test_tiles_pasted_at_grid_offsets() {
        let bbox = GeoBoundingBox::new(-105.1, 39.9, -105.0, 40.0).unwrap();
        let tiles = tiles_for_bbox(&bbox, 14).unwrap();
        let min_x = tiles.iter().map(|t| t.x).min().unwrap();
        let min_y = tiles.iter().map(|t| t.y).min().unwrap();
        let union = tiles
            .iter()
            .map(|t| bounds_for_tile(*t))
            .reduce(|a, b| a.union(&b))
            .unwrap();

        let rescaled = tiles
            .iter()
            .map(|t| solid(*t, 16, (10 * (t.x - min_x) + (t.y - min_y)) as u8))
            .collect();
        let image = assemble(rescaled, &union, 16).unwrap();

        // 6 x 7 tiles, nothing cropped
        assert_eq!(image.dimensions(), (6 * 16, 7 * 16));
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(16 * 2 + 3, 16 * 4 + 3)[0], 24);
        assert_eq!(image.get_pixel(6 * 16 - 1, 7 * 16 - 1)[0], 56);
    }

    #[test]
    fn test_crop_keeps_north_at_row_zero() {
        // Two tiles stacked vertically; crop to the northern half of the upper one
        let north = TileCoordinate::new(10, 200, 300).unwrap();
        let south = TileCoordinate::new(10, 200, 301).unwrap();
        let nb = bounds_for_tile(north);
        let mid_lat = crate::geometry::projection::merc_y_to_lat(
            (lat_to_merc_y(nb.north()) + lat_to_merc_y(nb.south())) / 2.0,
        );
        let bbox = GeoBoundingBox::new(nb.west(), mid_lat, nb.east(), nb.north()).unwrap();

        let image = assemble(vec![solid(north, 64, 200), solid(south, 64, 50)], &bbox, 64).unwrap();
        assert_eq!(image.dimensions(), (64, 32));
        assert!(image.pixels().all(|p| p[0] == 200), "crop must come from the northern tile");
    }

    #[test]
    fn test_missing_tile_leaves_gap() {
        let a = TileCoordinate::new(5, 10, 10).unwrap();
        let b = TileCoordinate::new(5, 11, 11).unwrap();
        let bbox = bounds_for_tile(a).union(&bounds_for_tile(b));
        let image = assemble(vec![solid(a, 8, 100), solid(b, 8, 100)], &bbox, 8).unwrap();
        assert_eq!(image.dimensions(), (16, 16));
        assert_eq!(image.get_pixel(12, 2).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(2, 2).0, [100, 100, 100]);
    }

    #[test]
    fn test_oversized_canvas_rejected_before_allocation() {
        // Opposite corners of the zoom 18 grid
        let a = TileCoordinate::new(18, 0, 0).unwrap();
        let b = TileCoordinate::new(18, (1 << 18) - 1, (1 << 18) - 1).unwrap();
        let bbox = GeoBoundingBox::new(-180.0, -80.0, 180.0, 80.0).unwrap();
        let err = assemble(vec![solid(a, 1, 0), solid(b, 1, 0)], &bbox, 256).unwrap_err();
        assert!(matches!(err, MosaicError::RequestTooLarge(_)), "{err:?}");

        // Fits u32 per side but not the pixel budget
        let c = TileCoordinate::new(18, 4096, 4096).unwrap();
        let err = assemble(vec![solid(a, 1, 0), solid(c, 1, 0)], &bbox, 256).unwrap_err();
        assert!(matches!(err, MosaicError::RequestTooLarge(_)), "{err:?}");
    }

    #[test]
    fn test_canvas_side_overflow() {
        assert_eq!(canvas_side(6, 256), Some(1536));
        assert_eq!(canvas_side(1 << 24, 256), None);
        assert_eq!(canvas_side(u64::MAX, 2), None);
    }

    #[test]
    fn test_empty_and_mixed_zoom_rejected() {
        let bbox = GeoBoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        assert!(matches!(assemble(Vec::new(), &bbox, 256), Err(MosaicError::AssetNotFound(_))));

        let tiles = vec![
            solid(TileCoordinate::new(3, 1, 1).unwrap(), 4, 0),
            solid(TileCoordinate::new(4, 1, 1).unwrap(), 4, 0),
        ];
        assert!(matches!(assemble(tiles, &bbox, 4), Err(MosaicError::InvalidTile { z: 4, .. })));
    }
}
