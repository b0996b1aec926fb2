use chrono::{DateTime, Utc};
use image::RgbImage;
use ndarray::{Array3, ArrayView2};

use crate::tile_math::TileCoordinate;

/// Raw sensor values of one window, band-major `(band, row, col)`
#[derive(Debug, Clone)]
pub struct RawTile {
    pub data: Array3<f32>,
    /// Declared nodata of the source; pixels outside the footprint carry it,
    /// or NaN when the source declares none
    pub nodata: Option<f64>,
}

impl RawTile {
    #[must_use]
    pub fn new(data: Array3<f32>, nodata: Option<f64>) -> Self {
        Self { data, nodata }
    }

    /// A tile with every pixel set to `value`
    #[must_use]
    pub fn filled(bands: usize, width: usize, height: usize, value: f32, nodata: Option<f64>) -> Self {
        Self::new(Array3::from_elem((bands, height, width), value), nodata)
    }

    #[must_use]
    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// View of one band, clamped to the last band
    #[must_use]
    pub fn band(&self, band: usize) -> ArrayView2<'_, f32> {
        let band = band.min(self.band_count().saturating_sub(1));
        self.data.index_axis(ndarray::Axis(0), band)
    }

    #[must_use]
    pub fn sample(&self, band: usize, x: usize, y: usize) -> Option<f32> {
        self.data.get([band, y, x]).copied()
    }

    /// Whether `value` is real data: not NaN and not the nodata sentinel
    #[must_use]
    pub fn is_valid(&self, value: f32) -> bool {
        !value.is_nan() && self.nodata.is_none_or(|nodata| f64::from(value) != nodata)
    }
}

/// An 8-bit RGB tile ready to be pasted into a mosaic
#[derive(Debug, Clone)]
pub struct RescaledTile {
    pub tile: TileCoordinate,
    pub scene_id: String,
    pub timestamp: DateTime<Utc>,
    pub image: RgbImage,
}
