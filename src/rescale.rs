//! Radiometric rescaling of raw sensor values to 8-bit display RGB
//!
//! Two paths:
//! - [`rescale_percentile`]: per-band percentile stretch with nodata masked
//!   out of the statistics
//! - [`pansharpen_and_color`]: Brovey sharpening against a panchromatic band,
//!   bit-depth scaling, then the fixed colour formula

use image::{Rgb, RgbImage};
use tracing::debug;

use crate::color::apply_formula;
use crate::config::{ColorFormula, PipelineConfig};
use crate::error::{MosaicError, Result};
use crate::raster::RawTile;
use crate::scene::SceneRecord;

/// Linear-interpolated percentile of sorted values, `pct` in `[0, 100]`
fn percentile(sorted: &[f32], pct: f32) -> f32 {
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let below = rank.floor() as usize;
    let above = rank.ceil() as usize;
    sorted[below] + (sorted[above] - sorted[below]) * (rank - below as f32)
}

/// Output value of masked pixels: the nodata sentinel clipped to 8 bits
fn masked_fill(raw: &RawTile) -> u8 {
    raw.nodata.map_or(0, |v| if v.is_nan() { 0 } else { v.clamp(0.0, 255.0) as u8 })
}

/// Stretch one band so `[low, high]` percentiles map onto `[0, 255]`
fn stretch_band(raw: &RawTile, band: usize, low_pct: f32, high_pct: f32) -> Result<Vec<u8>> {
    let view = raw.band(band);
    let mut valid: Vec<f32> = view.iter().copied().filter(|&v| raw.is_valid(v)).collect();
    if valid.is_empty() {
        return Err(MosaicError::DegenerateRescale { band, low: f32::NAN, high: f32::NAN });
    }
    valid.sort_unstable_by(f32::total_cmp);

    let low = percentile(&valid, low_pct);
    let high = percentile(&valid, high_pct);
    if high <= low {
        return Err(MosaicError::DegenerateRescale { band, low, high });
    }

    let fill = masked_fill(raw);
    let span = high - low;
    Ok(view
        .iter()
        .map(|&v| {
            if raw.is_valid(v) {
                ((v - low) * 255.0 / span).clamp(0.0, 255.0) as u8
            } else {
                fill
            }
        })
        .collect())
}

fn compose(width: usize, height: usize, channels: [Vec<u8>; 3]) -> RgbImage {
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([channels[0][i], channels[1][i], channels[2][i]])
    })
}

/// Percentile stretch of the three bands at `bands` (R, G, B source indices).
///
/// A band with no valid pixels or a zero-width percentile range renders as 0
/// (masked pixels still get the nodata fill).
#[must_use]
pub fn rescale_percentile(raw: &RawTile, bands: [usize; 3], low_pct: f32, high_pct: f32) -> RgbImage {
    let channels = bands.map(|band| {
        stretch_band(raw, band, low_pct, high_pct).unwrap_or_else(|e| {
            debug!(error = %e, "Falling back to a zero band");
            let fill = masked_fill(raw);
            raw.band(band)
                .iter()
                .map(|&v| if raw.is_valid(v) { 0 } else { fill })
                .collect()
        })
    });
    compose(raw.width(), raw.height(), channels)
}

/// Brovey sharpening of the `rgb` bands of `multispectral` against `pan`,
/// scaled from `bits` of native depth to 8 bits, optionally colour corrected.
///
/// The output has the panchromatic grid; the multispectral tile is sampled by
/// nearest neighbour when it is coarser. Pixels invalid in either input are black.
#[must_use]
pub fn pansharpen_and_color(
    multispectral: &RawTile,
    pan: &RawTile,
    rgb: [usize; 3],
    bits: u8,
    needs_color: bool,
    formula: &ColorFormula,
) -> RgbImage {
    let max_value = ((1_u64 << bits.clamp(1, 32)) - 1) as f32;
    let weight = formula.brovey_weight;
    let (width, height) = (pan.width(), pan.height());
    let (ms_width, ms_height) = (multispectral.width(), multispectral.height());

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let (mx, my) = (x * ms_width / width, y * ms_height / height);
        let bands = rgb.map(|b| multispectral.sample(b, mx, my).unwrap_or(f32::NAN));
        let p = pan.sample(0, x, y).unwrap_or(f32::NAN);
        if !pan.is_valid(p) || bands.iter().any(|&v| !multispectral.is_valid(v)) {
            return Rgb([0, 0, 0]);
        }

        let [r, g, b] = bands;
        let intensity = (r + g + b * weight) / (2.0 + weight);
        let ratio = if intensity > 0.0 { p / intensity } else { 0.0 };
        let scaled = bands.map(|c| (c * ratio).clamp(0.0, max_value) / max_value);

        let display = if needs_color { apply_formula(scaled, formula) } else { scaled };
        Rgb(display.map(|c| (c * 255.0).clamp(0.0, 255.0) as u8))
    })
}

/// Render a fetched scene window the way its metadata asks for
#[must_use]
pub fn render_scene(scene: &SceneRecord, raw: &RawTile, pan: Option<&RawTile>, config: &PipelineConfig) -> RgbImage {
    let rgb = scene.band_spectrum.rgb_indices(raw.band_count());
    match pan {
        Some(pan) => pansharpen_and_color(
            raw,
            pan,
            rgb,
            scene.bits_per_pixel,
            !scene.image_representation.is_plain_rgb(),
            &config.color,
        ),
        None => rescale_percentile(raw, rgb, config.percentile_low, config.percentile_high),
    }
}
