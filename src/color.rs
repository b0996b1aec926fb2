//! Display colour correction for non-RGB sources
//!
//! Operates on reflectance-like values in `[0, 1]`: per-channel gamma, a
//! sigmoidal contrast curve on all channels, then a saturation boost in LCH.

use crate::config::ColorFormula;

// D65 reference white
const WHITE_X: f32 = 0.950_47;
const WHITE_Y: f32 = 1.0;
const WHITE_Z: f32 = 1.088_83;

const LAB_EPSILON: f32 = 216.0 / 24_389.0;
const LAB_KAPPA: f32 = 24_389.0 / 27.0;

/// `value ^ (1 / gamma)`
#[must_use]
pub fn gamma(value: f32, gamma: f32) -> f32 {
    if gamma <= 0.0 || value <= 0.0 {
        return value.max(0.0);
    }
    value.powf(1.0 / gamma)
}

/// Sigmoidal contrast normalised so 0 and 1 stay fixed
#[must_use]
pub fn sigmoidal(value: f32, contrast: f32, bias: f32) -> f32 {
    if contrast == 0.0 {
        return value;
    }
    let logistic = |x: f32| 1.0 / (1.0 + (contrast * (bias - x)).exp());
    let low = logistic(0.0);
    let high = logistic(1.0);
    if contrast > 0.0 {
        (logistic(value) - low) / (high - low)
    } else {
        // Inverse curve flattens contrast
        let scaled = (high - low) * value + low;
        bias - (1.0 / scaled - 1.0).ln() / contrast
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 { c / 12.92 } else { ((c + 0.055) / 1.055).powf(2.4) }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 { c * 12.92 } else { 1.055 * c.powf(1.0 / 2.4) - 0.055 }
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON { t.cbrt() } else { (LAB_KAPPA * t + 16.0) / 116.0 }
}

fn lab_f_inv(t: f32) -> f32 {
    let cube = t * t * t;
    if cube > LAB_EPSILON { cube } else { (116.0 * t - 16.0) / LAB_KAPPA }
}

/// sRGB in `[0, 1]` to `(L, C, H)`, H in radians
fn rgb_to_lch([r, g, b]: [f32; 3]) -> [f32; 3] {
    let (r, g, b) = (srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b));
    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = 0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b;

    let (fx, fy, fz) = (lab_f(x / WHITE_X), lab_f(y / WHITE_Y), lab_f(z / WHITE_Z));
    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let b = 200.0 * (fy - fz);
    [l, a.hypot(b), b.atan2(a)]
}

fn lch_to_rgb([l, c, h]: [f32; 3]) -> [f32; 3] {
    let (a, b) = (c * h.cos(), c * h.sin());
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;
    let (x, y, z) = (lab_f_inv(fx) * WHITE_X, lab_f_inv(fy) * WHITE_Y, lab_f_inv(fz) * WHITE_Z);

    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z;
    let b = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;
    [linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b)]
}

/// Scale chroma by `proportion`
#[must_use]
pub fn saturate(rgb: [f32; 3], proportion: f32) -> [f32; 3] {
    let [l, c, h] = rgb_to_lch(rgb);
    lch_to_rgb([l, c * proportion, h]).map(|v| v.clamp(0.0, 1.0))
}

/// Apply the full formula to one pixel
#[must_use]
pub fn apply_formula(rgb: [f32; 3], formula: &ColorFormula) -> [f32; 3] {
    let gammas = [formula.gamma_red, formula.gamma_green, formula.gamma_blue];
    let mut out = [0.0; 3];
    for (channel, value) in rgb.iter().enumerate() {
        let corrected = gamma(value.clamp(0.0, 1.0), gammas[channel]);
        out[channel] = sigmoidal(corrected, formula.sigmoidal_contrast, formula.sigmoidal_bias).clamp(0.0, 1.0);
    }
    saturate(out, formula.saturation)
}
