//! Normalized scene metadata handed from the catalog to the fetch stage

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MosaicError;
use crate::geometry::GeoBoundingBox;

/// Imaging source family. Drives zoom policy, catalog collections and asset choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorKind {
    /// Sentinel-2 multispectral
    S2,
    /// Landsat 8/9
    L8,
    /// PlanetScope
    PD,
    /// WorldView, panchromatic-capable
    WV,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [SensorKind::S2, SensorKind::L8, SensorKind::PD, SensorKind::WV];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::S2 => "S2",
            SensorKind::L8 => "L8",
            SensorKind::PD => "PD",
            SensorKind::WV => "WV",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "S2" => Ok(SensorKind::S2),
            "L8" | "LS" => Ok(SensorKind::L8),
            "PD" => Ok(SensorKind::PD),
            "WV" => Ok(SensorKind::WV),
            other => Err(MosaicError::Config(format!("unknown sensor kind: {other}"))),
        }
    }
}

/// How the pixels of the primary asset are organised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageRepresentation {
    /// Display-ready red/green/blue
    Rgb,
    /// Multispectral bands that still need band selection and colour work
    Multi,
    /// Single band
    Mono,
    Other(String),
}

impl ImageRepresentation {
    /// Parse the NITF-style representation codes found in catalog properties
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "RGB" => ImageRepresentation::Rgb,
            "MULTI" => ImageRepresentation::Multi,
            "MONO" => ImageRepresentation::Mono,
            other => ImageRepresentation::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_plain_rgb(&self) -> bool {
        matches!(self, ImageRepresentation::Rgb)
    }
}

/// Ordered common band names of the primary asset (`"red"`, `"nir"`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandSpectrum(pub Vec<String>);

impl BandSpectrum {
    /// Band indices to render as red, green and blue.
    ///
    /// Uses the common names when all three are present, otherwise the first
    /// three bands, otherwise the first band repeated (grey).
    #[must_use]
    pub fn rgb_indices(&self, band_count: usize) -> [usize; 3] {
        let find = |name: &str| {
            self.0
                .iter()
                .position(|b| b.eq_ignore_ascii_case(name))
                .filter(|&i| i < band_count)
        };
        if let (Some(r), Some(g), Some(b)) = (find("red"), find("green"), find("blue")) {
            return [r, g, b];
        }
        if band_count >= 3 {
            [0, 1, 2]
        } else {
            [0, 0, 0]
        }
    }
}

/// One catalog hit, normalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub bbox: GeoBoundingBox,
    pub sensor_kind: SensorKind,
    pub processing_level: Option<String>,
    pub band_spectrum: BandSpectrum,
    pub asset_uri: String,
    pub panchromatic_uri: Option<String>,
    pub bits_per_pixel: u8,
    pub image_representation: ImageRepresentation,
    pub cloud_cover: Option<f64>,
}

impl SceneRecord {
    /// Pansharpening applies when a pan band exists and the asset is not
    /// already display RGB
    #[must_use]
    pub fn needs_pansharpening(&self) -> bool {
        self.panchromatic_uri.is_some() && !self.image_representation.is_plain_rgb()
    }

    /// Absolute distance to a requested timestamp, in seconds
    #[must_use]
    pub fn seconds_from(&self, timestamp: DateTime<Utc>) -> i64 {
        (self.timestamp - timestamp).num_seconds().abs()
    }
}

/// Pick the best scene for an area: footprint must intersect, then the
/// closest capture time wins, then the lower cloud cover.
#[must_use]
pub fn best_scene_for<'a>(
    scenes: &'a [SceneRecord],
    area: &GeoBoundingBox,
    timestamp: DateTime<Utc>,
) -> Option<&'a SceneRecord> {
    scenes
        .iter()
        .filter(|s| s.bbox.intersects(area))
        .min_by(|a, b| {
            a.seconds_from(timestamp)
                .cmp(&b.seconds_from(timestamp))
                .then_with(|| {
                    let ca = a.cloud_cover.unwrap_or(100.0);
                    let cb = b.cloud_cover.unwrap_or(100.0);
                    ca.total_cmp(&cb)
                })
        })
}
