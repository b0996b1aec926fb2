pub mod projection;

use serde::{Deserialize, Serialize};

use crate::error::{MosaicError, Result};

/// Geographic bounding box in EPSG:4326 degrees.
///
/// Validated once at construction: `west < east`, `south < north` and every
/// coordinate inside the valid lon/lat range. The tile math and the mosaic
/// code take an already validated box and never re-check it.
///
/// # Example
///
/// ```rust
/// use scenetile::GeoBoundingBox;
///
/// let bbox = GeoBoundingBox::new(-105.1, 39.9, -105.0, 40.0).unwrap();
/// assert!(bbox.width() > 0.0);
///
/// assert!(GeoBoundingBox::new(10.0, 0.0, 5.0, 1.0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBoundingBox")]
pub struct GeoBoundingBox {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

/// Unchecked wire form, only ever turned into a box through [`GeoBoundingBox::new`]
#[derive(Deserialize)]
struct RawBoundingBox {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl TryFrom<RawBoundingBox> for GeoBoundingBox {
    type Error = MosaicError;

    fn try_from(raw: RawBoundingBox) -> Result<Self> {
        Self::new(raw.west, raw.south, raw.east, raw.north)
    }
}

impl GeoBoundingBox {
    /// Create a validated bounding box
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        let coords = [west, south, east, north];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "non-finite coordinate in {coords:?}"
            )));
        }
        if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "longitude out of range: west={west}, east={east}"
            )));
        }
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "latitude out of range: south={south}, north={north}"
            )));
        }
        if west >= east {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "west ({west}) must be less than east ({east})"
            )));
        }
        if south >= north {
            return Err(MosaicError::InvalidBoundingBox(format!(
                "south ({south}) must be less than north ({north})"
            )));
        }
        Ok(Self { west, south, east, north })
    }

    /// Build from a `[west, south, east, north]` slice as found in STAC items
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        match values {
            [w, s, e, n] => Self::new(*w, *s, *e, *n),
            // 3D bboxes: [w, s, zmin, e, n, zmax]
            [w, s, _, e, n, _] => Self::new(*w, *s, *e, *n),
            _ => Err(MosaicError::InvalidBoundingBox(format!(
                "expected 4 or 6 values, got {}",
                values.len()
            ))),
        }
    }

    #[inline]
    #[must_use]
    pub fn west(&self) -> f64 {
        self.west
    }

    #[inline]
    #[must_use]
    pub fn south(&self) -> f64 {
        self.south
    }

    #[inline]
    #[must_use]
    pub fn east(&self) -> f64 {
        self.east
    }

    #[inline]
    #[must_use]
    pub fn north(&self) -> f64 {
        self.north
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// True when the two boxes share some area (touching edges do not count)
    #[must_use]
    pub fn intersects(&self, other: &GeoBoundingBox) -> bool {
        self.west < other.east
            && other.west < self.east
            && self.south < other.north
            && other.south < self.north
    }

    /// True when `other` lies entirely inside `self`
    #[must_use]
    pub fn contains(&self, other: &GeoBoundingBox) -> bool {
        self.west <= other.west
            && self.east >= other.east
            && self.south <= other.south
            && self.north >= other.north
    }

    /// Smallest box covering both inputs
    #[must_use]
    pub fn union(&self, other: &GeoBoundingBox) -> GeoBoundingBox {
        GeoBoundingBox {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    /// `[west, south, east, north]`, the STAC search order
    #[must_use]
    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    /// Unchecked constructor for boxes derived from already valid geometry
    /// (tile bounds)
    pub(crate) fn from_trusted(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self { west, south, east, north }
    }
}
