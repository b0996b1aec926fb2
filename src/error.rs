//! Error taxonomy for the mosaicking pipeline
//!
//! Low-level TIFF parsing keeps the boxed [`AnyResult`] alias; everything that
//! crosses a module boundary is converted into a [`MosaicError`] so callers can
//! decide between skipping a task and failing a request.

use thiserror::Error;

/// Boxed error used by the byte-level COG parsing code
pub type AnyResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub type Result<T, E = MosaicError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MosaicError {
    /// Caller supplied a bounding box that is inverted or out of range
    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    /// Tile address outside the grid of its zoom level
    #[error("invalid tile {z}/{x}/{y}")]
    InvalidTile { z: u8, x: u32, y: u32 },

    /// Zoom level beyond the deepest level of the tile grid
    #[error("zoom {zoom} exceeds the maximum of {max}")]
    InvalidZoom { zoom: u8, max: u8 },

    /// The request would cover more tiles or pixels than the configured limits allow
    #[error("request too large: {0}")]
    RequestTooLarge(String),

    /// The scene catalog search itself failed (transport or HTTP status)
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The asset or the requested area has no imagery
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// The asset exists but could not be read or decoded
    #[error("asset server error: {0}")]
    AssetServerError(String),

    /// A band has no valid pixels or a zero-width percentile range
    #[error("degenerate rescale on band {band}: low={low}, high={high}")]
    DegenerateRescale { band: usize, low: f32, high: f32 },

    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking worker (decode, mosaic, encode) panicked or was cancelled
    #[error("worker task failed: {0}")]
    TaskFailed(String),
}

impl MosaicError {
    /// Whether a batch (series) render may drop the task that produced this
    /// error and keep going with its siblings
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            MosaicError::AssetNotFound(_)
                | MosaicError::AssetServerError(_)
                | MosaicError::DegenerateRescale { .. }
                | MosaicError::TaskFailed(_)
        )
    }

    pub(crate) fn server(source: &str, err: impl std::fmt::Display) -> Self {
        MosaicError::AssetServerError(format!("{source}: {err}"))
    }

    /// Recover a `MosaicError` that travelled through an [`AnyResult`],
    /// otherwise classify the failure as a server error on `source`
    pub(crate) fn from_any(source: &str, err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        match err.downcast::<MosaicError>() {
            Ok(inner) => *inner,
            Err(other) => MosaicError::server(source, other),
        }
    }
}

impl From<tokio::task::JoinError> for MosaicError {
    fn from(err: tokio::task::JoinError) -> Self {
        MosaicError::TaskFailed(err.to_string())
    }
}

impl From<reqwest::Error> for MosaicError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status == reqwest::StatusCode::NOT_FOUND => {
                MosaicError::AssetNotFound(err.to_string())
            }
            _ => MosaicError::AssetServerError(err.to_string()),
        }
    }
}

impl From<object_store::Error> for MosaicError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => MosaicError::AssetNotFound(path),
            other => MosaicError::AssetServerError(other.to_string()),
        }
    }
}
