//! # scenetile - Satellite scene tile mosaicking
//!
//! Builds display-ready RGB imagery for a geographic area and time from
//! Cloud Optimized GeoTIFF scenes listed in a STAC catalog, without GDAL.
//!
//! ## Features
//!
//! - **Scene discovery**: Paged STAC searches streamed into typed [`SceneRecord`]s
//! - **Range requests**: Block-level reads from local files, HTTP, or S3
//! - **Tile math**: Web Mercator XYZ tiling with exact bounds
//! - **Rescaling**: Percentile stretch, or Brovey pansharpening plus a fixed colour formula
//! - **Mosaics**: Tiles stitched and cropped to the requested box
//! - **Time series**: One frame per capture time, failed captures skipped
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scenetile::{GeoBoundingBox, MosaicPipeline, PipelineConfig, SensorKind};
//!
//! let pipeline = MosaicPipeline::new(PipelineConfig::from_env()?)?;
//! let bbox = GeoBoundingBox::new(-105.1, 39.9, -105.0, 40.0)?;
//!
//! let image = pipeline.fetch_bbox_at_time(SensorKind::S2, &bbox, timestamp).await?;
//! let frames = pipeline.fetch_series(SensorKind::S2, &bbox, start, end).await?;
//! let webp = pipeline.render_tile(SensorKind::S2, 14, 3410, 6205, timestamp).await?;
//! ```
//!
//! ## Architecture
//!
//! - [`tile_math`]: XYZ tile enumeration and bounds
//! - [`catalog`]: STAC search behind the [`SceneCatalog`] trait
//! - [`cog_reader`] / [`window`]: COG header parsing and reprojected window reads
//! - [`fetcher`]: Scene assets to [`RawTile`]s behind the [`TileSource`] trait
//! - [`rescale`] / [`color`]: Raw values to 8-bit RGB
//! - [`mosaic`]: Stitching and cropping
//! - [`pipeline`]: Concurrent orchestration and the public render calls

// ============================================================================
// Public modules
// ============================================================================

pub mod cache;
pub mod catalog;
pub mod cog_reader;
pub mod color;
pub mod config;
pub mod encode;
pub mod error;
pub mod fetcher;
pub mod geometry;
pub mod mosaic;
pub mod pipeline;
pub mod range_reader;
pub mod raster;
pub mod rescale;
pub mod s3;
pub mod scene;
pub mod tile_math;
pub mod window;

// ============================================================================
// Errors & Configuration
// ============================================================================

pub use error::{MosaicError, Result};
pub use config::{ColorFormula, PipelineConfig, PublicBucket, SensorPolicy};

// ============================================================================
// Tiles & Geometry
// ============================================================================

pub use geometry::GeoBoundingBox;
pub use tile_math::{
    MercatorBounds,
    TileCoordinate,
    TileRange,
    bounds_for_tile,
    mercator_bounds_for_tile,
    tiles_for_bbox,
};

// ============================================================================
// Scenes & Catalog
// ============================================================================

pub use scene::{
    BandSpectrum,
    ImageRepresentation,
    SceneRecord,
    SensorKind,
    best_scene_for,
};
pub use catalog::{SceneCatalog, SceneQuery, StacCatalogClient};

// ============================================================================
// COG Access
// ============================================================================

pub use cog_reader::{CogDataType, CogHeader, CogReader, Compression, GeoTransform};
pub use range_reader::{
    HttpRangeReader,
    LocalRangeReader,
    MemoryRangeReader,
    RangeReader,
    ReaderProvider,
    UriReaderProvider,
};
pub use fetcher::{AssetRole, CogTileFetcher, TileSource};

// ============================================================================
// Rendering
// ============================================================================

pub use raster::{RawTile, RescaledTile};
pub use rescale::{pansharpen_and_color, rescale_percentile};
pub use mosaic::assemble;
pub use encode::ImageFormat;
pub use pipeline::{MosaicPipeline, SeriesFrame};
