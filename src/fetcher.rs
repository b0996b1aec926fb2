//! Raster tile fetcher
//!
//! [`TileSource`] is the seam between the orchestrator and raster access.
//! [`CogTileFetcher`] implements it over COGs: it resolves the asset URI to a
//! reader (public-bucket rewrite included), wraps it in the shared admission
//! semaphore, caches the parsed header and decoded blocks, and reads a
//! reprojected window.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::cache::{BlockCache, HeaderCache};
use crate::cog_reader::CogReader;
use crate::config::PipelineConfig;
use crate::encode::{ImageFormat, encode_blocking};
use crate::error::{MosaicError, Result};
use crate::geometry::GeoBoundingBox;
use crate::geometry::projection::{HALF_EARTH, lat_to_merc_y, lon_to_merc_x};
use crate::range_reader::{RangeReader, ReaderProvider, ThrottledReader, UriReaderProvider};
use crate::raster::RawTile;
use crate::rescale::render_scene;
use crate::scene::SceneRecord;
use crate::tile_math::TileCoordinate;
use crate::window::{OutputGrid, read_window};

/// Which asset of a scene to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
    /// Visual or multispectral raster
    Primary,
    Panchromatic,
}

impl AssetRole {
    /// URI of this asset; a scene without a pan band has no `Panchromatic` asset
    pub fn uri<'a>(&self, scene: &'a SceneRecord) -> Result<&'a str> {
        match self {
            AssetRole::Primary => Ok(&scene.asset_uri),
            AssetRole::Panchromatic => scene
                .panchromatic_uri
                .as_deref()
                .ok_or_else(|| MosaicError::AssetNotFound(format!("scene {} has no panchromatic asset", scene.id))),
        }
    }
}

/// Reads raw pixels of a scene asset
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Read a map tile window of `tile_size` x `tile_size` pixels
    async fn fetch_tile(
        &self,
        scene: &SceneRecord,
        role: AssetRole,
        tile: TileCoordinate,
        tile_size: u32,
    ) -> Result<RawTile>;

    /// Read an arbitrary geographic window at `size` (width, height)
    async fn fetch_window(
        &self,
        scene: &SceneRecord,
        role: AssetRole,
        bbox: &GeoBoundingBox,
        size: (u32, u32),
    ) -> Result<RawTile>;
}

/// Output size of a bbox crop: the sensor's tile-grid resolution at `zoom`,
/// shrunk to fit `max_dimension` on the longer side
#[must_use]
pub fn crop_size(bbox: &GeoBoundingBox, zoom: u8, tile_size: u32, max_dimension: u32) -> (u32, u32) {
    let metres_per_pixel = 2.0 * HALF_EARTH / (f64::from(tile_size) * f64::from(1_u32 << zoom.min(31)));
    let width = (lon_to_merc_x(bbox.east()) - lon_to_merc_x(bbox.west())) / metres_per_pixel;
    let height = (lat_to_merc_y(bbox.north()) - lat_to_merc_y(bbox.south())) / metres_per_pixel;

    let longest = width.max(height);
    let shrink = if longest > f64::from(max_dimension) { f64::from(max_dimension) / longest } else { 1.0 };
    let side = |v: f64| ((v * shrink).round() as u32).max(1);
    (side(width), side(height))
}

/// Fetch, rescale and encode one scene over `bbox`
pub async fn crop_scene(
    source: &dyn TileSource,
    config: &PipelineConfig,
    scene: &SceneRecord,
    bbox: &GeoBoundingBox,
    format: ImageFormat,
) -> Result<Vec<u8>> {
    let zoom = config.zoom_for_sensor(scene.sensor_kind)?;
    let size = crop_size(bbox, zoom, config.tile_size, config.crop_max_dimension);
    debug!(scene = %scene.id, width = size.0, height = size.1, "Cropping scene");

    let raw = source.fetch_window(scene, AssetRole::Primary, bbox, size).await?;
    let pan = if scene.needs_pansharpening() {
        Some(source.fetch_window(scene, AssetRole::Panchromatic, bbox, size).await?)
    } else {
        None
    };
    let image = render_scene(scene, &raw, pan.as_ref(), config);
    encode_blocking(image, format).await
}

pub struct CogTileFetcher {
    provider: Arc<dyn ReaderProvider>,
    permits: Arc<Semaphore>,
    blocks: BlockCache,
    headers: HeaderCache,
    config: Arc<PipelineConfig>,
}

impl CogTileFetcher {
    /// Fetcher reading `s3://`, `http(s)://` and local assets
    pub fn new(config: Arc<PipelineConfig>) -> Result<Self> {
        let provider = Arc::new(UriReaderProvider::new(Arc::clone(&config))?);
        Ok(Self::with_provider(config, provider))
    }

    #[must_use]
    pub fn with_provider(config: Arc<PipelineConfig>, provider: Arc<dyn ReaderProvider>) -> Self {
        Self {
            provider,
            permits: Arc::new(Semaphore::new(config.max_concurrent_reads)),
            blocks: BlockCache::new(config.block_cache_bytes),
            headers: HeaderCache::new(config.header_cache_entries),
            config,
        }
    }

    async fn open(&self, uri: &str) -> Result<Arc<CogReader>> {
        if let Some(cog) = self.headers.get(uri) {
            return Ok(cog);
        }
        let reader = self.provider.open(uri).await?;
        let throttled: Arc<dyn RangeReader> = Arc::new(ThrottledReader::new(reader, Arc::clone(&self.permits)));
        let cog = Arc::new(CogReader::open(throttled).await?);
        self.headers.insert(uri, Arc::clone(&cog));
        Ok(cog)
    }

    async fn read(&self, scene: &SceneRecord, role: AssetRole, grid: &OutputGrid) -> Result<RawTile> {
        let uri = role.uri(scene)?;
        let cog = self.open(uri).await?;
        read_window(&cog, &self.blocks, grid).await
    }

    /// Encoded crop of one scene over `bbox`
    pub async fn fetch_crop(&self, scene: &SceneRecord, bbox: &GeoBoundingBox, format: ImageFormat) -> Result<Vec<u8>> {
        crop_scene(self, &self.config, scene, bbox, format).await
    }
}

#[async_trait]
impl TileSource for CogTileFetcher {
    async fn fetch_tile(
        &self,
        scene: &SceneRecord,
        role: AssetRole,
        tile: TileCoordinate,
        tile_size: u32,
    ) -> Result<RawTile> {
        debug!(scene = %scene.id, %tile, ?role, "Fetching tile");
        let grid = OutputGrid::for_tile(tile, tile_size as usize);
        self.read(scene, role, &grid).await
    }

    async fn fetch_window(
        &self,
        scene: &SceneRecord,
        role: AssetRole,
        bbox: &GeoBoundingBox,
        size: (u32, u32),
    ) -> Result<RawTile> {
        let grid = OutputGrid::for_bbox(bbox, size.0 as usize, size.1 as usize);
        self.read(scene, role, &grid).await
    }
}
