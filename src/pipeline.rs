//! Concurrency orchestrator and public render API
//!
//! [`MosaicPipeline`] ties the catalog, the tile source and the rescale /
//! mosaic stages together. Work fans out with `buffered(max_concurrent_tasks)`
//! and fans back in before assembly; raster reads underneath are additionally
//! bounded by the fetcher's admission semaphore. Dropping a returned future
//! cancels every in-flight fetch it started.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use image::RgbImage;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{SceneCatalog, SceneQuery, StacCatalogClient};
use crate::config::PipelineConfig;
use crate::encode::{ImageFormat, encode_blocking};
use crate::error::{MosaicError, Result};
use crate::fetcher::{AssetRole, CogTileFetcher, TileSource, crop_scene};
use crate::geometry::GeoBoundingBox;
use crate::mosaic::assemble;
use crate::raster::RescaledTile;
use crate::rescale::render_scene;
use crate::scene::{SceneRecord, SensorKind, best_scene_for};
use crate::tile_math::{TileCoordinate, TileRange, bounds_for_tile};

/// One image of a time series
#[derive(Debug, Clone)]
pub struct SeriesFrame<T = RgbImage> {
    pub timestamp: DateTime<Utc>,
    pub image: T,
}

pub struct MosaicPipeline {
    catalog: Arc<dyn SceneCatalog>,
    source: Arc<dyn TileSource>,
    config: Arc<PipelineConfig>,
}

impl MosaicPipeline {
    /// Pipeline over the configured STAC API and COG assets
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let catalog = Arc::new(StacCatalogClient::new(Arc::clone(&config))?);
        let source = Arc::new(CogTileFetcher::new(Arc::clone(&config))?);
        Ok(Self::with_parts(config, catalog, source))
    }

    #[must_use]
    pub fn with_parts(
        config: Arc<PipelineConfig>,
        catalog: Arc<dyn SceneCatalog>,
        source: Arc<dyn TileSource>,
    ) -> Self {
        Self { catalog, source, config }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn scenes_around(
        &self,
        sensor: SensorKind,
        bbox: &GeoBoundingBox,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<SceneRecord>> {
        let query = SceneQuery::around(sensor, *bbox, timestamp, self.config.time_buffer());
        self.catalog.search_all(&query).await
    }

    /// Fetch one tile of one scene and bring it to display RGB
    async fn render_scene_tile(&self, scene: &SceneRecord, tile: TileCoordinate) -> Result<RescaledTile> {
        let size = self.config.tile_size;
        let raw = self.source.fetch_tile(scene, AssetRole::Primary, tile, size).await?;
        let pan = if scene.needs_pansharpening() {
            Some(self.source.fetch_tile(scene, AssetRole::Panchromatic, tile, size).await?)
        } else {
            None
        };
        let image = render_scene(scene, &raw, pan.as_ref(), &self.config);
        Ok(RescaledTile {
            tile,
            scene_id: scene.id.clone(),
            timestamp: scene.timestamp,
            image,
        })
    }

    /// Mosaic of `bbox` from the scenes closest to `timestamp`.
    ///
    /// Every covered tile is fetched concurrently; the first tile failure fails
    /// the whole call. Tiles no scene covers stay black. A bbox spanning more
    /// than `max_tiles_per_request` tiles is rejected before the catalog is asked.
    #[instrument(skip(self))]
    pub async fn fetch_bbox_at_time(
        &self,
        sensor: SensorKind,
        bbox: &GeoBoundingBox,
        timestamp: DateTime<Utc>,
    ) -> Result<RgbImage> {
        let zoom = self.config.zoom_for_sensor(sensor)?;
        let range = TileRange::covering(bbox, zoom)?;
        let limit = self.config.max_tiles_per_request;
        if range.count() > limit as u64 {
            return Err(MosaicError::RequestTooLarge(format!(
                "{} tiles at zoom {zoom}, limit is {limit}",
                range.count()
            )));
        }
        let scenes = self.scenes_around(sensor, bbox, timestamp).await?;

        let jobs: Vec<(TileCoordinate, &SceneRecord)> = range
            .tiles()
            .filter_map(|tile| {
                let scene = best_scene_for(&scenes, &bounds_for_tile(tile), timestamp);
                if scene.is_none() {
                    debug!(%tile, "No scene covers tile");
                }
                scene.map(|s| (tile, s))
            })
            .collect();
        if jobs.is_empty() {
            return Err(MosaicError::AssetNotFound(format!(
                "no {sensor} imagery near {timestamp} for {bbox:?}"
            )));
        }
        debug!(zoom, tiles = jobs.len(), scenes = scenes.len(), "Fetching tiles");

        let tiles: Vec<RescaledTile> = stream::iter(jobs)
            .map(|(tile, scene)| self.render_scene_tile(scene, tile))
            .buffered(self.config.max_concurrent_tasks)
            .try_collect()
            .await?;

        let tile_size = self.config.tile_size;
        tokio::task::spawn_blocking({
            let bbox = *bbox;
            move || assemble(tiles, &bbox, tile_size)
        })
        .await?
    }

    /// One mosaic per distinct capture time in `[start, end]`, ascending.
    ///
    /// Timestamps whose render fails with a skippable error are dropped and
    /// logged. No timestamps at all is `AssetNotFound`.
    #[instrument(skip(self))]
    pub async fn fetch_series(
        &self,
        sensor: SensorKind,
        bbox: &GeoBoundingBox,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesFrame>> {
        // Sorted here so buffered() yields frames in timestamp order
        let timestamps = self.catalog.list_timestamps(sensor, bbox, start, end).await?;
        if timestamps.is_empty() {
            return Err(MosaicError::AssetNotFound(format!(
                "no {sensor} captures between {start} and {end}"
            )));
        }
        let requested = timestamps.len();

        let results: Vec<(DateTime<Utc>, Result<RgbImage>)> = stream::iter(timestamps)
            .map(|timestamp| async move {
                (timestamp, self.fetch_bbox_at_time(sensor, bbox, timestamp).await)
            })
            .buffered(self.config.max_concurrent_tasks)
            .collect()
            .await;

        let mut frames = Vec::with_capacity(results.len());
        let mut fatal = None;
        for (timestamp, result) in results {
            match result {
                Ok(image) => frames.push(SeriesFrame { timestamp, image }),
                Err(e) if e.is_skippable() => {
                    warn!(%timestamp, error = %e, "Skipping timestamp");
                }
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        info!(requested, rendered = frames.len(), "Series complete");
        Ok(frames)
    }

    /// Encoded WebP map tile from the scene closest to `timestamp`
    #[instrument(skip(self))]
    pub async fn render_tile(
        &self,
        sensor: SensorKind,
        zoom: u8,
        x: u32,
        y: u32,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let tile = TileCoordinate::new(zoom, x, y)?;
        let bounds = bounds_for_tile(tile);
        let scenes = self.scenes_around(sensor, &bounds, timestamp).await?;
        let scene = best_scene_for(&scenes, &bounds, timestamp)
            .ok_or_else(|| MosaicError::AssetNotFound(format!("no {sensor} imagery for tile {tile}")))?;

        let rescaled = self.render_scene_tile(scene, tile).await?;
        encode_blocking(rescaled.image, ImageFormat::Webp).await
    }

    /// Encoded crop of `bbox` from the single best scene near `timestamp`
    #[instrument(skip(self))]
    pub async fn render_bbox(
        &self,
        sensor: SensorKind,
        bbox: &GeoBoundingBox,
        timestamp: DateTime<Utc>,
        format: ImageFormat,
    ) -> Result<Vec<u8>> {
        let scenes = self.scenes_around(sensor, bbox, timestamp).await?;
        let scene = best_scene_for(&scenes, bbox, timestamp)
            .ok_or_else(|| MosaicError::AssetNotFound(format!("no {sensor} imagery for {bbox:?}")))?;
        crop_scene(self.source.as_ref(), &self.config, scene, bbox, format).await
    }

    /// [`fetch_series`](Self::fetch_series) with every frame WebP encoded
    pub async fn render_series(
        &self,
        sensor: SensorKind,
        bbox: &GeoBoundingBox,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesFrame<Vec<u8>>>> {
        let frames = self.fetch_series(sensor, bbox, start, end).await?;
        stream::iter(frames)
            .map(|frame| async move {
                let bytes = encode_blocking(frame.image, ImageFormat::Webp).await?;
                Ok::<_, MosaicError>(SeriesFrame { timestamp: frame.timestamp, image: bytes })
            })
            .buffered(self.config.max_concurrent_tasks)
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog_reader::test_support::TestCog;
    use crate::fetcher::test_support::MemoryProvider;
    use crate::raster::RawTile;
    use crate::scene::ImageRepresentation;
    use crate::scene::tests::scene;
    use crate::tile_math::mercator_bounds_for_tile;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::stream::BoxStream;
    use ndarray::Array3;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    struct FakeCatalog {
        scenes: Vec<SceneRecord>,
        unavailable: bool,
    }

    #[async_trait]
    impl SceneCatalog for FakeCatalog {
        fn search(&self, query: &SceneQuery) -> BoxStream<'_, Result<SceneRecord>> {
            if self.unavailable {
                return stream::once(async { Err(MosaicError::CatalogUnavailable("503".into())) }).boxed();
            }
            let matches: Vec<Result<SceneRecord>> = self
                .scenes
                .iter()
                .filter(|s| s.sensor_kind == query.sensor)
                .filter(|s| s.timestamp >= query.start && s.timestamp <= query.end)
                .filter(|s| s.bbox.intersects(&query.bbox))
                .cloned()
                .map(Ok)
                .collect();
            stream::iter(matches).boxed()
        }
    }

    /// Gradient tiles. Scenes in `failing` answer with a server error, scenes in
    /// `missing` or (for the pan role) `no_pan` with not-found.
    #[derive(Default)]
    struct FakeSource {
        failing: HashSet<String>,
        missing: HashSet<String>,
        no_pan: HashSet<String>,
        fetched: Mutex<Vec<(String, AssetRole)>>,
    }

    impl FakeSource {
        fn roles_of(&self, id: &str) -> Vec<AssetRole> {
            let fetched = self.fetched.lock().unwrap();
            fetched.iter().filter(|(s, _)| s == id).map(|(_, role)| *role).collect()
        }
    }

    #[async_trait]
    impl TileSource for FakeSource {
        async fn fetch_tile(
            &self,
            scene: &SceneRecord,
            role: AssetRole,
            _tile: TileCoordinate,
            tile_size: u32,
        ) -> Result<RawTile> {
            self.fetch_window(scene, role, &scene.bbox, (tile_size, tile_size)).await
        }

        async fn fetch_window(
            &self,
            scene: &SceneRecord,
            role: AssetRole,
            _bbox: &GeoBoundingBox,
            (width, height): (u32, u32),
        ) -> Result<RawTile> {
            self.fetched.lock().unwrap().push((scene.id.clone(), role));
            if self.failing.contains(&scene.id) {
                return Err(MosaicError::AssetServerError(format!("{}: corrupt block", scene.id)));
            }
            if self.missing.contains(&scene.id) {
                return Err(MosaicError::AssetNotFound(scene.id.clone()));
            }
            let shape = (height as usize, width as usize);
            let data = match role {
                AssetRole::Primary => {
                    Array3::from_shape_fn((3, shape.0, shape.1), |(b, y, x)| (x + y + b) as f32)
                }
                AssetRole::Panchromatic if self.no_pan.contains(&scene.id) => {
                    return Err(MosaicError::AssetNotFound(format!("{} pan", scene.id)));
                }
                AssetRole::Panchromatic => {
                    Array3::from_shape_fn((1, shape.0, shape.1), |(_, y, x)| (2 * (x + y) + 40) as f32)
                }
            };
            Ok(RawTile::new(data, None))
        }
    }

    /// Counts warnings logged by the pipeline
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == tracing::Level::WARN && meta.target() == "scenetile::pipeline" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl WarnCounter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn denver() -> GeoBoundingBox {
        GeoBoundingBox::new(-105.1, 39.9, -105.0, 40.0).unwrap()
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 5, d, 17, 30, 0).unwrap()
    }

    fn small_config() -> Arc<PipelineConfig> {
        let mut config = PipelineConfig::default();
        config.tile_size = 8;
        config.max_concurrent_tasks = 4;
        Arc::new(config)
    }

    fn pipeline(scenes: Vec<SceneRecord>, source: FakeSource) -> MosaicPipeline {
        let catalog = Arc::new(FakeCatalog { scenes, unavailable: false });
        MosaicPipeline::with_parts(small_config(), catalog, Arc::new(source))
    }

    /// Scene footprints 10 days apart so each timestamp has exactly one scene
    fn five_scenes() -> Vec<SceneRecord> {
        let covering = GeoBoundingBox::new(-106.0, 39.0, -104.0, 41.0).unwrap();
        [25, 1, 13, 7, 19]
            .into_iter()
            .map(|d| scene(&format!("S2_{d:02}"), day(d), covering))
            .collect()
    }

    #[tokio::test]
    async fn test_series_skips_failed_timestamp_in_order() {
        let source = FakeSource { failing: HashSet::from(["S2_13".to_string()]), ..Default::default() };
        let p = pipeline(five_scenes(), source);
        let warnings = WarnCounter::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let frames = p.fetch_series(SensorKind::S2, &denver(), day(1), day(30)).await.unwrap();
        let stamps: Vec<_> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![day(1), day(7), day(19), day(25)]);
        assert_eq!(warnings.count(), 1, "one skipped timestamp, one warning");
        // Denver at zoom 14: 6 x 7 tiles of 8 px, cropped to the bbox
        for frame in &frames {
            let (w, h) = frame.image.dimensions();
            assert!(w > 0 && w <= 6 * 8 && h > 0 && h <= 7 * 8, "{w}x{h}");
        }
    }

    #[tokio::test]
    async fn test_series_with_no_timestamps_is_not_found() {
        let p = pipeline(five_scenes(), FakeSource::default());
        let err = p
            .fetch_series(SensorKind::S2, &denver(), day(26), day(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MosaicError::AssetNotFound(_)), "{err:?}");

        let err = p
            .fetch_series(SensorKind::L8, &denver(), day(1), day(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MosaicError::AssetNotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_catalog_failure_is_fatal() {
        let catalog = Arc::new(FakeCatalog { scenes: Vec::new(), unavailable: true });
        let p = MosaicPipeline::with_parts(small_config(), catalog, Arc::new(FakeSource::default()));
        let err = p
            .fetch_series(SensorKind::S2, &denver(), day(1), day(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MosaicError::CatalogUnavailable(_)));
    }

    #[tokio::test]
    async fn test_single_timestamp_failure_propagates() {
        let source = FakeSource { failing: HashSet::from(["S2_07".to_string()]), ..Default::default() };
        let p = pipeline(five_scenes(), source);
        let err = p.fetch_bbox_at_time(SensorKind::S2, &denver(), day(7)).await.unwrap_err();
        assert!(matches!(err, MosaicError::AssetServerError(_)), "{err:?}");

        let source = FakeSource { missing: HashSet::from(["S2_07".to_string()]), ..Default::default() };
        let p = pipeline(five_scenes(), source);
        let err = p.fetch_bbox_at_time(SensorKind::S2, &denver(), day(7)).await.unwrap_err();
        assert!(matches!(err, MosaicError::AssetNotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_bbox_at_time_uses_closest_scene_for_every_tile() {
        let mut scenes = five_scenes();
        let covering = scenes[0].bbox;
        scenes.push(scene("S2_07_late", day(7) + chrono::Duration::hours(10), covering));
        let source = Arc::new(FakeSource::default());
        let catalog = Arc::new(FakeCatalog { scenes, unavailable: false });
        let p = MosaicPipeline::with_parts(small_config(), catalog, Arc::clone(&source) as Arc<dyn TileSource>);

        p.fetch_bbox_at_time(SensorKind::S2, &denver(), day(7) + chrono::Duration::hours(7))
            .await
            .unwrap();
        let fetched = source.fetched.lock().unwrap();
        assert_eq!(fetched.len(), 6 * 7);
        assert!(
            fetched.iter().all(|(id, role)| id == "S2_07_late" && *role == AssetRole::Primary),
            "{fetched:?}"
        );
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_before_search() {
        // An unavailable catalog proves the limit is checked first
        let catalog = Arc::new(FakeCatalog { scenes: Vec::new(), unavailable: true });
        let p = MosaicPipeline::with_parts(small_config(), catalog, Arc::new(FakeSource::default()));
        let world = GeoBoundingBox::new(-180.0, -80.0, 180.0, 80.0).unwrap();
        let err = p.fetch_bbox_at_time(SensorKind::WV, &world, day(7)).await.unwrap_err();
        assert!(matches!(err, MosaicError::RequestTooLarge(_)), "{err:?}");

        let mut config = PipelineConfig::default();
        config.tile_size = 8;
        config.max_tiles_per_request = 41;
        let catalog = Arc::new(FakeCatalog { scenes: five_scenes(), unavailable: false });
        let p = MosaicPipeline::with_parts(Arc::new(config.clone()), catalog, Arc::new(FakeSource::default()));
        let err = p.fetch_bbox_at_time(SensorKind::S2, &denver(), day(7)).await.unwrap_err();
        assert!(matches!(err, MosaicError::RequestTooLarge(_)), "{err:?}");

        // Denver at zoom 14 is exactly 42 tiles
        config.max_tiles_per_request = 42;
        let catalog = Arc::new(FakeCatalog { scenes: five_scenes(), unavailable: false });
        let p = MosaicPipeline::with_parts(Arc::new(config), catalog, Arc::new(FakeSource::default()));
        assert!(p.fetch_bbox_at_time(SensorKind::S2, &denver(), day(7)).await.is_ok());
    }

    /// Multispectral scene with a panchromatic asset over the Denver area
    fn multi_scene(id: &str, with_pan: bool) -> SceneRecord {
        let mut record = scene(id, day(7), GeoBoundingBox::new(-106.0, 39.0, -104.0, 41.0).unwrap());
        record.sensor_kind = SensorKind::WV;
        record.image_representation = ImageRepresentation::Multi;
        record.panchromatic_uri = with_pan.then(|| format!("mem://{id}_pan"));
        record
    }

    #[tokio::test]
    async fn test_multispectral_scene_is_pansharpened() {
        // One zoom 18 tile inside the footprint
        let tile = TileCoordinate::new(18, 54_560, 99_280).unwrap();
        let bbox = bounds_for_tile(tile);
        let source = Arc::new(FakeSource::default());
        let catalog = Arc::new(FakeCatalog {
            scenes: vec![multi_scene("WV_pan", true)],
            unavailable: false,
        });
        let p = MosaicPipeline::with_parts(small_config(), catalog, Arc::clone(&source) as Arc<dyn TileSource>);

        let sharpened = p.fetch_bbox_at_time(SensorKind::WV, &bbox, day(7)).await.unwrap();
        assert_eq!(sharpened.dimensions(), (8, 8));
        assert_eq!(source.roles_of("WV_pan"), vec![AssetRole::Primary, AssetRole::Panchromatic]);

        let crop = p.render_bbox(SensorKind::WV, &bbox, day(7), ImageFormat::Png).await.unwrap();
        assert!(image::load_from_memory(&crop).is_ok());
        assert_eq!(source.roles_of("WV_pan").len(), 4);

        // Same raster without a pan band takes the percentile path
        let catalog = Arc::new(FakeCatalog {
            scenes: vec![multi_scene("WV_plain", false)],
            unavailable: false,
        });
        let plain_source = Arc::new(FakeSource::default());
        let p = MosaicPipeline::with_parts(small_config(), catalog, Arc::clone(&plain_source) as Arc<dyn TileSource>);
        let plain = p.fetch_bbox_at_time(SensorKind::WV, &bbox, day(7)).await.unwrap();
        assert_eq!(plain_source.roles_of("WV_plain"), vec![AssetRole::Primary]);
        assert_ne!(sharpened, plain);
    }

    #[tokio::test]
    async fn test_missing_pan_asset_fails_the_tile() {
        let tile = TileCoordinate::new(18, 54_560, 99_280).unwrap();
        let bbox = bounds_for_tile(tile);
        let source = FakeSource { no_pan: HashSet::from(["WV_pan".to_string()]), ..Default::default() };
        let catalog = Arc::new(FakeCatalog {
            scenes: vec![multi_scene("WV_pan", true)],
            unavailable: false,
        });
        let p = MosaicPipeline::with_parts(small_config(), catalog, Arc::new(source));

        let err = p.fetch_bbox_at_time(SensorKind::WV, &bbox, day(7)).await.unwrap_err();
        assert!(matches!(err, MosaicError::AssetNotFound(_)), "{err:?}");
        let err = p
            .render_bbox(SensorKind::WV, &bbox, day(7), ImageFormat::Webp)
            .await
            .unwrap_err();
        assert!(matches!(err, MosaicError::AssetNotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_no_scene_near_time_is_not_found() {
        let p = pipeline(five_scenes(), FakeSource::default());
        let err = p.fetch_bbox_at_time(SensorKind::S2, &denver(), day(4)).await.unwrap_err();
        assert!(matches!(err, MosaicError::AssetNotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_render_tile_and_series_encode_webp() {
        let p = pipeline(five_scenes(), FakeSource::default());
        let bytes = p.render_tile(SensorKind::S2, 14, 3410, 6205, day(19)).await.unwrap();
        let image = image::load_from_memory(&bytes).unwrap();
        assert_eq!((image.width(), image.height()), (8, 8));

        let err = p.render_tile(SensorKind::S2, 2, 9, 0, day(19)).await.unwrap_err();
        assert!(matches!(err, MosaicError::InvalidTile { .. }));

        let frames = p.render_series(SensorKind::S2, &denver(), day(1), day(10)).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].timestamp < frames[1].timestamp);
        assert_eq!(&frames[0].image[8..12], b"WEBP");
    }

    #[tokio::test]
    async fn test_render_bbox_end_to_end_from_cog() {
        // Raster covering tile 2/1/1 served from memory through the real fetcher
        let tile = TileCoordinate::new(2, 1, 1).unwrap();
        let bounds = mercator_bounds_for_tile(tile);
        let mut cog = TestCog::from_fn(64, 64, 3, |x, y, b| (x * 100 + y * 10 + b) as u16);
        cog.origin = (bounds.minx, bounds.maxy);
        cog.pixel_size = ((bounds.maxx - bounds.minx) / 64.0, (bounds.maxy - bounds.miny) / 64.0);
        cog.nodata = Some(0.0);
        cog.overviews = 1;

        let footprint = bounds_for_tile(tile);
        let record = scene("cog", day(7), footprint);
        let provider = Arc::new(MemoryProvider::default().with(&record.asset_uri, cog.build()));

        let mut config = PipelineConfig::default();
        config.crop_max_dimension = 128;
        let config = Arc::new(config);
        let source = Arc::new(CogTileFetcher::with_provider(Arc::clone(&config), provider));
        let catalog = Arc::new(FakeCatalog { scenes: vec![record], unavailable: false });
        let p = MosaicPipeline::with_parts(config, catalog, source);

        let bytes = p
            .render_bbox(SensorKind::S2, &footprint, day(7), ImageFormat::Png)
            .await
            .unwrap();
        let image = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (128, 128));
        // Values grow eastward, so the stretch brightens from west to east
        assert!(image.get_pixel(120, 64)[0] > image.get_pixel(8, 64)[0]);
    }
}
