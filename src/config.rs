//! Pipeline configuration
//!
//! Every policy constant the pipeline needs (zoom per sensor, catalog
//! collections, asset preferences, concurrency limits, the colour formula)
//! lives in [`PipelineConfig`]. It is built once and handed to the pipeline;
//! nothing reads it from global state.
//!
//! # Environment overrides
//!
//! [`PipelineConfig::from_env`] starts from the defaults and applies:
//! - `SCENETILE_CATALOG_URL` - STAC API root
//! - `SCENETILE_MAX_CONCURRENT_READS` - raster range read admission limit
//! - `SCENETILE_MAX_CONCURRENT_TASKS` - per-tile / per-timestamp fan-out
//! - `SCENETILE_READ_TIMEOUT_SECS` - per-read socket timeout
//! - `SCENETILE_BLOCK_CACHE_BYTES` - decoded block cache size
//! - `SCENETILE_MAX_TILES_PER_REQUEST` - tile count cap of one mosaic

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MosaicError, Result};
use crate::scene::SensorKind;
use crate::tile_math::MAX_ZOOM;

/// Per-sensor catalog and zoom policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPolicy {
    /// Tile-grid zoom used for spatial mosaics of this sensor
    pub zoom: u8,
    /// STAC collections searched for this sensor
    pub collections: Vec<String>,
    /// Asset keys tried in order for the multispectral/visual raster
    pub asset_keys: Vec<String>,
    /// Asset key of the panchromatic band, if the sensor has one
    #[serde(default)]
    pub pan_asset_key: Option<String>,
    /// Scenes above this cloud cover (percent) are ignored
    #[serde(default)]
    pub max_cloud_cover: Option<f64>,
}

/// Public bucket served over HTTPS that can also be read with unsigned S3 requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicBucket {
    pub host: String,
    pub bucket: String,
    pub region: String,
}

/// Fixed colour correction applied after pansharpening.
///
/// Kept as a struct so the constants are written down once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorFormula {
    pub gamma_red: f32,
    pub gamma_green: f32,
    pub gamma_blue: f32,
    pub sigmoidal_contrast: f32,
    pub sigmoidal_bias: f32,
    pub saturation: f32,
    /// Weight of the blue band in the Brovey pan ratio
    pub brovey_weight: f32,
}

impl Default for ColorFormula {
    fn default() -> Self {
        Self {
            gamma_red: 1.3,
            gamma_green: 0.99,
            gamma_blue: 0.97,
            sigmoidal_contrast: 5.0,
            sigmoidal_bias: 0.2,
            saturation: 1.2,
            brovey_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tile_size: u32,
    pub percentile_low: f32,
    pub percentile_high: f32,
    /// Half-width of the search window around a single timestamp
    pub time_buffer_secs: i64,
    pub max_concurrent_reads: usize,
    pub max_concurrent_tasks: usize,
    /// Mosaics covering more tiles than this are rejected before any fetch
    pub max_tiles_per_request: usize,
    pub read_timeout_secs: u64,
    pub sensors: HashMap<SensorKind, SensorPolicy>,
    pub public_buckets: Vec<PublicBucket>,
    pub color: ColorFormula,
    /// Longest side of a bbox-direct crop, in pixels
    pub crop_max_dimension: u32,
    pub block_cache_bytes: usize,
    pub header_cache_entries: usize,
    pub catalog_url: String,
    pub catalog_page_limit: usize,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_string()).collect()
}

fn default_sensors() -> HashMap<SensorKind, SensorPolicy> {
    let mut sensors = HashMap::new();
    sensors.insert(
        SensorKind::S2,
        SensorPolicy {
            zoom: 14,
            collections: strings(&["sentinel-2-l2a", "sentinel-2-c1-l2a"]),
            asset_keys: strings(&["visual", "tci"]),
            pan_asset_key: None,
            max_cloud_cover: None,
        },
    );
    sensors.insert(
        SensorKind::L8,
        SensorPolicy {
            zoom: 14,
            collections: strings(&["landsat-c2-l2"]),
            asset_keys: strings(&["visual", "rendered_preview"]),
            pan_asset_key: None,
            max_cloud_cover: None,
        },
    );
    sensors.insert(
        SensorKind::PD,
        SensorPolicy {
            zoom: 14,
            collections: strings(&["planetscope"]),
            asset_keys: strings(&["ortho_visual", "visual", "data"]),
            pan_asset_key: None,
            max_cloud_cover: None,
        },
    );
    sensors.insert(
        SensorKind::WV,
        SensorPolicy {
            zoom: 18,
            collections: strings(&["worldview"]),
            asset_keys: strings(&["data", "visual"]),
            pan_asset_key: Some("pan".to_string()),
            max_cloud_cover: None,
        },
    );
    sensors
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            percentile_low: 2.0,
            percentile_high: 98.0,
            time_buffer_secs: 24 * 60 * 60,
            max_concurrent_reads: 30,
            max_concurrent_tasks: 16,
            max_tiles_per_request: 16_384,
            read_timeout_secs: 120,
            sensors: default_sensors(),
            public_buckets: vec![PublicBucket {
                host: "sentinel-cogs.s3.us-west-2.amazonaws.com".to_string(),
                bucket: "sentinel-cogs".to_string(),
                region: "us-west-2".to_string(),
            }],
            color: ColorFormula::default(),
            crop_max_dimension: 2048,
            block_cache_bytes: 256 * 1024 * 1024,
            header_cache_entries: 64,
            catalog_url: "https://earth-search.aws.element84.com/v1".to_string(),
            catalog_page_limit: 100,
        }
    }
}

fn env_override<T: FromStr>(name: &str, target: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| MosaicError::Config(format!("{name}={raw}: {e}")))?;
    }
    Ok(())
}

impl PipelineConfig {
    /// Defaults with `SCENETILE_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        env_override("SCENETILE_CATALOG_URL", &mut config.catalog_url)?;
        env_override("SCENETILE_MAX_CONCURRENT_READS", &mut config.max_concurrent_reads)?;
        env_override("SCENETILE_MAX_CONCURRENT_TASKS", &mut config.max_concurrent_tasks)?;
        env_override("SCENETILE_READ_TIMEOUT_SECS", &mut config.read_timeout_secs)?;
        env_override("SCENETILE_BLOCK_CACHE_BYTES", &mut config.block_cache_bytes)?;
        env_override("SCENETILE_MAX_TILES_PER_REQUEST", &mut config.max_tiles_per_request)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MosaicError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(MosaicError::Config("tile_size must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.percentile_low)
            || !(0.0..=100.0).contains(&self.percentile_high)
            || self.percentile_low >= self.percentile_high
        {
            return Err(MosaicError::Config(format!(
                "percentiles must satisfy 0 <= low < high <= 100, got {} and {}",
                self.percentile_low, self.percentile_high
            )));
        }
        if self.max_concurrent_reads == 0 || self.max_concurrent_tasks == 0 {
            return Err(MosaicError::Config("concurrency limits must be positive".into()));
        }
        if self.max_tiles_per_request == 0 {
            return Err(MosaicError::Config("max_tiles_per_request must be positive".into()));
        }
        if let Some((kind, policy)) = self.sensors.iter().find(|(_, p)| p.zoom > MAX_ZOOM) {
            return Err(MosaicError::Config(format!(
                "zoom {} for sensor {kind} exceeds the maximum of {MAX_ZOOM}",
                policy.zoom
            )));
        }
        if self.time_buffer_secs < 0 {
            return Err(MosaicError::Config("time_buffer_secs must not be negative".into()));
        }
        Ok(())
    }

    pub fn sensor(&self, kind: SensorKind) -> Result<&SensorPolicy> {
        self.sensors
            .get(&kind)
            .ok_or_else(|| MosaicError::Config(format!("no policy configured for sensor {kind}")))
    }

    /// Tile-grid zoom for a sensor's spatial mosaics
    pub fn zoom_for_sensor(&self, kind: SensorKind) -> Result<u8> {
        self.sensor(kind).map(|p| p.zoom)
    }

    #[must_use]
    pub fn time_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.time_buffer_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Public bucket whose HTTPS host matches `host`
    #[must_use]
    pub fn public_bucket_for_host(&self, host: &str) -> Option<&PublicBucket> {
        self.public_buckets
            .iter()
            .find(|b| b.host.eq_ignore_ascii_case(host))
    }
}
