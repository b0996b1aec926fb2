//! STAC item search client
//!
//! Queries a STAC API (`POST {root}/search`) for scenes over a bbox and time
//! window and normalizes every returned feature into a [`SceneRecord`].
//! Pages are followed through `rel="next"` links until the catalog stops
//! returning them. Features that cannot be normalized are skipped with a
//! warning; only a failed request turns into [`MosaicError::CatalogUnavailable`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{PipelineConfig, SensorPolicy};
use crate::error::{MosaicError, Result};
use crate::geometry::GeoBoundingBox;
use crate::scene::{BandSpectrum, ImageRepresentation, SceneRecord, SensorKind};

// ============================================================================
// Query
// ============================================================================

/// Spatiotemporal scene search
#[derive(Debug, Clone, PartialEq)]
pub struct SceneQuery {
    pub sensor: SensorKind,
    pub bbox: GeoBoundingBox,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SceneQuery {
    /// Window `[timestamp - buffer, timestamp + buffer]`
    #[must_use]
    pub fn around(
        sensor: SensorKind,
        bbox: GeoBoundingBox,
        timestamp: DateTime<Utc>,
        buffer: chrono::Duration,
    ) -> Self {
        Self { sensor, bbox, start: timestamp - buffer, end: timestamp + buffer }
    }

    #[must_use]
    pub fn between(
        sensor: SensorKind,
        bbox: GeoBoundingBox,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self { sensor, bbox, start, end }
    }

    /// STAC `datetime` interval string
    fn datetime_range(&self) -> String {
        format!(
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Source of scene metadata
#[async_trait]
pub trait SceneCatalog: Send + Sync {
    /// Lazily stream every scene matching the query. Each call re-queries.
    fn search(&self, query: &SceneQuery) -> BoxStream<'_, Result<SceneRecord>>;

    /// Collect a whole search
    async fn search_all(&self, query: &SceneQuery) -> Result<Vec<SceneRecord>> {
        self.search(query).try_collect().await
    }

    /// Distinct capture timestamps in `[start, end]`, ascending
    async fn list_timestamps(
        &self,
        sensor: SensorKind,
        bbox: &GeoBoundingBox,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let query = SceneQuery::between(sensor, *bbox, start, end);
        let timestamps: BTreeSet<DateTime<Utc>> = self
            .search(&query)
            .map_ok(|scene| scene.timestamp)
            .try_collect()
            .await?;
        Ok(timestamps.into_iter().collect())
    }
}

// ============================================================================
// STAC wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct StacItemCollection {
    /// Kept as raw JSON so one malformed feature does not poison the page
    #[serde(default)]
    features: Vec<Value>,
    #[serde(default)]
    links: Vec<StacLink>,
}

impl StacItemCollection {
    fn next_link(&self) -> Option<&StacLink> {
        self.links.iter().find(|l| l.rel == "next")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StacLink {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    merge: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct StacItem {
    id: String,
    bbox: Option<Vec<f64>>,
    properties: HashMap<String, Value>,
    #[serde(default)]
    assets: HashMap<String, StacAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct StacAsset {
    href: String,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

// ============================================================================
// Feature normalization
// ============================================================================

fn property_str<'a>(properties: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    properties.get(key).and_then(Value::as_str)
}

fn parse_timestamp(properties: &HashMap<String, Value>) -> std::result::Result<DateTime<Utc>, String> {
    let raw = property_str(properties, "datetime")
        .or_else(|| property_str(properties, "start_datetime"))
        .ok_or("missing datetime")?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad datetime {raw:?}: {e}"))
}

/// Common names from an `eo:bands` array (falls back to `name`)
fn band_names(bands: &Value) -> Option<Vec<String>> {
    let names: Vec<String> = bands
        .as_array()?
        .iter()
        .filter_map(|b| {
            b.get("common_name")
                .or_else(|| b.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect();
    (!names.is_empty()).then_some(names)
}

fn bits_for_data_type(data_type: &str) -> Option<u8> {
    match data_type {
        "uint8" | "int8" => Some(8),
        "uint16" | "int16" => Some(16),
        "uint32" | "int32" | "float32" => Some(32),
        _ => None,
    }
}

fn bits_per_pixel(asset: &StacAsset, properties: &HashMap<String, Value>) -> u8 {
    let from_raster_bands = asset
        .extra
        .get("raster:bands")
        .and_then(|bands| bands.get(0))
        .and_then(|band| {
            band.get("bits_per_sample")
                .and_then(Value::as_u64)
                .and_then(|b| u8::try_from(b).ok())
                .or_else(|| band.get("data_type").and_then(Value::as_str).and_then(bits_for_data_type))
        });
    from_raster_bands
        .or_else(|| {
            properties
                .get("nitf:bits_per_pixel")
                .and_then(Value::as_u64)
                .and_then(|b| u8::try_from(b).ok())
        })
        .unwrap_or(8)
}

fn parse_feature(
    feature: Value,
    sensor: SensorKind,
    policy: &SensorPolicy,
) -> std::result::Result<SceneRecord, String> {
    let item: StacItem = serde_json::from_value(feature).map_err(|e| e.to_string())?;
    let timestamp = parse_timestamp(&item.properties)?;
    let bbox = item
        .bbox
        .as_deref()
        .ok_or("missing bbox")
        .and_then(|b| GeoBoundingBox::from_slice(b).map_err(|_| "invalid bbox"))?;

    let (asset_key, asset) = policy
        .asset_keys
        .iter()
        .find_map(|key| item.assets.get(key).map(|a| (key.as_str(), a)))
        .ok_or_else(|| format!("no asset among {:?}", policy.asset_keys))?;

    let panchromatic_uri = policy
        .pan_asset_key
        .as_ref()
        .and_then(|key| item.assets.get(key))
        .map(|a| a.href.clone());

    let band_spectrum = asset
        .extra
        .get("eo:bands")
        .and_then(band_names)
        .or_else(|| item.properties.get("eo:bands").and_then(band_names))
        .map(BandSpectrum)
        .unwrap_or_default();

    let is_visual = asset_key.contains("visual")
        || asset
            .roles
            .as_ref()
            .is_some_and(|roles| roles.iter().any(|r| r == "visual"));
    let image_representation = match property_str(&item.properties, "nitf:image_representation") {
        Some(code) => ImageRepresentation::from_code(code),
        None if is_visual => ImageRepresentation::Rgb,
        None => ImageRepresentation::Multi,
    };

    Ok(SceneRecord {
        id: item.id,
        timestamp,
        bbox,
        sensor_kind: sensor,
        processing_level: property_str(&item.properties, "processing:level").map(str::to_string),
        bits_per_pixel: bits_per_pixel(asset, &item.properties),
        band_spectrum,
        asset_uri: asset.href.clone(),
        panchromatic_uri,
        image_representation,
        cloud_cover: item.properties.get("eo:cloud_cover").and_then(Value::as_f64),
    })
}

/// Normalize one page, skipping features that fail to parse or exceed the
/// sensor's cloud cover limit
fn normalize_page(features: Vec<Value>, sensor: SensorKind, policy: &SensorPolicy) -> Vec<SceneRecord> {
    features
        .into_iter()
        .filter_map(|feature| {
            let id = feature
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            match parse_feature(feature, sensor, policy) {
                Ok(scene) => Some(scene),
                Err(reason) => {
                    warn!(feature = %id, %reason, "Skipping malformed catalog feature");
                    None
                }
            }
        })
        .filter(|scene| match (policy.max_cloud_cover, scene.cloud_cover) {
            (Some(max), Some(cover)) if cover > max => {
                debug!(scene = %scene.id, cover, max, "Skipping cloudy scene");
                false
            }
            _ => true,
        })
        .collect()
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Clone)]
enum PageRequest {
    Post { url: String, body: Value },
    Get { url: String },
}

impl PageRequest {
    fn url(&self) -> &str {
        match self {
            PageRequest::Post { url, .. } | PageRequest::Get { url } => url,
        }
    }

    /// Request for the page a `next` link points at
    fn follow(&self, link: &StacLink) -> PageRequest {
        let is_post = link
            .method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("POST"));
        if !is_post {
            return PageRequest::Get { url: link.href.clone() };
        }

        let previous = match self {
            PageRequest::Post { body, .. } => body.clone(),
            PageRequest::Get { .. } => json!({}),
        };
        let body = match (&link.body, link.merge.unwrap_or(false)) {
            (Some(extra), true) => merge_body(previous, extra),
            (Some(extra), false) => extra.clone(),
            (None, _) => previous,
        };
        PageRequest::Post { url: link.href.clone(), body }
    }
}

fn merge_body(mut base: Value, extra: &Value) -> Value {
    if let (Some(target), Some(fields)) = (base.as_object_mut(), extra.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    base
}

/// [`SceneCatalog`] backed by a STAC API
pub struct StacCatalogClient {
    client: reqwest::Client,
    config: Arc<PipelineConfig>,
}

impl StacCatalogClient {
    pub fn new(config: Arc<PipelineConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.read_timeout())
            .build()
            .map_err(|e| MosaicError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.config.catalog_url.trim_end_matches('/'))
    }

    fn search_body(&self, query: &SceneQuery, policy: &SensorPolicy) -> Value {
        json!({
            "collections": policy.collections,
            "bbox": query.bbox.to_array(),
            "datetime": query.datetime_range(),
            "limit": self.config.catalog_page_limit,
        })
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<StacItemCollection> {
        let builder = match request {
            PageRequest::Post { url, body } => self.client.post(url).json(body),
            PageRequest::Get { url } => self.client.get(url),
        };
        let response = builder
            .send()
            .await
            .map_err(|e| MosaicError::CatalogUnavailable(format!("{}: {e}", request.url())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MosaicError::CatalogUnavailable(format!(
                "{} returned {status}",
                request.url()
            )));
        }

        response.json().await.map_err(|e| {
            MosaicError::CatalogUnavailable(format!("invalid search response from {}: {e}", request.url()))
        })
    }
}

#[async_trait]
impl SceneCatalog for StacCatalogClient {
    fn search(&self, query: &SceneQuery) -> BoxStream<'_, Result<SceneRecord>> {
        let policy = match self.config.sensor(query.sensor) {
            Ok(policy) => Arc::new(policy.clone()),
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let sensor = query.sensor;
        let first = PageRequest::Post {
            url: self.search_url(),
            body: self.search_body(query, &policy),
        };

        stream::try_unfold(Some(first), move |next| {
            let policy = Arc::clone(&policy);
            async move {
                let Some(request) = next else {
                    return Ok::<_, MosaicError>(None);
                };
                let page = self.fetch_page(&request).await?;
                // An empty page ends the search even if the catalog offers a next link
                let following = if page.features.is_empty() {
                    None
                } else {
                    page.next_link().map(|link| request.follow(link))
                };
                let returned = page.features.len();
                let scenes = normalize_page(page.features, sensor, &policy);
                debug!(url = request.url(), returned, kept = scenes.len(), "Fetched catalog page");
                Ok(Some((scenes, following)))
            }
        })
        .map_ok(|scenes| stream::iter(scenes.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}
