//! Range-based reader interface for COG files
//!
//! COGs are designed to be read through byte-range requests. Every raster
//! source (local file, HTTP(S), S3, memory) implements [`RangeReader`]; the COG
//! reader never knows where its bytes come from. [`ThrottledReader`] wraps any
//! reader with the shared admission limit on outbound range reads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::config::PipelineConfig;
use crate::error::{MosaicError, Result};
use crate::s3::{S3RangeReader, rewrite_public_uri};

/// Trait for reading byte ranges from any source
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read up to `length` bytes at `offset`. Reads past the end of the source
    /// return the available bytes.
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Total size of the source in bytes, 0 when the source did not report it
    fn size(&self) -> u64;

    /// Human-readable identifier for logging and errors
    fn identifier(&self) -> &str;

    /// Check if this is a local source (fast random access) or remote
    fn is_local(&self) -> bool {
        let id = self.identifier();
        !id.starts_with("http://") && !id.starts_with("https://") && !id.starts_with("s3://")
    }
}

/// Clamp a request to the known source size
pub(crate) fn clamp_length(size: u64, offset: u64, length: usize) -> usize {
    if size == 0 {
        return length;
    }
    let available = size.saturating_sub(offset);
    length.min(usize::try_from(available).unwrap_or(usize::MAX))
}

// ============================================================================
// Local files
// ============================================================================

pub struct LocalRangeReader {
    path: PathBuf,
    identifier: String,
    size: u64,
}

impl LocalRangeReader {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let identifier = path.display().to_string();
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MosaicError::AssetNotFound(identifier.clone()),
            _ => MosaicError::server(&identifier, e),
        })?;
        Ok(Self { path, identifier, size: metadata.len() })
    }
}

#[async_trait]
impl RangeReader for LocalRangeReader {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let length = clamp_length(self.size, offset, length);
        let path = self.path.clone();
        // File IO is blocking; keep it off the async workers
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = Vec::with_capacity(length);
            file.take(length as u64).read_to_end(&mut buffer)?;
            Ok(buffer)
        })
        .await
        .map_err(|e| MosaicError::server(&self.identifier, e))?
        .map_err(|e| MosaicError::server(&self.identifier, e))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// ============================================================================
// HTTP(S)
// ============================================================================

/// HTTP range reader for remote COG files
pub struct HttpRangeReader {
    url: String,
    size: u64,
    client: reqwest::Client,
}

impl HttpRangeReader {
    /// Open a URL, probing its size with a HEAD request. A 404 becomes
    /// [`MosaicError::AssetNotFound`].
    pub async fn open(url: &str, client: reqwest::Client) -> Result<Self> {
        let response = client.head(url).send().await?.error_for_status()?;
        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self { url: url.to_string(), size, client })
    }
}

#[async_trait]
impl RangeReader for HttpRangeReader {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let length = clamp_length(self.size, offset, length);
        if length == 0 {
            return Ok(Vec::new());
        }
        let range = format!("bytes={}-{}", offset, offset + length as u64 - 1);
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await?
            .error_for_status()?;

        let ignored_range = response.status() == reqwest::StatusCode::OK;
        let bytes = response.bytes().await?;
        if ignored_range {
            // Server sent the whole object
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
            let end = start.saturating_add(length).min(bytes.len());
            return Ok(bytes[start..end].to_vec());
        }
        Ok(bytes.to_vec())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-memory source, for rasters already held in a buffer
pub struct MemoryRangeReader {
    identifier: String,
    data: Arc<Vec<u8>>,
}

impl MemoryRangeReader {
    #[must_use]
    pub fn new(identifier: impl Into<String>, data: Vec<u8>) -> Self {
        Self { identifier: identifier.into(), data: Arc::new(data) }
    }
}

#[async_trait]
impl RangeReader for MemoryRangeReader {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let end = start.saturating_add(length).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_local(&self) -> bool {
        true
    }
}

// ============================================================================
// Admission limiting
// ============================================================================

/// Reader that holds a permit of a shared semaphore for the duration of
/// every read
pub struct ThrottledReader {
    inner: Arc<dyn RangeReader>,
    permits: Arc<Semaphore>,
}

impl ThrottledReader {
    #[must_use]
    pub fn new(inner: Arc<dyn RangeReader>, permits: Arc<Semaphore>) -> Self {
        Self { inner, permits }
    }
}

#[async_trait]
impl RangeReader for ThrottledReader {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| MosaicError::server(self.inner.identifier(), e))?;
        trace!(source = self.inner.identifier(), offset, length, "Range read");
        self.inner.read_range(offset, length).await
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    fn is_local(&self) -> bool {
        self.inner.is_local()
    }
}

// ============================================================================
// Opening sources
// ============================================================================

/// Turns an asset URI into a reader
#[async_trait]
pub trait ReaderProvider: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Arc<dyn RangeReader>>;
}

/// Opens `s3://`, `http(s)://` and local paths. HTTPS URLs on a known public
/// bucket host are rewritten to unsigned S3 access.
pub struct UriReaderProvider {
    client: reqwest::Client,
    config: Arc<PipelineConfig>,
}

impl UriReaderProvider {
    pub fn new(config: Arc<PipelineConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .read_timeout(config.read_timeout())
            .build()
            .map_err(|e| MosaicError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ReaderProvider for UriReaderProvider {
    async fn open(&self, uri: &str) -> Result<Arc<dyn RangeReader>> {
        if let Some(location) = rewrite_public_uri(uri, &self.config.public_buckets) {
            return Ok(Arc::new(S3RangeReader::open(location, self.config.read_timeout()).await?));
        }
        if uri.starts_with("s3://") {
            return Ok(Arc::new(S3RangeReader::open_url(uri, self.config.read_timeout()).await?));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Arc::new(HttpRangeReader::open(uri, self.client.clone()).await?));
        }
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Ok(Arc::new(LocalRangeReader::open(path).await?))
    }
}
