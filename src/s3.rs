//! S3 range reader using `object_store`
//!
//! Scene assets are usually published as HTTPS URLs on a public bucket. When
//! the host matches a configured [`PublicBucket`], the URL is rewritten to an
//! unsigned S3 location so no credentials are required.
//!
//! # Configuration
//!
//! Plain `s3://` URIs read the usual environment variables:
//! - `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
//! - `AWS_REGION` (default: us-east-1)
//! - `AWS_ENDPOINT_URL` for MinIO and other S3-compatible services
//! - `AWS_ALLOW_HTTP` set to "true" for plain-HTTP endpoints
//! - `AWS_SKIP_SIGNATURE` set to "true" for anonymous access

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, GetOptions, GetRange, ObjectStore};

use crate::config::PublicBucket;
use crate::error::{MosaicError, Result};
use crate::range_reader::{RangeReader, clamp_length};

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Where an object lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub allow_http: bool,
    /// Anonymous access (public buckets)
    pub skip_signature: bool,
}

impl S3Location {
    /// Parse `s3://bucket/key/path`, taking connection settings from `AWS_*`
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| MosaicError::AssetServerError(format!("{url}: {e}")))?;

        if parsed.scheme() != "s3" {
            return Err(MosaicError::AssetServerError(format!(
                "expected s3:// URL, got: {}",
                parsed.scheme()
            )));
        }

        let bucket = parsed
            .host_str()
            .ok_or_else(|| MosaicError::AssetServerError(format!("missing bucket in {url}")))?
            .to_string();
        let key = parsed.path().trim_start_matches('/').to_string();
        if key.is_empty() {
            return Err(MosaicError::AssetServerError(format!("missing key in {url}")));
        }

        Ok(Self {
            bucket,
            key,
            region: std::env::var("AWS_REGION").ok().or(Some("us-east-1".to_string())),
            endpoint_url: std::env::var("AWS_ENDPOINT_URL").ok(),
            allow_http: env_flag("AWS_ALLOW_HTTP"),
            skip_signature: env_flag("AWS_SKIP_SIGNATURE"),
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Rewrite an HTTPS URL on a known public bucket host to unsigned S3 access.
///
/// Returns `None` for any other URI, which is then read as-is.
#[must_use]
pub fn rewrite_public_uri(uri: &str, buckets: &[PublicBucket]) -> Option<S3Location> {
    let parsed = url::Url::parse(uri).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }
    let host = parsed.host_str()?;
    let bucket = buckets.iter().find(|b| b.host.eq_ignore_ascii_case(host))?;
    let key = parsed.path().trim_start_matches('/');
    if key.is_empty() {
        return None;
    }

    Some(S3Location {
        bucket: bucket.bucket.clone(),
        key: key.to_string(),
        region: Some(bucket.region.clone()),
        endpoint_url: None,
        allow_http: false,
        skip_signature: true,
    })
}

/// HTTP client settings for S3 requests; `read_timeout` bounds each request
fn client_options(read_timeout: Duration) -> ClientOptions {
    ClientOptions::new().with_timeout(read_timeout)
}

/// Range reader over one S3 object
pub struct S3RangeReader {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    size: u64,
    url: String,
}

impl S3RangeReader {
    pub async fn open_url(url: &str, read_timeout: Duration) -> Result<Self> {
        Self::open(S3Location::from_url(url)?, read_timeout).await
    }

    /// Build the store for `location` and probe the object size
    pub async fn open(location: S3Location, read_timeout: Duration) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&location.bucket)
            .with_client_options(client_options(read_timeout));

        if let Some(region) = &location.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &location.endpoint_url {
            builder = builder.with_endpoint(endpoint);
        }
        if location.allow_http {
            builder = builder.with_allow_http(true);
        }
        if location.skip_signature {
            builder = builder.with_skip_signature(true);
        }

        let store = builder.build()?;
        let path = ObjectPath::from(location.key.as_str());
        let meta = store.head(&path).await?;

        Ok(Self {
            store: Arc::new(store),
            path,
            size: meta.size as u64,
            url: location.url(),
        })
    }
}

#[async_trait]
impl RangeReader for S3RangeReader {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let length = clamp_length(self.size, offset, length);
        if length == 0 {
            return Ok(Vec::new());
        }
        let range = Range { start: offset, end: offset + length as u64 };
        let options = GetOptions {
            range: Some(GetRange::Bounded(range)),
            ..Default::default()
        };

        let result = self.store.get_opts(&self.path, options).await?;
        let bytes = result.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }

    fn is_local(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel_bucket() -> Vec<PublicBucket> {
        vec![PublicBucket {
            host: "sentinel-cogs.s3.us-west-2.amazonaws.com".to_string(),
            bucket: "sentinel-cogs".to_string(),
            region: "us-west-2".to_string(),
        }]
    }

    #[test]
    fn test_location_from_url() {
        let location = S3Location::from_url("s3://my-bucket/path/to/file.tif").unwrap();
        assert_eq!(location.bucket, "my-bucket");
        assert_eq!(location.key, "path/to/file.tif");
        assert_eq!(location.url(), "s3://my-bucket/path/to/file.tif");
    }

    #[test]
    fn test_location_invalid() {
        assert!(S3Location::from_url("http://bucket/file.tif").is_err());
        assert!(S3Location::from_url("s3://bucket/").is_err());
    }

    #[test]
    fn test_client_timeout_follows_read_timeout() {
        use object_store::ClientConfigKey;

        let options = client_options(Duration::from_secs(45));
        assert_eq!(
            options.get_config_value(&ClientConfigKey::Timeout).as_deref(),
            Some("45s")
        );
        assert_ne!(
            options.get_config_value(&ClientConfigKey::Timeout),
            ClientOptions::new().get_config_value(&ClientConfigKey::Timeout)
        );
    }

    #[test]
    fn test_public_bucket_rewrite() {
        let uri = "https://sentinel-cogs.s3.us-west-2.amazonaws.com/sentinel-s2-l2a-cogs/13/S/DD/2022/5/S2A_13SDD_20220503_0_L2A/TCI.tif";
        let location = rewrite_public_uri(uri, &sentinel_bucket()).unwrap();
        assert_eq!(location.bucket, "sentinel-cogs");
        assert_eq!(
            location.key,
            "sentinel-s2-l2a-cogs/13/S/DD/2022/5/S2A_13SDD_20220503_0_L2A/TCI.tif"
        );
        assert_eq!(location.region.as_deref(), Some("us-west-2"));
        assert!(location.skip_signature);
    }

    #[test]
    fn test_other_hosts_untouched() {
        let buckets = sentinel_bucket();
        assert!(rewrite_public_uri("https://example.com/a.tif", &buckets).is_none());
        assert!(
            rewrite_public_uri("http://sentinel-cogs.s3.us-west-2.amazonaws.com/a.tif", &buckets)
                .is_none()
        );
        assert!(rewrite_public_uri("/data/local.tif", &buckets).is_none());
    }
}
