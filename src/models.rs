//! Core data models for the product image cache

use crate::cache_key::CacheKey;
use crate::error::{ImageCacheError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One of the four fixed size classes the origin publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVariant {
    Tiny,
    Small,
    Medium,
    Large,
}

impl ImageVariant {
    /// Every variant, smallest first
    pub const ALL: [ImageVariant; 4] = [
        ImageVariant::Tiny,
        ImageVariant::Small,
        ImageVariant::Medium,
        ImageVariant::Large,
    ];

    /// Target bounding box edge in pixels
    pub fn dimension(&self) -> u32 {
        match self {
            ImageVariant::Tiny => 100,
            ImageVariant::Small => 300,
            ImageVariant::Medium => 515,
            ImageVariant::Large => 800,
        }
    }

    /// Path segment the origin uses for this size
    pub fn size_code(&self) -> &'static str {
        match self {
            ImageVariant::Tiny => "100x100-0",
            ImageVariant::Small => "300x300-0",
            ImageVariant::Medium => "515x515-0",
            ImageVariant::Large => "800x800-0",
        }
    }

    /// Name used for the cache subdirectory and in query strings
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariant::Tiny => "tiny",
            ImageVariant::Small => "small",
            ImageVariant::Medium => "medium",
            ImageVariant::Large => "large",
        }
    }

    /// Rough average stored size in KB, used for run estimates
    pub fn average_size_kb(&self) -> f64 {
        match self {
            ImageVariant::Tiny => 7.5,
            ImageVariant::Small => 22.5,
            ImageVariant::Medium => 45.0,
            ImageVariant::Large => 90.0,
        }
    }

    /// Build the origin URL of a product's primary image at this size
    ///
    /// # Example
    /// ```
    /// use product_image_cache::ImageVariant;
    ///
    /// let url = ImageVariant::Small.origin_url("bilder.vinmonopolet.no", "12345");
    /// assert_eq!(url, "https://bilder.vinmonopolet.no/cache/300x300-0/12345-1.jpg");
    /// ```
    pub fn origin_url(&self, origin_host: &str, product_id: &str) -> String {
        self.origin_url_at(&format!("https://{}", origin_host), product_id)
    }

    /// Same as [`ImageVariant::origin_url`] for an origin given as
    /// `scheme://host`
    pub fn origin_url_at(&self, base_url: &str, product_id: &str) -> String {
        format!(
            "{}/cache/{}/{}-1.jpg",
            base_url.trim_end_matches('/'),
            self.size_code(),
            product_id
        )
    }
}

impl fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageVariant {
    type Err = ImageCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiny" => Ok(ImageVariant::Tiny),
            "small" => Ok(ImageVariant::Small),
            "medium" => Ok(ImageVariant::Medium),
            "large" => Ok(ImageVariant::Large),
            other => Err(ImageCacheError::InvalidRequest(format!(
                "unknown image size '{}', expected one of tiny, small, medium, large",
                other
            ))),
        }
    }
}

/// Output encodings the optimizer can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    WebP,
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::WebP => "image/webp",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::WebP
    }
}

impl FromStr for OutputFormat {
    type Err = ImageCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(OutputFormat::WebP),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            other => Err(ImageCacheError::InvalidRequest(format!(
                "unsupported output format '{}'",
                other
            ))),
        }
    }
}

/// Sidecar metadata persisted next to every cached blob
///
/// Field names match the `.meta` JSON files already present in existing caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Origin URL the blob was fetched from; absent for reconstructed sidecars
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    /// Milliseconds since the Unix epoch
    pub cached_at: u64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub content_length: u64,
    pub size: ImageVariant,
    pub checksum: String,
    #[serde(default)]
    pub optimized: bool,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl EntryMetadata {
    /// Whether this entry is older than `ttl` at time `now`
    pub fn is_expired_at(&self, ttl: Duration, now: SystemTime) -> bool {
        let now_ms = epoch_millis(now);
        now_ms.saturating_sub(self.cached_at) > ttl.as_millis() as u64
    }

    pub fn cached_at_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.cached_at)
    }
}

/// A cached blob together with its metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub variant: ImageVariant,
    pub data: Bytes,
    pub metadata: EntryMetadata,
    /// True when the sidecar was missing or unreadable and the metadata was
    /// rebuilt from the filesystem
    pub metadata_recovered: bool,
}

impl CacheEntry {
    pub fn content_type(&self) -> &str {
        &self.metadata.content_type
    }

    pub fn checksum(&self) -> &str {
        &self.metadata.checksum
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.metadata.is_expired_at(ttl, SystemTime::now())
    }
}

/// One unit of batch work: a product image at one size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub product_id: String,
    pub origin_url: String,
    pub variant: ImageVariant,
}

impl DownloadJob {
    /// Build a job against an origin given as `scheme://host`
    pub fn new(product_id: impl Into<String>, variant: ImageVariant, base_url: &str) -> Self {
        let product_id = product_id.into();
        let origin_url = variant.origin_url_at(base_url, &product_id);
        DownloadJob {
            product_id,
            origin_url,
            variant,
        }
    }
}

/// Milliseconds since the Unix epoch for `time`
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
