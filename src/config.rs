//! Configuration management for the product image cache

use crate::error::{ImageCacheError, Result};
use crate::models::{ImageVariant, OutputFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageCacheConfig {
    /// Root of the on-disk cache (default: .image-cache)
    #[serde(default = "default_cache_root")]
    pub cache_root: String,

    /// Entry lifetime in seconds before it counts as a miss (default: 30 days)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub origin: OriginConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

/// Origin access settings shared by the probe and the fetcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginConfig {
    /// Origin URL scheme, http or https (default: https)
    #[serde(default = "default_origin_scheme")]
    pub scheme: String,

    /// Trusted origin host, without scheme (default: bilder.vinmonopolet.no)
    #[serde(default = "default_origin_host")]
    pub host: String,

    /// User-Agent attached to every origin request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HEAD probe timeout in milliseconds (default: 5000)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Per-attempt GET timeout in milliseconds (default: 10000)
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Extra attempts after the first failed fetch (default: 2)
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Fixed delay between fetch attempts in milliseconds (default: 1000)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Payloads smaller than this are rejected as placeholders (default: 100)
    #[serde(default = "default_min_image_bytes")]
    pub min_image_bytes: usize,
}

/// Offline batch download settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Variants fetched for every product (default: small, medium)
    #[serde(default = "default_batch_variants")]
    pub variants: Vec<ImageVariant>,

    /// Products per batch; batches run one after another (default: 20)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent workers within a batch (default: 5)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pause a worker takes after each unit, in milliseconds (default: 100)
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Re-download images that are already cached (default: false)
    #[serde(default)]
    pub force_refetch: bool,

    /// Hard cap on processed product ids
    #[serde(default)]
    pub limit: Option<usize>,

    /// Skip the pre-run confirmation step (default: false)
    #[serde(default)]
    pub skip_confirmation: bool,
}

/// PNG compression effort
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PngCompression {
    Fast,
    Default,
    #[default]
    Best,
}

/// Re-encoding settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerConfig {
    /// When false, fetched bytes are stored as-is (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Output encoding when the request does not ask for one (default: webp)
    #[serde(default)]
    pub preferred_format: OutputFormat,

    /// Lossy WebP quality, 0-100 (default: 80)
    #[serde(default = "default_webp_quality")]
    pub webp_quality: f32,

    /// JPEG quality, 1-100 (default: 85)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default)]
    pub png_compression: PngCompression,
}

/// Request-time serving settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address for the image endpoint (default: 127.0.0.1:3000)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Variants clients may request (default: all four)
    #[serde(default = "default_all_variants")]
    pub allowed_variants: Vec<ImageVariant>,

    /// Capacity of the placeholder tracker (default: 4096)
    #[serde(default = "default_placeholder_capacity")]
    pub placeholder_capacity: usize,

    /// Serve an expired entry when its refresh fails (default: true)
    #[serde(default = "default_true")]
    pub serve_stale_on_error: bool,
}

/// Integrity audit settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    /// Variant directories to walk (default: all four)
    #[serde(default = "default_all_variants")]
    pub variants: Vec<ImageVariant>,

    /// Recompute and compare checksums (default: true)
    #[serde(default = "default_true")]
    pub checksum_verification: bool,

    /// Re-fetch corrupted entries whose origin URL is known (default: true)
    #[serde(default = "default_true")]
    pub repair: bool,
}

// Default value functions for serde
fn default_cache_root() -> String {
    ".image-cache".to_string()
}

fn default_cache_ttl() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

fn default_origin_scheme() -> String {
    "https".to_string()
}

fn default_origin_host() -> String {
    "bilder.vinmonopolet.no".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 Vinmonopolet Explorer".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_min_image_bytes() -> usize {
    100
}

fn default_batch_variants() -> Vec<ImageVariant> {
    vec![ImageVariant::Small, ImageVariant::Medium]
}

fn default_all_variants() -> Vec<ImageVariant> {
    ImageVariant::ALL.to_vec()
}

fn default_batch_size() -> usize {
    20
}

fn default_concurrency() -> usize {
    5
}

fn default_request_delay_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_webp_quality() -> f32 {
    80.0
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_listen_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_placeholder_capacity() -> usize {
    4096
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            scheme: default_origin_scheme(),
            host: default_origin_host(),
            user_agent: default_user_agent(),
            probe_timeout_ms: default_probe_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            min_image_bytes: default_min_image_bytes(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            variants: default_batch_variants(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            request_delay_ms: default_request_delay_ms(),
            force_refetch: false,
            limit: None,
            skip_confirmation: false,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_format: OutputFormat::default(),
            webp_quality: default_webp_quality(),
            jpeg_quality: default_jpeg_quality(),
            png_compression: PngCompression::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            allowed_variants: default_all_variants(),
            placeholder_capacity: default_placeholder_capacity(),
            serve_stale_on_error: true,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            variants: default_all_variants(),
            checksum_verification: true,
            repair: true,
        }
    }
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        ImageCacheConfig {
            cache_root: default_cache_root(),
            cache_ttl_secs: default_cache_ttl(),
            origin: OriginConfig::default(),
            batch: BatchConfig::default(),
            optimizer: OptimizerConfig::default(),
            server: ServerConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl OriginConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Scheme and host, without a trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Prefix every trusted image URL starts with
    pub fn url_prefix(&self) -> String {
        format!("{}/", self.base_url())
    }
}

impl BatchConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

impl ImageCacheConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(ImageCacheConfig)` if loading and validation succeed
    /// * `Err(ImageCacheError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ImageCacheError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ImageCacheConfig = serde_yaml::from_str(content).map_err(|e| {
            ImageCacheError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_root_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_root)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - cache_root must not be empty and cache_ttl_secs must be > 0
    /// - origin host must be a bare host name, scheme http or https
    /// - batch_size and concurrency must be > 0, variants must not be empty
    /// - retries must be <= 10
    /// - quality settings must be within their encoder ranges
    /// - listen_address must be a socket address
    pub fn validate(&self) -> Result<()> {
        const MAX_RETRIES: usize = 10;

        if self.cache_root.trim().is_empty() {
            return Err(ImageCacheError::ConfigError(
                "cache_root must not be empty".to_string(),
            ));
        }

        if self.cache_ttl_secs == 0 {
            return Err(ImageCacheError::ConfigError(
                "cache_ttl_secs must be greater than 0".to_string(),
            ));
        }

        let host = self.origin.host.trim();
        if host.is_empty() || host.contains("://") || host.contains('/') {
            return Err(ImageCacheError::ConfigError(format!(
                "origin.host must be a bare host name, got '{}'",
                self.origin.host
            )));
        }

        if !matches!(self.origin.scheme.as_str(), "http" | "https") {
            return Err(ImageCacheError::ConfigError(format!(
                "origin.scheme must be http or https, got '{}'",
                self.origin.scheme
            )));
        }

        if self.origin.retries > MAX_RETRIES {
            return Err(ImageCacheError::ConfigError(format!(
                "origin.retries must be at most {}, got {}",
                MAX_RETRIES, self.origin.retries
            )));
        }

        if self.origin.fetch_timeout_ms == 0 || self.origin.probe_timeout_ms == 0 {
            return Err(ImageCacheError::ConfigError(
                "origin timeouts must be greater than 0".to_string(),
            ));
        }

        if self.batch.batch_size == 0 {
            return Err(ImageCacheError::ConfigError(
                "batch.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.batch.concurrency == 0 {
            return Err(ImageCacheError::ConfigError(
                "batch.concurrency must be greater than 0".to_string(),
            ));
        }

        if self.batch.variants.is_empty() {
            return Err(ImageCacheError::ConfigError(
                "batch.variants must list at least one size".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.optimizer.webp_quality) {
            return Err(ImageCacheError::ConfigError(format!(
                "optimizer.webp_quality must be between 0 and 100, got {}",
                self.optimizer.webp_quality
            )));
        }

        if self.optimizer.jpeg_quality == 0 || self.optimizer.jpeg_quality > 100 {
            return Err(ImageCacheError::ConfigError(format!(
                "optimizer.jpeg_quality must be between 1 and 100, got {}",
                self.optimizer.jpeg_quality
            )));
        }

        if self.server.allowed_variants.is_empty() {
            return Err(ImageCacheError::ConfigError(
                "server.allowed_variants must list at least one size".to_string(),
            ));
        }

        if self.server.placeholder_capacity == 0 {
            return Err(ImageCacheError::ConfigError(
                "server.placeholder_capacity must be greater than 0".to_string(),
            ));
        }

        self.server
            .listen_address
            .parse::<SocketAddr>()
            .map_err(|e| {
                ImageCacheError::ConfigError(format!(
                    "server.listen_address '{}' is invalid: {}",
                    self.server.listen_address, e
                ))
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ImageCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl(), Duration::from_secs(2_592_000));
        assert_eq!(config.origin.url_prefix(), "https://bilder.vinmonopolet.no/");
        assert_eq!(config.batch.variants, vec![ImageVariant::Small, ImageVariant::Medium]);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
cache_root: /tmp/images
batch:
  variants: [tiny, large]
  concurrency: 2
optimizer:
  preferred_format: jpeg
"#;
        let config = ImageCacheConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cache_root, "/tmp/images");
        assert_eq!(config.batch.variants, vec![ImageVariant::Tiny, ImageVariant::Large]);
        assert_eq!(config.batch.concurrency, 2);
        assert_eq!(config.batch.batch_size, 20);
        assert_eq!(config.optimizer.preferred_format, OutputFormat::Jpeg);
        assert_eq!(config.origin.retries, 2);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = ImageCacheConfig::default();
        config.batch.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_host_with_scheme() {
        let mut config = ImageCacheConfig::default();
        config.origin.host = "https://bilder.vinmonopolet.no".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_variant() {
        let yaml = "batch:\n  variants: [huge]\n";
        assert!(ImageCacheConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_bad_quality() {
        let mut config = ImageCacheConfig::default();
        config.optimizer.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = ImageCacheConfig::default();
        config.optimizer.webp_quality = 120.0;
        assert!(config.validate().is_err());
    }
}
