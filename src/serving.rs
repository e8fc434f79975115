//! Request-time image serving
//!
//! A request moves through `Miss → Fetching → Optimizing → Stored →
//! Responding`; any failure after validation lands in `Error` and then
//! `RedirectFallback`, sending the client to the origin URL itself. Only a
//! malformed request (400) or a confirmed absence on the origin (404) is
//! answered with an error status.

use crate::cache_key::{CacheKey, CacheKeyCodec};
use crate::config::ServerConfig;
use crate::error::{ImageCacheError, Result};
use crate::metrics::ServingMetrics;
use crate::models::{CacheEntry, ImageVariant, OutputFormat};
use crate::origin_probe::ProbeOutcome;
use crate::pipeline::ImagePipeline;
use crate::placeholder::PlaceholderTracker;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cache-Control value sent with every image
pub const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000";

/// Parameters of `GET /api/image`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRequest {
    /// Origin image URL
    pub url: String,
    /// Variant name as sent by the client
    pub size: String,
    /// Bypass cache lookup and do not store the result
    pub skip_cache: bool,
    /// Requested output encoding, defaults to the configured one
    pub format: Option<String>,
}

impl ImageRequest {
    pub fn new(url: impl Into<String>, size: impl Into<String>) -> Self {
        ImageRequest {
            url: url.into(),
            size: size.into(),
            ..Default::default()
        }
    }
}

/// Where the served bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Expired entry served because its refresh failed
    Stale,
}

impl CacheStatus {
    /// Value of the `X-Cache` response header
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

/// Answer to an image request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageResponse {
    Image {
        data: Bytes,
        content_type: String,
        cache_status: CacheStatus,
    },
    /// 302 to the origin
    Redirect { location: String },
    NotFound { message: String },
    BadRequest { message: String },
}

impl ImageResponse {
    pub fn status(&self) -> u16 {
        match self {
            ImageResponse::Image { .. } => 200,
            ImageResponse::Redirect { .. } => 302,
            ImageResponse::NotFound { .. } => 404,
            ImageResponse::BadRequest { .. } => 400,
        }
    }

    /// Metrics label
    pub fn outcome(&self) -> &'static str {
        match self {
            ImageResponse::Image {
                cache_status: CacheStatus::Hit,
                ..
            } => "hit",
            ImageResponse::Image {
                cache_status: CacheStatus::Miss,
                ..
            } => "miss",
            ImageResponse::Image {
                cache_status: CacheStatus::Stale,
                ..
            } => "stale",
            ImageResponse::Redirect { .. } => "redirect",
            ImageResponse::NotFound { .. } => "not_found",
            ImageResponse::BadRequest { .. } => "bad_request",
        }
    }

    fn body_len(&self) -> usize {
        match self {
            ImageResponse::Image { data, .. } => data.len(),
            _ => 0,
        }
    }

    fn bad_request(err: ImageCacheError) -> Self {
        ImageResponse::BadRequest {
            message: err.to_string(),
        }
    }
}

/// Request lifecycle states, logged as requests progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeState {
    Miss,
    Fetching,
    Optimizing,
    Stored,
    Responding,
    Error,
    RedirectFallback,
}

impl fmt::Display for ServeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServeState::Miss => "miss",
            ServeState::Fetching => "fetching",
            ServeState::Optimizing => "optimizing",
            ServeState::Stored => "stored",
            ServeState::Responding => "responding",
            ServeState::Error => "error",
            ServeState::RedirectFallback => "redirect_fallback",
        };
        f.write_str(name)
    }
}

/// A validated request
struct ServePlan {
    url: String,
    key: CacheKey,
    variant: ImageVariant,
    format: OutputFormat,
    /// Read from and write to the cache
    use_cache: bool,
}

type InflightKey = (CacheKey, ImageVariant);

/// One async lock per (key, variant) currently being filled
#[derive(Default)]
struct InflightRegistry {
    locks: Mutex<HashMap<InflightKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InflightRegistry {
    fn acquire(&self, key: &InflightKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drop the registry entry once no other request holds it
    fn release(&self, key: &InflightKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Registry + this handle
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// ServingProxy answers image requests from the cache, filling it from the
/// origin on a miss
pub struct ServingProxy {
    pipeline: Arc<ImagePipeline>,
    config: ServerConfig,
    url_prefix: String,
    placeholders: PlaceholderTracker,
    inflight: InflightRegistry,
    metrics: Option<ServingMetrics>,
}

impl ServingProxy {
    /// Create a proxy trusting only URLs under `url_prefix`
    pub fn new(pipeline: Arc<ImagePipeline>, config: ServerConfig, url_prefix: impl Into<String>) -> Self {
        let placeholders = PlaceholderTracker::new(config.placeholder_capacity);
        ServingProxy {
            pipeline,
            config,
            url_prefix: url_prefix.into(),
            placeholders,
            inflight: InflightRegistry::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ServingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn placeholders(&self) -> &PlaceholderTracker {
        &self.placeholders
    }

    /// Number of (key, variant) pairs currently being fetched
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Serve one request
    pub async fn handle(&self, request: &ImageRequest) -> ImageResponse {
        let start = Instant::now();
        let response = match self.validate(request) {
            Ok(plan) => self.serve(plan).await,
            Err(e) => {
                debug!("Rejected request url={} size={}: {}", request.url, request.size, e);
                ImageResponse::bad_request(e)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_request(
                response.outcome(),
                response.body_len(),
                start.elapsed().as_secs_f64(),
            );
        }
        response
    }

    /// Answer from the cache alone, for `HEAD` requests
    ///
    /// Never contacts the origin. A cached entry answers as `HIT` (or `STALE`
    /// once past its TTL); anything else redirects to the origin URL.
    pub async fn peek(&self, request: &ImageRequest) -> ImageResponse {
        let plan = match self.validate(request) {
            Ok(plan) => plan,
            Err(e) => return ImageResponse::bad_request(e),
        };
        if !plan.use_cache {
            return ImageResponse::Redirect { location: plan.url };
        }

        match self.lookup(&plan).await {
            Lookup::Live(entry) => hit(entry),
            Lookup::Expired(entry) => ImageResponse::Image {
                content_type: entry.metadata.content_type,
                data: entry.data,
                cache_status: CacheStatus::Stale,
            },
            Lookup::Absent => ImageResponse::Redirect { location: plan.url },
        }
    }

    /// Check everything that needs no I/O
    fn validate(&self, request: &ImageRequest) -> Result<ServePlan> {
        if request.url.is_empty() {
            return Err(ImageCacheError::InvalidRequest(
                "url parameter required".to_string(),
            ));
        }
        if !request.url.starts_with(&self.url_prefix) {
            return Err(ImageCacheError::InvalidRequest(format!(
                "only images under {} are allowed",
                self.url_prefix
            )));
        }

        let variant: ImageVariant = request.size.parse()?;
        if !self.config.allowed_variants.contains(&variant) {
            return Err(ImageCacheError::InvalidRequest(format!(
                "size '{}' is not enabled",
                variant
            )));
        }

        let preferred = self.pipeline.optimizer.preferred_format();
        let format = match &request.format {
            Some(format) => format.parse()?,
            None => preferred,
        };

        let key = CacheKeyCodec::key(&request.url)?;

        Ok(ServePlan {
            url: request.url.clone(),
            key,
            variant,
            format,
            // The cache holds one encoding per entry: the preferred one
            use_cache: !request.skip_cache && format == preferred,
        })
    }

    async fn serve(&self, plan: ServePlan) -> ImageResponse {
        if !plan.use_cache {
            return self.fill(&plan, None).await;
        }

        let stale = match self.lookup(&plan).await {
            Lookup::Live(entry) => return hit(entry),
            Lookup::Expired(entry) => Some(entry),
            Lookup::Absent => None,
        };

        let inflight_key = (plan.key.clone(), plan.variant);
        let lock = self.inflight.acquire(&inflight_key);
        let response = {
            let _guard = lock.lock().await;
            // Another request may have filled the entry while we waited
            match self.lookup(&plan).await {
                Lookup::Live(entry) => hit(entry),
                _ => self.fill(&plan, stale).await,
            }
        };
        self.inflight.release(&inflight_key, lock);
        response
    }

    async fn lookup(&self, plan: &ServePlan) -> Lookup {
        match self.pipeline.store.read(&plan.key, plan.variant).await {
            Ok(Some(entry)) if entry.is_expired(self.pipeline.store.ttl()) => Lookup::Expired(entry),
            Ok(Some(entry)) => Lookup::Live(entry),
            Ok(None) => Lookup::Absent,
            Err(e) => {
                warn!("Cache read failed for key={}: {}", plan.key, e);
                Lookup::Absent
            }
        }
    }

    /// Probe, fetch, optimize and (when caching) store
    async fn fill(&self, plan: &ServePlan, stale: Option<CacheEntry>) -> ImageResponse {
        self.trace(plan, ServeState::Miss);

        // The tracker only records outcomes; every miss asks the origin again
        match self.pipeline.probe.probe(&plan.url).await {
            ProbeOutcome::Present => {}
            ProbeOutcome::Absent => {
                self.placeholders.mark_placeholder(&plan.url);
                return not_found(&plan.url);
            }
            ProbeOutcome::Unreachable => {
                let err = ImageCacheError::TransportError("origin probe failed".to_string());
                return self.fallback(plan, stale, err);
            }
        }

        self.trace(plan, ServeState::Fetching);
        let image = match self
            .pipeline
            .fetch_optimized(&plan.url, plan.variant, plan.format)
            .await
        {
            Ok(image) => image,
            Err(e) if !e.fallback_to_origin() => return ImageResponse::bad_request(e),
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_fetch_failure(e.kind());
                }
                return self.fallback(plan, stale, e);
            }
        };
        self.trace(plan, ServeState::Optimizing);
        self.placeholders.mark_loaded(&plan.url);

        if plan.use_cache {
            match self
                .pipeline
                .store_image(&plan.key, &plan.url, plan.variant, &image)
                .await
            {
                Ok(_) => self.trace(plan, ServeState::Stored),
                // The fetched bytes are still good to serve
                Err(e) => warn!("Failed to cache key={} variant={}: {}", plan.key, plan.variant, e),
            }
        }

        self.trace(plan, ServeState::Responding);
        ImageResponse::Image {
            data: image.data,
            content_type: image.content_type,
            cache_status: CacheStatus::Miss,
        }
    }

    fn fallback(&self, plan: &ServePlan, stale: Option<CacheEntry>, err: ImageCacheError) -> ImageResponse {
        self.trace(plan, ServeState::Error);

        if let (true, Some(entry)) = (self.config.serve_stale_on_error, stale) {
            info!(
                "Serving stale entry for key={} variant={} after error: {}",
                plan.key, plan.variant, err
            );
            return ImageResponse::Image {
                content_type: entry.metadata.content_type,
                data: entry.data,
                cache_status: CacheStatus::Stale,
            };
        }

        self.trace(plan, ServeState::RedirectFallback);
        warn!("Redirecting to origin url={} after error: {}", plan.url, err);
        ImageResponse::Redirect {
            location: plan.url.clone(),
        }
    }

    fn trace(&self, plan: &ServePlan, state: ServeState) {
        debug!("key={} variant={} state={}", plan.key, plan.variant, state);
    }
}

enum Lookup {
    Live(CacheEntry),
    Expired(CacheEntry),
    Absent,
}

fn hit(entry: CacheEntry) -> ImageResponse {
    debug!("Cache hit key={} variant={}", entry.key, entry.variant);
    ImageResponse::Image {
        content_type: entry.metadata.content_type,
        data: entry.data,
        cache_status: CacheStatus::Hit,
    }
}

fn not_found(url: &str) -> ImageResponse {
    ImageResponse::NotFound {
        message: format!("Image not found: {}", url),
    }
}
