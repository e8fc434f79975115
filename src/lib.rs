//! Product Image Cache
//!
//! Fetches product images from a single trusted origin, stores them in a
//! size-partitioned on-disk cache, re-encodes them into web-friendly variants
//! and serves them with cache-hit/miss semantics and a redirect fallback to the
//! origin.
//!
//! # Overview
//!
//! Two paths share one cache directory:
//!
//! - **Batch**: [`BatchScheduler`] walks a list of product ids, fetching every
//!   configured [`ImageVariant`] with bounded concurrency and recording
//!   [`RunStats`].
//! - **Serving**: [`ServingProxy`] answers `GET /api/image` requests, filling
//!   the cache on a miss. [`ImageServer`] puts it behind hyper.
//!
//! [`IntegrityAuditor`] walks the cache afterwards, rebuilding lost sidecars
//! and re-fetching corrupted blobs.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use product_image_cache::{BatchScheduler, ImageCacheConfig, ImagePipeline};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ImageCacheConfig::from_file("image_cache.yaml")?;
//! let pipeline = Arc::new(ImagePipeline::from_config(&config)?);
//!
//! let scheduler = BatchScheduler::new(pipeline, config.batch.clone(), &config.origin);
//! let stats = scheduler.run_ids(vec!["12345".to_string()]).await?;
//! println!("downloaded {} images", stats.downloaded);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! cache_root: .image-cache
//! cache_ttl_secs: 2592000          # 30 days
//! origin:
//!   host: bilder.vinmonopolet.no
//!   retries: 2
//! batch:
//!   variants: [small, medium]
//!   concurrency: 5
//! optimizer:
//!   preferred_format: webp
//! ```
//!
//! See [`ImageCacheConfig`] for every option.
//!
//! # Cache layout
//!
//! ```text
//! <root>/<variant>/<md5(url)>        image bytes
//! <root>/<variant>/<md5(url)>.meta   JSON sidecar
//! <root>/stats/stats-<ms>.json       batch run records
//! <root>/stats/latest.json
//! ```

pub mod auditor;
pub mod batch;
pub mod cache_key;
pub mod cache_store;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod origin_probe;
pub mod pipeline;
pub mod placeholder;
pub mod server;
pub mod serving;
pub mod stats;

// Re-export commonly used types
pub use auditor::{AuditSummary, IntegrityAuditor};
pub use batch::{
    AutoConfirm, BatchScheduler, FileProductSource, ProductSource, RunConfirmation, RunEstimate,
    RunOutcome,
};
pub use cache_key::{CacheKey, CacheKeyCodec};
pub use cache_store::{CacheStore, CacheSummary, WriteMetadata};
pub use config::ImageCacheConfig;
pub use error::{FetchErrorKind, ImageCacheError, Result};
pub use fetcher::{FetchedImage, Fetcher, RetryPolicy};
pub use metrics::ServingMetrics;
pub use models::{CacheEntry, DownloadJob, EntryMetadata, ImageVariant, OutputFormat};
pub use optimizer::{OptimizedImage, Optimizer};
pub use origin_probe::{OriginProbe, ProbeOutcome};
pub use pipeline::ImagePipeline;
pub use placeholder::PlaceholderTracker;
pub use server::ImageServer;
pub use serving::{CacheStatus, ImageRequest, ImageResponse, ServeState, ServingProxy};
pub use stats::{RunStats, StatsRecorder, UnitOutcome};
