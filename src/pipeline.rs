//! Fetch → optimize → store, shared by the batch, audit and serving paths

use crate::cache_key::{CacheKey, CacheKeyCodec};
use crate::cache_store::{CacheStore, WriteMetadata};
use crate::config::ImageCacheConfig;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::models::{EntryMetadata, ImageVariant, OutputFormat};
use crate::optimizer::{OptimizedImage, Optimizer};
use crate::origin_probe::OriginProbe;
use std::sync::Arc;
use tracing::{debug, warn};

/// The components every acquisition path needs, wired together
#[derive(Debug, Clone)]
pub struct ImagePipeline {
    pub store: CacheStore,
    pub probe: OriginProbe,
    pub fetcher: Fetcher,
    pub optimizer: Arc<Optimizer>,
}

impl ImagePipeline {
    pub fn new(store: CacheStore, probe: OriginProbe, fetcher: Fetcher, optimizer: Optimizer) -> Self {
        ImagePipeline {
            store,
            probe,
            fetcher,
            optimizer: Arc::new(optimizer),
        }
    }

    /// Build every component from configuration without touching the disk
    pub fn from_config(config: &ImageCacheConfig) -> Result<Self> {
        Ok(Self::new(
            CacheStore::new(config.cache_root_path(), config.cache_ttl()),
            OriginProbe::new(&config.origin)?,
            Fetcher::new(&config.origin)?,
            Optimizer::new(config.optimizer.clone()),
        ))
    }

    /// Download `url` and optimize it for `variant`
    ///
    /// Optimization runs on the blocking pool and never fails; see
    /// [`Optimizer::optimize_to`].
    pub async fn fetch_optimized(
        &self,
        url: &str,
        variant: ImageVariant,
        format: OutputFormat,
    ) -> Result<OptimizedImage> {
        let fetched = self.fetcher.fetch(url).await?;

        let optimizer = Arc::clone(&self.optimizer);
        let data = fetched.data.clone();
        let source_type = fetched.content_type.clone();
        let optimized = tokio::task::spawn_blocking(move || {
            optimizer.optimize_to(data, variant, &source_type, format)
        })
        .await;

        match optimized {
            Ok(image) => Ok(image),
            Err(e) => {
                warn!("Optimizer task failed for url={}: {}", url, e);
                Ok(OptimizedImage {
                    data: fetched.data,
                    content_type: fetched.content_type,
                    optimized: false,
                })
            }
        }
    }

    /// Persist an optimized image under `key`
    pub async fn store_image(
        &self,
        key: &CacheKey,
        url: &str,
        variant: ImageVariant,
        image: &OptimizedImage,
    ) -> Result<EntryMetadata> {
        self.store
            .write(
                key,
                variant,
                image.data.clone(),
                WriteMetadata {
                    original_url: Some(url.to_string()),
                    content_type: image.content_type.clone(),
                    optimized: image.optimized,
                },
            )
            .await
    }

    /// Fetch, optimize into the preferred format and store, replacing any
    /// existing entry
    pub async fn refresh(&self, url: &str, variant: ImageVariant) -> Result<EntryMetadata> {
        let key = CacheKeyCodec::key(url)?;
        let image = self
            .fetch_optimized(url, variant, self.optimizer.preferred_format())
            .await?;
        let metadata = self.store_image(&key, url, variant, &image).await?;
        debug!(
            "Refreshed key={} variant={} ({} bytes, optimized={})",
            key, variant, metadata.content_length, metadata.optimized
        );
        Ok(metadata)
    }
}
