//! Offline batch downloader
//!
//! Product ids are split into sequential batches. Within a batch every
//! (product, variant) pair becomes a [`DownloadJob`] executed by a pool of at
//! most `concurrency` tokio tasks gated by a semaphore. Unit failures are
//! folded into [`RunStats`]; only a cache root or stats directory that cannot
//! be written aborts the run.

use crate::cache_key::CacheKeyCodec;
use crate::config::{BatchConfig, OriginConfig};
use crate::error::{FetchErrorKind, ImageCacheError, Result};
use crate::models::{DownloadJob, ImageVariant};
use crate::origin_probe::ProbeOutcome;
use crate::pipeline::ImagePipeline;
use crate::stats::{RunStats, StatsRecorder, UnitOutcome};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Supplies the product ids a run should cache
#[async_trait]
pub trait ProductSource: Send + Sync {
    /// Ordered product ids, at most `limit` of them when set
    async fn product_ids(&self, limit: Option<usize>) -> Result<Vec<String>>;
}

#[async_trait]
impl ProductSource for Vec<String> {
    async fn product_ids(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let n = limit.unwrap_or(self.len()).min(self.len());
        Ok(self[..n].to_vec())
    }
}

/// Reads product ids from a text file, one per line
///
/// Blank lines and lines starting with `#` are skipped.
#[derive(Debug, Clone)]
pub struct FileProductSource {
    path: PathBuf,
}

impl FileProductSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileProductSource { path: path.into() }
    }
}

#[async_trait]
impl ProductSource for FileProductSource {
    async fn product_ids(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ImageCacheError::ConfigError(format!(
                "Failed to read product list {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let ids = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string);

        Ok(match limit {
            Some(limit) => ids.take(limit).collect(),
            None => ids.collect(),
        })
    }
}

/// What a run is expected to cost, shown before it starts
#[derive(Debug, Clone, PartialEq)]
pub struct RunEstimate {
    pub products: usize,
    pub variants: Vec<ImageVariant>,
    pub expected_downloads: usize,
    pub estimated_megabytes: f64,
}

impl RunEstimate {
    pub fn new(products: usize, variants: &[ImageVariant]) -> Self {
        let kb_per_product: f64 = variants.iter().map(|v| v.average_size_kb()).sum();
        RunEstimate {
            products,
            variants: variants.to_vec(),
            expected_downloads: products * variants.len(),
            estimated_megabytes: products as f64 * kb_per_product / 1024.0,
        }
    }
}

/// Decides whether a run may start
pub trait RunConfirmation: Send + Sync {
    fn confirm(&self, estimate: &RunEstimate) -> bool;
}

/// Confirms every run
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl RunConfirmation for AutoConfirm {
    fn confirm(&self, _estimate: &RunEstimate) -> bool {
        true
    }
}

/// Result of [`BatchScheduler::run`]
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunStats),
    /// The confirmation step declined the run; nothing was fetched
    Declined(RunEstimate),
}

/// Runs download jobs in sequential batches with bounded concurrency
pub struct BatchScheduler {
    pipeline: Arc<ImagePipeline>,
    config: BatchConfig,
    origin_base: String,
    recorder: StatsRecorder,
}

impl BatchScheduler {
    pub fn new(pipeline: Arc<ImagePipeline>, config: BatchConfig, origin: &OriginConfig) -> Self {
        let recorder = StatsRecorder::new(pipeline.store.stats_dir());
        BatchScheduler {
            pipeline,
            config,
            origin_base: origin.base_url(),
            recorder,
        }
    }

    pub fn recorder(&self) -> &StatsRecorder {
        &self.recorder
    }

    /// Execute a full run
    ///
    /// # Returns
    /// * `Ok(RunOutcome::Completed)` with the final statistics
    /// * `Ok(RunOutcome::Declined)` when confirmation was refused
    /// * `Err` when the cache layout, product source or stats directory fail
    pub async fn run(
        &self,
        source: &dyn ProductSource,
        confirmation: &dyn RunConfirmation,
    ) -> Result<RunOutcome> {
        self.pipeline.store.ensure_layout(&self.config.variants).await?;

        let ids = match source.product_ids(self.config.limit).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to load product ids: {}", e);
                let mut stats = RunStats::new();
                stats.abort(e.to_string());
                if let Err(save_err) = self.recorder.save(&stats).await {
                    warn!("Failed to record aborted run: {}", save_err);
                }
                return Err(e);
            }
        };
        let estimate = RunEstimate::new(ids.len(), &self.config.variants);
        info!(
            "Run covers {} products x {} variants = {} downloads (~{:.2} MB)",
            estimate.products,
            estimate.variants.len(),
            estimate.expected_downloads,
            estimate.estimated_megabytes
        );

        if !self.config.skip_confirmation && !confirmation.confirm(&estimate) {
            info!("Run declined");
            return Ok(RunOutcome::Declined(estimate));
        }

        self.run_ids(ids).await.map(RunOutcome::Completed)
    }

    /// Execute a run over `ids` without a confirmation step
    pub async fn run_ids(&self, ids: Vec<String>) -> Result<RunStats> {
        let ids = match self.config.limit {
            Some(limit) => ids.into_iter().take(limit).collect::<Vec<_>>(),
            None => ids,
        };

        self.pipeline.store.ensure_layout(&self.config.variants).await?;

        let mut stats = RunStats::new();
        // Nothing is fetched unless the stats directory is writable
        self.recorder.save(&stats).await?;

        let total_units = ids.len() * self.config.variants.len();
        let batch_size = self.config.batch_size.max(1);
        let batch_count = ids.len().div_ceil(batch_size);

        for (index, chunk) in ids.chunks(batch_size).enumerate() {
            info!(
                "Processing batch {}/{} ({} products)",
                index + 1,
                batch_count,
                chunk.len()
            );
            let jobs = self.jobs_for(chunk);
            self.run_batch(jobs, &mut stats, total_units).await;

            if let Err(e) = self.recorder.save(&stats).await {
                warn!("Failed to save stats after batch {}: {}", index + 1, e);
            }
        }

        stats.finish();
        if let Err(e) = self.recorder.save(&stats).await {
            error!("Failed to save final stats: {}", e);
            stats.abort(e.to_string());
            return Err(e);
        }

        info!(
            "Run completed in {:.2}s: {} downloaded, {} already cached, {} failed, {:.2} MB written",
            stats.total_time.unwrap_or_default(),
            stats.downloaded,
            stats.already_cached,
            stats.failed,
            stats.total_megabytes()
        );
        Ok(stats)
    }

    fn jobs_for(&self, product_ids: &[String]) -> Vec<DownloadJob> {
        product_ids
            .iter()
            .flat_map(|id| {
                self.config
                    .variants
                    .iter()
                    .map(move |variant| DownloadJob::new(id.as_str(), *variant, &self.origin_base))
            })
            .collect()
    }

    /// Run one batch to completion
    async fn run_batch(&self, jobs: Vec<DownloadJob>, stats: &mut RunStats, total_units: usize) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(jobs.len());

        for job in jobs {
            let sem = Arc::clone(&semaphore);
            let pipeline = Arc::clone(&self.pipeline);
            let force_refetch = self.config.force_refetch;
            let delay = self.config.request_delay();
            let variant = job.variant;

            let task = tokio::spawn(async move {
                // Acquire semaphore permit to limit concurrency
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return UnitOutcome::Failed(FetchErrorKind::TransportError),
                };

                let outcome = process_unit(&pipeline, &job, force_refetch).await;
                // The slot stays held during the delay to pace the origin
                sleep(delay).await;
                outcome
            });

            tasks.push((variant, task));
        }

        for (variant, task) in tasks {
            let outcome = task.await.unwrap_or_else(|e| {
                error!("Download task failed: {}", e);
                UnitOutcome::Failed(FetchErrorKind::TransportError)
            });
            stats.record(variant, outcome);

            info!(
                "Progress: {}/{} ({} ok, {} failed)",
                stats.total, total_units, stats.success, stats.failed
            );
        }
    }
}

/// Cache check, then probe → fetch → optimize → store for one job
async fn process_unit(pipeline: &ImagePipeline, job: &DownloadJob, force_refetch: bool) -> UnitOutcome {
    let key = match CacheKeyCodec::key(&job.origin_url) {
        Ok(key) => key,
        Err(e) => {
            warn!("Skipping product {}: {}", job.product_id, e);
            return UnitOutcome::Failed(e.kind());
        }
    };

    if !force_refetch
        && pipeline.store.exists(&key, job.variant).await
        && !pipeline.store.is_expired(&key, job.variant).await
    {
        debug!(
            "Already cached: product={} variant={}",
            job.product_id, job.variant
        );
        return UnitOutcome::AlreadyCached;
    }

    match pipeline.probe.probe(&job.origin_url).await {
        ProbeOutcome::Present => {}
        ProbeOutcome::Absent => {
            debug!(
                "No image on origin: product={} variant={}",
                job.product_id, job.variant
            );
            return UnitOutcome::Failed(FetchErrorKind::NotFound);
        }
        ProbeOutcome::Unreachable => {
            return UnitOutcome::Failed(FetchErrorKind::TransportError);
        }
    }

    match pipeline.refresh(&job.origin_url, job.variant).await {
        Ok(metadata) => UnitOutcome::Downloaded {
            bytes: metadata.content_length,
        },
        Err(e) => {
            warn!(
                "Failed product={} variant={}: {}",
                job.product_id, job.variant, e
            );
            UnitOutcome::Failed(e.kind())
        }
    }
}
