//! Batch run statistics and their persistence

use crate::cache_store::write_atomic;
use crate::error::{FetchErrorKind, Result};
use crate::models::{epoch_millis, ImageVariant};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

/// Outcome of one (product, variant) unit of batch work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// A live entry was already cached; nothing was fetched
    AlreadyCached,
    /// Fetched and stored, `bytes` written to the cache
    Downloaded { bytes: u64 },
    Failed(FetchErrorKind),
}

/// Aggregated statistics of one batch run
///
/// Serialized with the field names of existing `stats-*.json` records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    /// Milliseconds since the Unix epoch
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Wall-clock run time in seconds, set when the run ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,

    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub downloaded: u64,
    pub already_cached: u64,
    pub total_bytes: u64,

    pub total_by_variant: BTreeMap<ImageVariant, u64>,
    pub success_by_variant: BTreeMap<ImageVariant, u64>,
    pub failed_by_variant: BTreeMap<ImageVariant, u64>,
    pub downloaded_by_variant: BTreeMap<ImageVariant, u64>,
    pub already_cached_by_variant: BTreeMap<ImageVariant, u64>,

    /// Failure histogram keyed by error kind
    pub error_types: BTreeMap<FetchErrorKind, u64>,

    /// Set when the run aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunStats {
    pub fn new() -> Self {
        RunStats {
            start_time: epoch_millis(SystemTime::now()),
            ..Default::default()
        }
    }

    /// Fold one unit's outcome into the totals
    pub fn record(&mut self, variant: ImageVariant, outcome: UnitOutcome) {
        self.total += 1;
        *self.total_by_variant.entry(variant).or_default() += 1;

        match outcome {
            UnitOutcome::AlreadyCached => {
                self.success += 1;
                self.already_cached += 1;
                *self.success_by_variant.entry(variant).or_default() += 1;
                *self.already_cached_by_variant.entry(variant).or_default() += 1;
            }
            UnitOutcome::Downloaded { bytes } => {
                self.success += 1;
                self.downloaded += 1;
                self.total_bytes += bytes;
                *self.success_by_variant.entry(variant).or_default() += 1;
                *self.downloaded_by_variant.entry(variant).or_default() += 1;
            }
            UnitOutcome::Failed(kind) => {
                self.failed += 1;
                *self.failed_by_variant.entry(variant).or_default() += 1;
                *self.error_types.entry(kind).or_default() += 1;
            }
        }
    }

    /// Number of failures of `kind`
    pub fn errors_of(&self, kind: FetchErrorKind) -> u64 {
        self.error_types.get(&kind).copied().unwrap_or(0)
    }

    /// Stamp the end of the run
    pub fn finish(&mut self) {
        let end = epoch_millis(SystemTime::now());
        self.end_time = Some(end);
        self.total_time = Some(end.saturating_sub(self.start_time) as f64 / 1000.0);
    }

    /// Stamp the end of an aborted run
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.finish();
        self.error = Some(reason.into());
    }

    /// Total written, in MB
    pub fn total_megabytes(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Persists run statistics as timestamped records plus a `latest.json`
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    dir: PathBuf,
}

impl StatsRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StatsRecorder { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record that always holds the most recent snapshot
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join("latest.json")
    }

    /// Write `stats` to `stats-<ms>.json` and `latest.json`
    ///
    /// # Returns
    /// The path of the timestamped record
    pub async fn save(&self, stats: &RunStats) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let json = Bytes::from(serde_json::to_vec_pretty(stats)?);
        let record = self
            .dir
            .join(format!("stats-{}.json", epoch_millis(SystemTime::now())));

        write_atomic(self.dir.clone(), record.clone(), json.clone()).await?;
        write_atomic(self.dir.clone(), self.latest_path(), json).await?;

        debug!("Saved run stats to {}", record.display());
        Ok(record)
    }

    /// Read back `latest.json`, if any run has been recorded
    pub async fn load_latest(&self) -> Result<Option<RunStats>> {
        match fs::read(self.latest_path()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
