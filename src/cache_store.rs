//! Variant-partitioned on-disk image cache
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<variant>/<key>        blob
//! <root>/<variant>/<key>.meta   sidecar metadata (JSON)
//! <root>/stats/                 batch run records
//! ```
//!
//! Every mutation goes through a temp-file-then-rename write so readers never
//! observe a partially written blob. The store performs no retries.

use crate::cache_key::{self, CacheKey};
use crate::error::{ImageCacheError, Result};
use crate::models::{epoch_millis, CacheEntry, EntryMetadata, ImageVariant};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, warn};

/// Suffix distinguishing sidecar files from blobs
pub const META_SUFFIX: &str = ".meta";

/// Prefix of in-progress temp files
const TEMP_PREFIX: &str = ".tmp";

/// Name of the run statistics directory
pub const STATS_DIR: &str = "stats";

/// Caller-supplied part of the metadata for a new entry
#[derive(Debug, Clone)]
pub struct WriteMetadata {
    pub original_url: Option<String>,
    pub content_type: String,
    pub optimized: bool,
}

/// Filesystem-backed cache of image blobs
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    ttl: Duration,
}

impl CacheStore {
    /// Create a store handle without touching the filesystem
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        CacheStore {
            root: root.into(),
            ttl,
        }
    }

    /// Create the store and its directory layout
    ///
    /// Failing to create the root is fatal to the caller; nothing can be cached.
    pub async fn open(
        root: impl Into<PathBuf>,
        ttl: Duration,
        variants: &[ImageVariant],
    ) -> Result<Self> {
        let store = Self::new(root, ttl);
        store.ensure_layout(variants).await?;
        Ok(store)
    }

    /// Create the root, one directory per variant and the stats directory
    pub async fn ensure_layout(&self, variants: &[ImageVariant]) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            ImageCacheError::StorageError(format!(
                "Failed to create cache root {}: {}",
                self.root.display(),
                e
            ))
        })?;
        for variant in variants {
            fs::create_dir_all(self.variant_dir(*variant)).await?;
        }
        fs::create_dir_all(self.stats_dir()).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn variant_dir(&self, variant: ImageVariant) -> PathBuf {
        self.root.join(variant.as_str())
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.root.join(STATS_DIR)
    }

    pub fn blob_path(&self, key: &CacheKey, variant: ImageVariant) -> PathBuf {
        self.variant_dir(variant).join(key.as_str())
    }

    pub fn meta_path(&self, key: &CacheKey, variant: ImageVariant) -> PathBuf {
        self.variant_dir(variant)
            .join(format!("{}{}", key.as_str(), META_SUFFIX))
    }

    /// Hex digest stored in sidecars and re-verified by the auditor
    pub fn checksum(data: &[u8]) -> String {
        cache_key::checksum(data)
    }

    /// Whether a blob exists for (key, variant), regardless of age
    pub async fn exists(&self, key: &CacheKey, variant: ImageVariant) -> bool {
        fs::metadata(self.blob_path(key, variant))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Whether the entry is older than the TTL
    ///
    /// An absent entry counts as expired. Age comes from the sidecar, or from
    /// the blob's modification time when the sidecar is unusable.
    pub async fn is_expired(&self, key: &CacheKey, variant: ImageVariant) -> bool {
        let now = SystemTime::now();
        if let Ok(Some(meta)) = self.read_metadata(key, variant).await {
            return meta.is_expired_at(self.ttl, now);
        }
        match fs::metadata(self.blob_path(key, variant)).await {
            Ok(stat) => {
                let modified = stat.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                now.duration_since(modified).unwrap_or_default() > self.ttl
            }
            Err(_) => true,
        }
    }

    /// Read and parse the sidecar
    ///
    /// # Returns
    /// * `Ok(Some(meta))` when the sidecar exists and parses
    /// * `Ok(None)` when it is missing or not valid metadata
    /// * `Err` for other read failures
    pub async fn read_metadata(
        &self,
        key: &CacheKey,
        variant: ImageVariant,
    ) -> Result<Option<EntryMetadata>> {
        let path = self.meta_path(key, variant);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<EntryMetadata>(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!("Unreadable sidecar {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Read an entry
    ///
    /// A missing blob is a miss (`Ok(None)`), not an error. A missing or corrupt
    /// sidecar is tolerated by rebuilding metadata from the blob itself.
    pub async fn read(&self, key: &CacheKey, variant: ImageVariant) -> Result<Option<CacheEntry>> {
        let blob_path = self.blob_path(key, variant);
        let data = match fs::read(&blob_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache miss: key={} variant={}", key, variant);
                return Ok(None);
            }
            Err(e) => {
                return Err(ImageCacheError::StorageError(format!(
                    "Failed to read {}: {}",
                    blob_path.display(),
                    e
                )))
            }
        };

        let (metadata, metadata_recovered) = match self.read_metadata(key, variant).await {
            Ok(Some(meta)) => (meta, false),
            _ => (self.metadata_from_stat(key, variant, &data).await?, true),
        };

        Ok(Some(CacheEntry {
            key: key.clone(),
            variant,
            data,
            metadata,
            metadata_recovered,
        }))
    }

    /// Rebuild sidecar metadata from the blob and its filesystem stat
    pub async fn metadata_from_stat(
        &self,
        key: &CacheKey,
        variant: ImageVariant,
        data: &[u8],
    ) -> Result<EntryMetadata> {
        let stat = fs::metadata(self.blob_path(key, variant)).await?;
        let modified = stat.modified().unwrap_or_else(|_| SystemTime::now());
        let content_type = image::guess_format(data)
            .map(|f| f.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());

        Ok(EntryMetadata {
            original_url: None,
            cached_at: epoch_millis(modified),
            content_type,
            content_length: data.len() as u64,
            size: variant,
            checksum: Self::checksum(data),
            optimized: false,
        })
    }

    /// Store a blob and its sidecar
    ///
    /// Both files are replaced atomically; if the sidecar cannot be written the
    /// blob is removed again so the entry reads as absent.
    pub async fn write(
        &self,
        key: &CacheKey,
        variant: ImageVariant,
        data: Bytes,
        write_meta: WriteMetadata,
    ) -> Result<EntryMetadata> {
        let dir = self.variant_dir(variant);
        fs::create_dir_all(&dir).await.map_err(|e| {
            ImageCacheError::StorageError(format!(
                "Failed to create cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let metadata = EntryMetadata {
            original_url: write_meta.original_url,
            cached_at: epoch_millis(SystemTime::now()),
            content_type: write_meta.content_type,
            content_length: data.len() as u64,
            size: variant,
            checksum: Self::checksum(&data),
            optimized: write_meta.optimized,
        };

        let blob_path = self.blob_path(key, variant);
        write_atomic(dir.clone(), blob_path.clone(), data.clone()).await?;

        if let Err(e) = self.write_metadata(key, variant, &metadata).await {
            warn!(
                "Failed to write sidecar for key={} variant={}, dropping entry: {}",
                key, variant, e
            );
            let _ = fs::remove_file(&blob_path).await;
            let _ = fs::remove_file(self.meta_path(key, variant)).await;
            return Err(e);
        }

        debug!(
            "Stored key={} variant={} ({} bytes, {})",
            key,
            variant,
            data.len(),
            metadata.content_type
        );
        Ok(metadata)
    }

    /// Atomically replace the sidecar for an entry
    pub async fn write_metadata(
        &self,
        key: &CacheKey,
        variant: ImageVariant,
        metadata: &EntryMetadata,
    ) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(
            self.variant_dir(variant),
            self.meta_path(key, variant),
            Bytes::from(json),
        )
        .await
    }

    /// Write a sidecar rebuilt from stat, unless a real one appeared meanwhile
    ///
    /// A concurrent [`CacheStore::write`] persists the blob before its sidecar,
    /// so a reader can see the blob alone. The rebuilt sidecar is linked into
    /// place without replacing an existing file; an existing sidecar is only
    /// overwritten when it does not parse.
    ///
    /// # Returns
    /// * `Ok(true)` if the rebuilt sidecar was written
    /// * `Ok(false)` if a valid sidecar already exists and was kept
    pub async fn restore_metadata(
        &self,
        key: &CacheKey,
        variant: ImageVariant,
        metadata: &EntryMetadata,
    ) -> Result<bool> {
        let json = Bytes::from(serde_json::to_vec_pretty(metadata)?);
        let created = write_atomic_new(
            self.variant_dir(variant),
            self.meta_path(key, variant),
            json.clone(),
        )
        .await?;
        if created {
            return Ok(true);
        }

        if self.read_metadata(key, variant).await?.is_some() {
            debug!(
                "Sidecar for key={} variant={} appeared during rebuild, keeping it",
                key, variant
            );
            return Ok(false);
        }
        write_atomic(self.variant_dir(variant), self.meta_path(key, variant), json).await?;
        Ok(true)
    }

    /// Keys of every blob stored for `variant`
    pub async fn list_keys(&self, variant: ImageVariant) -> Result<Vec<CacheKey>> {
        let dir = self.variant_dir(variant);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(CacheKey::from_hex) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove temp files left behind by interrupted writes
    pub async fn remove_temp_files(&self, variant: ImageVariant) -> Result<usize> {
        let dir = self.variant_dir(variant);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp && fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Aggregate size and age statistics over the given variants
    pub async fn summarize(&self, variants: &[ImageVariant]) -> Result<CacheSummary> {
        let mut summary = CacheSummary::default();

        for variant in variants {
            let mut per_variant = VariantSummary::default();
            for key in self.list_keys(*variant).await? {
                let size = match fs::metadata(self.blob_path(&key, *variant)).await {
                    Ok(stat) => stat.len(),
                    Err(_) => continue,
                };
                per_variant.blobs += 1;
                per_variant.bytes += size;
                summary.distribution.record(size);

                if let Ok(Some(meta)) = self.read_metadata(&key, *variant).await {
                    per_variant.sidecars += 1;
                    if meta.optimized {
                        per_variant.optimized += 1;
                    }
                    summary.oldest_cached_at = Some(
                        summary
                            .oldest_cached_at
                            .map_or(meta.cached_at, |t| t.min(meta.cached_at)),
                    );
                    summary.newest_cached_at = Some(
                        summary
                            .newest_cached_at
                            .map_or(meta.cached_at, |t| t.max(meta.cached_at)),
                    );
                }
            }
            summary.total_blobs += per_variant.blobs;
            summary.total_bytes += per_variant.bytes;
            summary.variants.insert(*variant, per_variant);
        }

        Ok(summary)
    }
}

/// Write `data` to `dest` through a temp file in `dir`
///
/// The temp file is deleted when the guard drops on any early return; only a
/// successful `persist` renames it into place.
pub(crate) async fn write_atomic(dir: PathBuf, dest: PathBuf, data: Bytes) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| ImageCacheError::InternalError(format!("write task failed: {}", e)))?;

    result.map_err(|e| ImageCacheError::StorageError(format!("atomic write failed: {}", e)))
}

/// Like [`write_atomic`], but never replaces an existing `dest`
///
/// Returns `Ok(false)` when `dest` already exists; the temp file is dropped.
async fn write_atomic_new(dir: PathBuf, dest: PathBuf, data: Bytes) -> Result<bool> {
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&dest) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error),
        }
    })
    .await
    .map_err(|e| ImageCacheError::InternalError(format!("write task failed: {}", e)))?;

    result.map_err(|e| ImageCacheError::StorageError(format!("atomic write failed: {}", e)))
}

/// Per-variant cache totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub blobs: u64,
    pub sidecars: u64,
    pub optimized: u64,
    pub bytes: u64,
}

/// Blob size histogram
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeDistribution {
    pub under_10kb: u64,
    pub from_10kb_to_50kb: u64,
    pub from_50kb_to_100kb: u64,
    pub from_100kb_to_500kb: u64,
    pub over_500kb: u64,
}

impl SizeDistribution {
    fn record(&mut self, size: u64) {
        let kb = size / 1024;
        match kb {
            0..=9 => self.under_10kb += 1,
            10..=49 => self.from_10kb_to_50kb += 1,
            50..=99 => self.from_50kb_to_100kb += 1,
            100..=499 => self.from_100kb_to_500kb += 1,
            _ => self.over_500kb += 1,
        }
    }
}

/// Snapshot of what the cache currently holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub variants: BTreeMap<ImageVariant, VariantSummary>,
    pub total_blobs: u64,
    pub total_bytes: u64,
    pub distribution: SizeDistribution,
    pub oldest_cached_at: Option<u64>,
    pub newest_cached_at: Option<u64>,
}

impl CacheSummary {
    /// Mean blob size in bytes
    pub fn average_size(&self) -> f64 {
        if self.total_blobs == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.total_blobs as f64
        }
    }
}
