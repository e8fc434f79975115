//! Cache integrity audit and repair
//!
//! Walks every variant directory, rebuilds missing sidecars, recomputes
//! checksums and re-fetches corrupted entries whose origin URL is known.

use crate::cache_key::CacheKey;
use crate::cache_store::CacheStore;
use crate::config::AuditConfig;
use crate::error::{ImageCacheError, Result};
use crate::models::ImageVariant;
use crate::pipeline::ImagePipeline;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Totals of one audit pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub scanned: u64,
    pub missing_metadata_fixed: u64,
    pub corrupted_found: u64,
    pub repaired: u64,
    pub repair_failed: u64,
    /// Blobs whose content equals another blob's in the same variant
    pub duplicates: u64,
    pub temp_files_removed: u64,
    pub total_bytes: u64,
}

/// What happened to one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Verified,
    MetadataFixed,
    Repaired,
    /// Corrupted and left in place
    Unrepaired,
    RepairFailed,
}

/// Verifies cache entries and repairs what it can
pub struct IntegrityAuditor {
    pipeline: Arc<ImagePipeline>,
    config: AuditConfig,
}

impl IntegrityAuditor {
    pub fn new(pipeline: Arc<ImagePipeline>, config: AuditConfig) -> Self {
        IntegrityAuditor { pipeline, config }
    }

    fn store(&self) -> &CacheStore {
        &self.pipeline.store
    }

    /// Audit every configured variant
    pub async fn audit(&self) -> Result<AuditSummary> {
        let start = Instant::now();
        let mut summary = AuditSummary::default();

        for variant in &self.config.variants {
            self.audit_variant(*variant, &mut summary).await?;
        }

        info!(
            "Audit completed in {:?}: scanned={}, missing_metadata_fixed={}, corrupted={}, repaired={}, repair_failed={}, duplicates={}",
            start.elapsed(),
            summary.scanned,
            summary.missing_metadata_fixed,
            summary.corrupted_found,
            summary.repaired,
            summary.repair_failed,
            summary.duplicates
        );
        Ok(summary)
    }

    async fn audit_variant(&self, variant: ImageVariant, summary: &mut AuditSummary) -> Result<()> {
        let removed = self.store().remove_temp_files(variant).await?;
        if removed > 0 {
            info!("Removed {} leftover temp files from {}", removed, variant);
        }
        summary.temp_files_removed += removed as u64;

        let keys = self.store().list_keys(variant).await?;
        info!("Auditing {} entries in {}", keys.len(), variant);

        let mut seen_checksums = HashSet::new();

        for key in keys {
            summary.scanned += 1;

            let status = match self.audit_entry(&key, variant).await {
                Ok(status) => status,
                Err(e) => {
                    error!("Failed to audit key={} variant={}: {}", key, variant, e);
                    continue;
                }
            };

            match status {
                EntryStatus::Verified => {}
                EntryStatus::MetadataFixed => summary.missing_metadata_fixed += 1,
                EntryStatus::Repaired => {
                    summary.corrupted_found += 1;
                    summary.repaired += 1;
                }
                EntryStatus::Unrepaired => summary.corrupted_found += 1,
                EntryStatus::RepairFailed => {
                    summary.corrupted_found += 1;
                    summary.repair_failed += 1;
                }
            }

            // Account for what is on disk now, after any repair
            if let Ok(Some(entry)) = self.store().read(&key, variant).await {
                summary.total_bytes += entry.data.len() as u64;
                if !seen_checksums.insert(CacheStore::checksum(&entry.data)) {
                    summary.duplicates += 1;
                }
            }
        }

        Ok(())
    }

    async fn audit_entry(&self, key: &CacheKey, variant: ImageVariant) -> Result<EntryStatus> {
        let entry = match self.store().read(key, variant).await? {
            Some(entry) => entry,
            None => return Ok(EntryStatus::Verified),
        };

        if entry.metadata_recovered {
            if self
                .store()
                .restore_metadata(key, variant, &entry.metadata)
                .await?
            {
                debug!("Rebuilt sidecar for key={} variant={}", key, variant);
                return Ok(EntryStatus::MetadataFixed);
            }
            // A writer finished the entry while we looked at it
            return Ok(EntryStatus::Verified);
        }

        if !self.config.checksum_verification {
            return Ok(EntryStatus::Verified);
        }

        let actual = CacheStore::checksum(&entry.data);
        if actual == entry.metadata.checksum {
            return Ok(EntryStatus::Verified);
        }

        let corruption = ImageCacheError::CorruptedCache {
            key: key.to_string(),
            variant: variant.to_string(),
            expected: entry.metadata.checksum.clone(),
            actual,
        };
        warn!("{}", corruption);

        let url = match (&entry.metadata.original_url, self.config.repair) {
            (Some(url), true) => url,
            (None, true) => {
                warn!("Cannot repair key={}: origin URL unknown", key);
                return Ok(EntryStatus::Unrepaired);
            }
            (_, false) => return Ok(EntryStatus::Unrepaired),
        };

        match self.pipeline.refresh(url, variant).await {
            Ok(_) => {
                info!("Repaired key={} variant={} from {}", key, variant, url);
                Ok(EntryStatus::Repaired)
            }
            Err(e) => {
                error!("Repair failed for key={} variant={}: {}", key, variant, e);
                Ok(EntryStatus::RepairFailed)
            }
        }
    }
}
