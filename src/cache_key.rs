//! Cache key derivation from origin URLs

use crate::error::{ImageCacheError, Result};
use md5::{Digest, Md5};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex length of an MD5 digest
const KEY_HEX_LEN: usize = 32;

/// File-system safe identifier of a cached image
///
/// The key is derived from the origin URL only; the size variant selects the
/// directory the blob lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Accept a key read back from a cache file name
    ///
    /// Returns `None` for anything that is not a lowercase 32-character hex digest,
    /// which keeps temp files and stray files out of cache walks.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == KEY_HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| CacheKey(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives cache keys from origin URLs
///
/// Keys are the hex MD5 digest of the URL's UTF-8 bytes, so caches written by
/// earlier runs (and other tools sharing the directory) stay addressable.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyCodec;

impl CacheKeyCodec {
    /// Derive the key for `url`
    ///
    /// # Returns
    /// * `Ok(CacheKey)` for an absolute http(s) URL
    /// * `Err(ImageCacheError::InvalidUrl)` for an empty or malformed URL
    pub fn key(url: &str) -> Result<CacheKey> {
        if url.trim().is_empty() {
            return Err(ImageCacheError::InvalidUrl("URL must not be empty".to_string()));
        }

        let parsed = Url::parse(url)
            .map_err(|e| ImageCacheError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ImageCacheError::InvalidUrl(format!(
                "{}: expected an absolute http(s) URL",
                url
            )));
        }

        Ok(CacheKey(hex::encode(Md5::digest(url.as_bytes()))))
    }
}

/// Hex MD5 digest of a blob, as stored in sidecar metadata
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}
