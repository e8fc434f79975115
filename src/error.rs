//! Error types for the product image cache

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for image cache operations
pub type Result<T> = std::result::Result<T, ImageCacheError>;

/// Typed failure reasons for a single fetch
///
/// These labels are what run statistics aggregate into their failure histogram,
/// so the serialized names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Origin answered with 404/410 or the probe reported the image absent
    NotFound,
    /// Response was not an image
    InvalidContent,
    /// Timeout, connection failure or an unexpected status
    TransportError,
    /// Payload below the placeholder threshold
    TooSmall,
    /// Fetch succeeded but the cache write failed
    StorageError,
}

impl FetchErrorKind {
    /// Stable label used in statistics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::NotFound => "not_found",
            FetchErrorKind::InvalidContent => "invalid_content",
            FetchErrorKind::TransportError => "transport_error",
            FetchErrorKind::TooSmall => "too_small",
            FetchErrorKind::StorageError => "storage_error",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types that can occur in the image cache
#[derive(Error, Debug, Clone)]
pub enum ImageCacheError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Image not found on origin: {url}")]
    NotFoundOnOrigin { url: String },

    #[error("Invalid content from origin: {0}")]
    InvalidContent(String),

    #[error("Image too small ({size} bytes), likely a placeholder")]
    TooSmall { size: usize },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Corrupted cache entry {key} ({variant}): expected checksum {expected}, got {actual}")]
    CorruptedCache {
        key: String,
        variant: String,
        expected: String,
        actual: String,
    },

    #[error("Fetch failed for {url} after {attempts} attempts: {last_error}")]
    FetchFailed {
        url: String,
        attempts: usize,
        kind: FetchErrorKind,
        last_error: String,
    },

    #[error("Image processing error: {0}")]
    ProcessingError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ImageCacheError {
    fn from(err: std::io::Error) -> Self {
        ImageCacheError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for ImageCacheError {
    fn from(err: serde_json::Error) -> Self {
        ImageCacheError::StorageError(format!("metadata serialization failed: {}", err))
    }
}

impl ImageCacheError {
    /// Determine if this error should trigger another fetch attempt
    ///
    /// Every origin response failure is retried, a 404 included: the origin is
    /// known to serve transient stubs and missing files while images publish.
    pub fn should_retry(&self) -> bool {
        match self {
            ImageCacheError::TransportError(_) => true,
            ImageCacheError::InvalidContent(_) => true,
            ImageCacheError::TooSmall { .. } => true,
            ImageCacheError::NotFoundOnOrigin { .. } => true,

            ImageCacheError::FetchFailed { .. } => false,
            ImageCacheError::ConfigError(_) => false,
            ImageCacheError::InvalidUrl(_) => false,
            ImageCacheError::InvalidRequest(_) => false,
            ImageCacheError::StorageError(_) => false,
            ImageCacheError::CorruptedCache { .. } => false,
            ImageCacheError::ProcessingError(_) => false,
            ImageCacheError::InternalError(_) => false,
        }
    }

    /// Map to the fetch failure taxonomy used by run statistics
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            ImageCacheError::NotFoundOnOrigin { .. } => FetchErrorKind::NotFound,
            ImageCacheError::InvalidContent(_) => FetchErrorKind::InvalidContent,
            ImageCacheError::TooSmall { .. } => FetchErrorKind::TooSmall,
            ImageCacheError::StorageError(_) => FetchErrorKind::StorageError,
            ImageCacheError::CorruptedCache { .. } => FetchErrorKind::StorageError,
            ImageCacheError::FetchFailed { kind, .. } => *kind,
            _ => FetchErrorKind::TransportError,
        }
    }

    /// Convert error to the HTTP status a client would see if it were surfaced
    ///
    /// The serving path only surfaces 400, and 404 for an absent HEAD probe;
    /// every fetch failure degrades to a redirect to the origin URL.
    pub fn to_http_status(&self) -> u16 {
        match self {
            ImageCacheError::InvalidUrl(_) => 400,
            ImageCacheError::InvalidRequest(_) => 400,
            ImageCacheError::NotFoundOnOrigin { .. } => 404,
            ImageCacheError::FetchFailed {
                kind: FetchErrorKind::NotFound,
                ..
            } => 404,
            ImageCacheError::TransportError(_) => 502,
            ImageCacheError::InvalidContent(_) => 502,
            ImageCacheError::TooSmall { .. } => 502,
            ImageCacheError::FetchFailed { .. } => 502,
            _ => 500,
        }
    }

    /// Whether the serving path should redirect the client to the origin URL
    /// instead of answering with an error status
    ///
    /// Only malformed requests are answered directly; every fetch failure,
    /// a 404 on GET included, redirects.
    pub fn fallback_to_origin(&self) -> bool {
        !matches!(
            self,
            ImageCacheError::InvalidUrl(_) | ImageCacheError::InvalidRequest(_)
        )
    }

    /// Create an error from a non-success origin status code
    pub fn from_http_status(url: &str, status: u16) -> Self {
        match status {
            404 | 410 => ImageCacheError::NotFoundOnOrigin {
                url: url.to_string(),
            },
            _ => ImageCacheError::TransportError(format!("origin returned HTTP {}", status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_retried() {
        let err = ImageCacheError::from_http_status("https://origin/x.jpg", 404);
        assert!(err.should_retry());
        assert_eq!(err.kind(), FetchErrorKind::NotFound);
        assert_eq!(err.to_http_status(), 404);

        let exhausted = ImageCacheError::FetchFailed {
            url: "https://origin/x.jpg".to_string(),
            attempts: 3,
            kind: FetchErrorKind::NotFound,
            last_error: err.to_string(),
        };
        assert_eq!(exhausted.kind(), FetchErrorKind::NotFound);
        assert!(!exhausted.should_retry());
        assert!(exhausted.fallback_to_origin());
        assert!(!ImageCacheError::InvalidUrl("x".to_string()).fallback_to_origin());
    }

    #[test]
    fn test_server_error_is_transport() {
        let err = ImageCacheError::from_http_status("https://origin/x.jpg", 503);
        assert!(err.should_retry());
        assert_eq!(err.kind(), FetchErrorKind::TransportError);
        assert_eq!(err.to_http_status(), 502);
        assert!(err.fallback_to_origin());
    }

    #[test]
    fn test_fetch_failed_keeps_kind() {
        let err = ImageCacheError::FetchFailed {
            url: "u".to_string(),
            attempts: 3,
            kind: FetchErrorKind::TooSmall,
            last_error: "tiny".to_string(),
        };
        assert_eq!(err.kind(), FetchErrorKind::TooSmall);
        assert!(!err.should_retry());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(FetchErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(FetchErrorKind::InvalidContent.as_str(), "invalid_content");
        assert_eq!(FetchErrorKind::TransportError.as_str(), "transport_error");
        assert_eq!(FetchErrorKind::TooSmall.as_str(), "too_small");
        assert_eq!(
            serde_json::to_string(&FetchErrorKind::StorageError).unwrap(),
            "\"storage_error\""
        );
    }
}
