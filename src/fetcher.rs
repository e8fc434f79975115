//! Image downloads from the origin with validation and bounded retry

use crate::config::OriginConfig;
use crate::error::{ImageCacheError, Result};
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Accept header sent with every image request
const ACCEPT_IMAGES: &str = "image/webp,image/jpeg,image/png,image/*";

/// A validated image body
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub data: Bytes,
    pub content_type: String,
}

/// Retry policy for failed fetches
///
/// Attempts are spaced by a fixed delay; only errors that
/// [`ImageCacheError::should_retry`] accepts are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        RetryPolicy { max_retries, delay }
    }

    /// Check if we should retry based on the attempt number and error
    pub fn should_retry(&self, attempt: usize, error: &ImageCacheError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }
}

/// Fetcher downloads one image and validates it looks like a real image
#[derive(Debug, Clone)]
pub struct Fetcher {
    http_client: Client,
    retry_policy: RetryPolicy,
    min_image_bytes: usize,
}

impl Fetcher {
    /// Create a fetcher from origin settings
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.fetch_timeout())
            .user_agent(config.user_agent.as_str())
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                ImageCacheError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Fetcher {
            http_client,
            retry_policy: RetryPolicy::new(config.retries, config.retry_delay()),
            min_image_bytes: config.min_image_bytes,
        })
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Single GET attempt, no retry
    async fn try_fetch(&self, url: &str) -> Result<FetchedImage> {
        let response = self
            .http_client
            .get(url)
            .header(ACCEPT, ACCEPT_IMAGES)
            .send()
            .await
            .map_err(|e| ImageCacheError::TransportError(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageCacheError::from_http_status(url, status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(ImageCacheError::InvalidContent(format!(
                "expected an image content type, got '{}'",
                content_type
            )));
        }

        let data = response.bytes().await.map_err(|e| {
            ImageCacheError::TransportError(format!("Failed to read response body: {}", e))
        })?;

        if data.len() < self.min_image_bytes {
            return Err(ImageCacheError::TooSmall { size: data.len() });
        }

        Ok(FetchedImage { data, content_type })
    }

    /// Fetch an image with retry logic
    ///
    /// # Returns
    /// * `Ok(FetchedImage)` if an attempt succeeds
    /// * `Err(ImageCacheError::FetchFailed)` once every attempt has failed,
    ///   carrying the kind of the last failure (`not_found` for 404/410)
    pub async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        let mut attempt = 0;

        loop {
            match self.try_fetch(url).await {
                Ok(image) => {
                    debug!(
                        "Fetched url={} ({} bytes, {}) on attempt {}",
                        url,
                        image.data.len(),
                        image.content_type,
                        attempt + 1
                    );
                    return Ok(image);
                }
                Err(e) if !e.should_retry() => {
                    debug!("Permanent failure for url={}: {}", url, e);
                    return Err(e);
                }
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt, &e) {
                        warn!(
                            "Giving up on url={} after {} attempts: {}",
                            url,
                            attempt + 1,
                            e
                        );
                        return Err(ImageCacheError::FetchFailed {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            kind: e.kind(),
                            last_error: e.to_string(),
                        });
                    }

                    warn!(
                        "Fetch failed for url={} (attempt {}), retrying after {:?}: {}",
                        url,
                        attempt + 1,
                        self.retry_policy.delay,
                        e
                    );
                    sleep(self.retry_policy.delay).await;

                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(retries: usize) -> Fetcher {
        let config = OriginConfig {
            retries,
            retry_delay_ms: 10,
            ..OriginConfig::default()
        };
        Fetcher::new(&config).unwrap()
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let transient = ImageCacheError::TransportError("timeout".to_string());
        let missing = ImageCacheError::NotFoundOnOrigin { url: "u".to_string() };
        let config = ImageCacheError::ConfigError("bad".to_string());

        assert!(policy.should_retry(0, &transient));
        assert!(policy.should_retry(1, &transient));
        assert!(!policy.should_retry(2, &transient));
        assert!(policy.should_retry(0, &missing));
        assert!(!policy.should_retry(0, &config));
    }

    #[tokio::test]
    async fn test_fetch_success_sends_accept_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.jpg"))
            .and(header("accept", ACCEPT_IMAGES))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(vec![0u8; 512], "image/jpeg"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let image = fast_fetcher(2)
            .fetch(&format!("{}/img.jpg", server.uri()))
            .await
            .unwrap();
        assert_eq!(image.data.len(), 512);
        assert_eq!(image.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_not_found_is_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_fetcher(2)
            .fetch(&format!("{}/gone.jpg", server.uri()))
            .await
            .unwrap_err();
        match err {
            ImageCacheError::FetchFailed { attempts, kind, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(kind, FetchErrorKind::NotFound);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_too_small_retried_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 20], "image/jpeg"))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_fetcher(2)
            .fetch(&format!("{}/stub.jpg", server.uri()))
            .await
            .unwrap_err();
        match err {
            ImageCacheError::FetchFailed { attempts, kind, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(kind, FetchErrorKind::TooSmall);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_html_is_invalid_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(vec![b'<'; 400], "text/html"),
            )
            .mount(&server)
            .await;

        let err = fast_fetcher(0)
            .fetch(&format!("{}/page", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::InvalidContent);
    }
}
