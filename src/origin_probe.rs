//! Existence checks against the image origin using HEAD requests

use crate::config::OriginConfig;
use crate::error::{ImageCacheError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a HEAD probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Origin answered with a success status
    Present,
    /// Origin answered, but not with a success status
    Absent,
    /// No answer: timeout or connection failure
    Unreachable,
}

impl ProbeOutcome {
    pub fn exists(&self) -> bool {
        matches!(self, ProbeOutcome::Present)
    }
}

/// OriginProbe asks the origin whether an image exists without downloading it
#[derive(Debug, Clone)]
pub struct OriginProbe {
    client: Client,
}

impl OriginProbe {
    /// Create a probe using the origin's timeout and user agent
    pub fn new(config: &OriginConfig) -> Result<Self> {
        Self::with_timeout(config.probe_timeout(), &config.user_agent)
    }

    pub fn with_timeout(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| {
                ImageCacheError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(OriginProbe { client })
    }

    /// Send a HEAD request and classify the answer
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        debug!("Probing origin url={}", url);

        let response = match self.client.head(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("HEAD request failed for url={}: {}", url, e);
                return ProbeOutcome::Unreachable;
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!("Origin has url={} (status={})", url, status);
            ProbeOutcome::Present
        } else {
            debug!("Origin lacks url={} (status={})", url, status);
            ProbeOutcome::Absent
        }
    }

    /// True only when the origin answered the HEAD request with a success status
    pub async fn exists(&self, url: &str) -> bool {
        self.probe(url).await.exists()
    }
}
