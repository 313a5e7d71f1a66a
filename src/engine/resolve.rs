//! Input-reference resolution
//!
//! A photo reference arrives as an opaque string and is classified into one
//! of three kinds:
//! - a URL containing the configured object-storage domain, fetched directly
//! - a 24-character lowercase-hex token, resolved through the local
//!   image-lookup service
//! - anything else, treated as a local filesystem path
//!
//! Acquisition failures become `JobError::Upstream` and are never retried.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::JobError;

/// A classified photo reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    /// Object-storage URL, fetched over the network.
    Remote(String),
    /// Opaque identifier resolved via the image-lookup service.
    Lookup(String),
    /// Local filesystem path.
    Local(PathBuf),
}

impl InputRef {
    /// Classify a caller-supplied photo reference.
    pub fn classify(raw: &str, remote_domain: &str) -> Self {
        if raw.starts_with("http") && raw.contains(remote_domain) {
            return InputRef::Remote(raw.to_string());
        }
        if raw.len() == 24 && raw.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return InputRef::Lookup(raw.to_string());
        }
        InputRef::Local(PathBuf::from(raw))
    }
}

impl std::fmt::Display for InputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputRef::Remote(url) => write!(f, "remote:{url}"),
            InputRef::Lookup(id) => write!(f, "lookup:{id}"),
            InputRef::Local(path) => write!(f, "local:{}", path.display()),
        }
    }
}

/// Acquires raw image bytes for a classified reference.
pub struct Resolver {
    http: reqwest::Client,
    lookup_base_url: String,
}

impl Resolver {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            lookup_base_url: config.lookup_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the raw bytes behind a reference. The fetch timeout is
    /// independent of any caller-side result-await timeout.
    pub async fn fetch(&self, input: &InputRef) -> Result<Vec<u8>, JobError> {
        match input {
            InputRef::Remote(url) => self
                .get_bytes(url)
                .await
                .map_err(|e| JobError::Upstream(format!("remote fetch failed: {e}"))),
            InputRef::Lookup(id) => {
                let url = format!("{}/{}", self.lookup_base_url, id);
                self.get_bytes(&url)
                    .await
                    .map_err(|e| JobError::Upstream(format!("image lookup failed: {e}")))
            }
            InputRef::Local(path) => tokio::fs::read(path).await.map_err(|e| {
                JobError::Upstream(format!("file read failed ({}): {e}", path.display()))
            }),
        }
    }

    async fn get_bytes(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
