//! Descriptor list source
//!
//! The source location is classified once at startup. A path that exists
//! on disk is read as a file on every refresh; anything else must be an
//! HTTP(S) URL that answers `GET` with 200.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{GateError, Result};

/// Where descriptor lines are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    File(PathBuf),
    Url(Url),
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Url(url) => write!(f, "url {}", url),
        }
    }
}

/// A resolved descriptor source
#[derive(Debug, Clone)]
pub struct DescriptorSource {
    kind: SourceKind,
    client: reqwest::Client,
}

impl DescriptorSource {
    /// Classify `location` and check that it is reachable.
    ///
    /// Failures here are configuration errors.
    #[instrument(skip(fetch_timeout))]
    pub async fn resolve(location: &str, fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent(concat!("rotagate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GateError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let location = location.trim();
        if let Ok(meta) = tokio::fs::metadata(location).await {
            if meta.is_file() {
                return Ok(Self {
                    kind: SourceKind::File(PathBuf::from(location)),
                    client,
                });
            }
        }

        let url = Url::parse(location).map_err(|_| {
            GateError::ConfigValidation(format!(
                "Source '{}' is neither an existing file nor a URL",
                location
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GateError::ConfigValidation(format!(
                "Source URL must be http or https: {}",
                url
            )));
        }

        let status = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| GateError::ConfigValidation(format!("Source {} unreachable: {}", url, e)))?
            .status();
        if status != StatusCode::OK {
            return Err(GateError::ConfigValidation(format!(
                "Source {} returned {}",
                url, status
            )));
        }

        Ok(Self {
            kind: SourceKind::Url(url),
            client,
        })
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Read the current raw lines from the source
    pub async fn fetch(&self) -> Result<Vec<String>> {
        let text = match &self.kind {
            SourceKind::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                GateError::SourceUnreachable(format!("Read {} failed: {}", path.display(), e))
            })?,
            SourceKind::Url(url) => self
                .client
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?,
        };

        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        debug!("Fetched {} lines from {}", lines.len(), self.kind);
        Ok(lines)
    }
}
