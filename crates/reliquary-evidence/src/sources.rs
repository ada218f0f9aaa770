//! Evidence collaborators: timeline, alert, and artifact services.
//!
//! All three are best-effort from the builder's point of view. A failed
//! fetch drops that section from the bundle; it never fails the build.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT_VALUE: &str = concat!("reliquary/", env!("CARGO_PKG_VERSION"));

/// An artifact as reported by the artifact service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: String,
    /// Location of the artifact bytes on the builder host.
    pub filepath: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{service} service is not configured")]
    NotConfigured { service: &'static str },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("{service} service returned HTTP {status}")]
    Status { service: &'static str, status: u16 },

    #[error("invalid response from {service} service: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotConfigured { .. } | Self::InvalidResponse { .. } => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait EvidenceSources: Send + Sync {
    /// Timeline document for an incident; `None` when the service has none.
    async fn fetch_timeline(&self, incident_id: &str) -> Result<Option<Value>, SourceError>;

    async fn fetch_alerts(&self, incident_id: &str) -> Result<Vec<Value>, SourceError>;

    async fn fetch_artifacts(&self, incident_id: &str) -> Result<Vec<ArtifactRef>, SourceError>;
}

/// Collaborator endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourcesConfig {
    #[serde(default)]
    pub timeline_url: Option<String>,
    #[serde(default)]
    pub alerts_url: Option<String>,
    #[serde(default)]
    pub artifacts_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            timeline_url: None,
            alerts_url: None,
            artifacts_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SourcesConfig {
    pub fn with_timeline_url(mut self, url: impl Into<String>) -> Self {
        self.timeline_url = Some(url.into());
        self
    }

    pub fn with_alerts_url(mut self, url: impl Into<String>) -> Self {
        self.alerts_url = Some(url.into());
        self
    }

    pub fn with_artifacts_url(mut self, url: impl Into<String>) -> Self {
        self.artifacts_url = Some(url.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// JSON-over-HTTP collaborators: `GET {base}/{incident_id}`.
#[derive(Debug, Clone)]
pub struct HttpEvidenceSources {
    client: reqwest::Client,
    config: SourcesConfig,
}

impl HttpEvidenceSources {
    pub fn new(config: SourcesConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT_VALUE)
            .build()
            .map_err(|e| SourceError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, config })
    }

    fn endpoint(
        &self,
        service: &'static str,
        base: Option<&String>,
        incident_id: &str,
    ) -> Result<Url, SourceError> {
        let base = base.ok_or(SourceError::NotConfigured { service })?;
        let mut url = Url::parse(base).map_err(|e| SourceError::InvalidResponse {
            service,
            message: format!("bad base url '{base}': {e}"),
        })?;
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidResponse {
                service,
                message: format!("base url '{base}' cannot carry a path"),
            })?
            .pop_if_empty()
            .push(incident_id);
        Ok(url)
    }

    /// GET and decode JSON. `Ok(None)` on 404.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        service: &'static str,
        url: Url,
    ) -> Result<Option<T>, SourceError> {
        debug!(service, url = %url, "fetching evidence");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                service,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| SourceError::InvalidResponse {
                service,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl EvidenceSources for HttpEvidenceSources {
    async fn fetch_timeline(&self, incident_id: &str) -> Result<Option<Value>, SourceError> {
        let url = self.endpoint("timeline", self.config.timeline_url.as_ref(), incident_id)?;
        // A JSON `null` body means the same as 404.
        let value: Option<Value> = self.get_json("timeline", url).await?;
        Ok(value.filter(|v| !v.is_null()))
    }

    async fn fetch_alerts(&self, incident_id: &str) -> Result<Vec<Value>, SourceError> {
        let url = self.endpoint("alerts", self.config.alerts_url.as_ref(), incident_id)?;
        match self.get_json("alerts", url).await? {
            Some(alerts) => Ok(alerts),
            None => Err(SourceError::Status {
                service: "alerts",
                status: 404,
            }),
        }
    }

    async fn fetch_artifacts(&self, incident_id: &str) -> Result<Vec<ArtifactRef>, SourceError> {
        let url = self.endpoint("artifacts", self.config.artifacts_url.as_ref(), incident_id)?;
        match self.get_json("artifacts", url).await? {
            Some(artifacts) => Ok(artifacts),
            None => Err(SourceError::Status {
                service: "artifacts",
                status: 404,
            }),
        }
    }
}

/// In-memory collaborators, for offline builds and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticEvidenceSources {
    pub timeline: Option<Value>,
    pub alerts: Vec<Value>,
    pub artifacts: Vec<ArtifactRef>,
    pub fail_timeline: bool,
    pub fail_alerts: bool,
    pub fail_artifacts: bool,
}

impl StaticEvidenceSources {
    fn unavailable(service: &'static str) -> SourceError {
        SourceError::Status {
            service,
            status: 503,
        }
    }
}

#[async_trait]
impl EvidenceSources for StaticEvidenceSources {
    async fn fetch_timeline(&self, _incident_id: &str) -> Result<Option<Value>, SourceError> {
        if self.fail_timeline {
            return Err(Self::unavailable("timeline"));
        }
        Ok(self.timeline.clone())
    }

    async fn fetch_alerts(&self, _incident_id: &str) -> Result<Vec<Value>, SourceError> {
        if self.fail_alerts {
            return Err(Self::unavailable("alerts"));
        }
        Ok(self.alerts.clone())
    }

    async fn fetch_artifacts(&self, _incident_id: &str) -> Result<Vec<ArtifactRef>, SourceError> {
        if self.fail_artifacts {
            return Err(Self::unavailable("artifacts"));
        }
        Ok(self.artifacts.clone())
    }
}
