//! Orchestrator configuration: YAML file, environment, or builders.

use reliquary_evidence::{Compression, SourcesConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("invalid value for {var}: '{value}'")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Job queue database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Restored incident state database.
    #[serde(default = "default_state_database_path")]
    pub state_database_path: PathBuf,
    /// Where finished bundles are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Staging and unpack scratch space. System temp dir when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Where rehydrated artifacts are stored.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// PEM private key. Bundles are unsigned when unset.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
    /// PEM public key for rehydrate verification.
    #[serde(default)]
    pub verify_key_path: Option<PathBuf>,
    /// Refuse to build unsigned bundles.
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub sources: SourcesConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("reliquary.db")
}

fn default_state_database_path() -> PathBuf {
    PathBuf::from("reliquary-state.db")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("bundles")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    crate::queue::DEFAULT_MAX_RETRIES
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            state_database_path: default_state_database_path(),
            output_dir: default_output_dir(),
            work_dir: None,
            artifact_root: default_artifact_root(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            default_max_retries: default_max_retries(),
            signing_key_path: None,
            verify_key_path: None,
            require_signature: false,
            compression: Compression::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `RELIQUARY_DATABASE` | `database_path` |
    /// | `RELIQUARY_STATE_DATABASE` | `state_database_path` |
    /// | `RELIQUARY_OUTPUT_DIR` | `output_dir` |
    /// | `RELIQUARY_WORK_DIR` | `work_dir` |
    /// | `RELIQUARY_ARTIFACT_ROOT` | `artifact_root` |
    /// | `RELIQUARY_WORKERS` | `workers` |
    /// | `RELIQUARY_POLL_INTERVAL_MS` | `poll_interval_ms` |
    /// | `RELIQUARY_MAX_RETRIES` | `default_max_retries` |
    /// | `RELIQUARY_SIGNING_KEY` | `signing_key_path` |
    /// | `RELIQUARY_VERIFY_KEY` | `verify_key_path` |
    /// | `RELIQUARY_REQUIRE_SIGNATURE` | `require_signature` |
    /// | `RELIQUARY_COMPRESSION` | `compression` |
    /// | `RELIQUARY_TIMELINE_URL` | `sources.timeline_url` |
    /// | `RELIQUARY_ALERTS_URL` | `sources.alerts_url` |
    /// | `RELIQUARY_ARTIFACTS_URL` | `sources.artifacts_url` |
    /// | `RELIQUARY_SOURCE_TIMEOUT` | `sources.timeout_secs` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("RELIQUARY_DATABASE") {
            config.database_path = v.into();
        }
        if let Some(v) = get("RELIQUARY_STATE_DATABASE") {
            config.state_database_path = v.into();
        }
        if let Some(v) = get("RELIQUARY_OUTPUT_DIR") {
            config.output_dir = v.into();
        }
        if let Some(v) = get("RELIQUARY_WORK_DIR") {
            config.work_dir = Some(v.into());
        }
        if let Some(v) = get("RELIQUARY_ARTIFACT_ROOT") {
            config.artifact_root = v.into();
        }
        if let Some(v) = get("RELIQUARY_WORKERS") {
            config.workers = parse_env("RELIQUARY_WORKERS", v)?;
        }
        if let Some(v) = get("RELIQUARY_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_env("RELIQUARY_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = get("RELIQUARY_MAX_RETRIES") {
            config.default_max_retries = parse_env("RELIQUARY_MAX_RETRIES", v)?;
        }
        config.signing_key_path = get("RELIQUARY_SIGNING_KEY").map(PathBuf::from);
        config.verify_key_path = get("RELIQUARY_VERIFY_KEY").map(PathBuf::from);
        if let Some(v) = get("RELIQUARY_REQUIRE_SIGNATURE") {
            config.require_signature = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("RELIQUARY_COMPRESSION") {
            config.compression = parse_env("RELIQUARY_COMPRESSION", v)?;
        }
        config.sources.timeline_url = get("RELIQUARY_TIMELINE_URL");
        config.sources.alerts_url = get("RELIQUARY_ALERTS_URL");
        config.sources.artifacts_url = get("RELIQUARY_ARTIFACTS_URL");
        if let Some(v) = get("RELIQUARY_SOURCE_TIMEOUT") {
            config.sources.timeout_secs = parse_env("RELIQUARY_SOURCE_TIMEOUT", v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                message: "must be at least 1".into(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                message: "must be greater than 0".into(),
            });
        }
        if self.sources.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sources.timeout_secs",
                message: "must be greater than 0".into(),
            });
        }
        if self.require_signature && self.signing_key_path.is_none() {
            return Err(ConfigError::Invalid {
                field: "signing_key_path",
                message: "required when require_signature is set".into(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_state_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_database_path = path.into();
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    pub fn with_work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(path.into());
        self
    }

    pub fn with_artifact_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_root = path.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_signing_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.signing_key_path = Some(path.into());
        self
    }

    pub fn with_verify_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.verify_key_path = Some(path.into());
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_sources(mut self, sources: SourcesConfig) -> Self {
        self.sources = sources;
        self
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.compression, Compression::Zstd);
    }

    #[test]
    fn test_env_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("RELIQUARY_WORKERS", "8"),
            ("RELIQUARY_COMPRESSION", "gzip"),
            ("RELIQUARY_SIGNING_KEY", "/keys/sign.pem"),
            ("RELIQUARY_REQUIRE_SIGNATURE", "true"),
            ("RELIQUARY_ALERTS_URL", "http://alerts.internal/v1/alerts"),
            ("RELIQUARY_TIMELINE_URL", "  "),
        ]))
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.signing_key_path, Some(PathBuf::from("/keys/sign.pem")));
        assert!(config.require_signature);
        assert_eq!(
            config.sources.alerts_url.as_deref(),
            Some("http://alerts.internal/v1/alerts")
        );
        assert_eq!(config.sources.timeline_url, None);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("RELIQUARY_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Env {
                var: "RELIQUARY_WORKERS",
                ..
            }
        ));
    }

    #[test]
    fn test_yaml_with_defaults() {
        let config = OrchestratorConfig::from_yaml_str(
            r#"
output_dir: /var/lib/reliquary/bundles
workers: 2
sources:
  timeline_url: http://timeline.internal/api/timeline
  timeout_secs: 5
"#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/var/lib/reliquary/bundles"));
        assert_eq!(config.workers, 2);
        assert_eq!(config.sources.timeout_secs, 5);
        assert_eq!(config.database_path, PathBuf::from("reliquary.db"));
    }

    #[test]
    fn test_yaml_rejects_unknown_fields() {
        assert!(matches!(
            OrchestratorConfig::from_yaml_str("workerz: 2\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            OrchestratorConfig::default().with_workers(0).validate(),
            Err(ConfigError::Invalid { field: "workers", .. })
        ));
        let mut config = OrchestratorConfig::default();
        config.require_signature = true;
        assert!(config.validate().is_err());
        assert!(config.with_signing_key("/k.pem").validate().is_ok());
    }
}
