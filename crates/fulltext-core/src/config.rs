//! Layered configuration.
//!
//! Defaults, then an optional TOML file, then `FULLTEXT_*` environment
//! variables, each layer overriding the one below. Every file field
//! is optional so a config file only needs to name what it changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ExtractorVersion;
use crate::worker::WorkerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Fully resolved settings used by the service binaries.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of the artifact volume.
    pub volume: PathBuf,
    /// Path of the registry database, `:memory:` for an in-memory one.
    pub registry_db: PathBuf,
    pub bind: String,
    pub extractor_binary: PathBuf,
    pub extractor_version: ExtractorVersion,
    pub workers: usize,
    pub engine_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub lease_visibility: Duration,
    pub max_avg_word_length: f64,
    pub arxiv_base: String,
    pub submission_base: String,
    /// Token-introspection endpoint. When unset the static token table
    /// is used instead.
    pub auth_endpoint: Option<String>,
    /// `token = "subject scope1 scope2"` entries for local use.
    pub static_tokens: HashMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            volume: PathBuf::from("/data/fulltext"),
            registry_db: PathBuf::from("/data/fulltext/registry.db"),
            bind: "0.0.0.0:8000".to_string(),
            extractor_binary: PathBuf::from("pdftotext"),
            extractor_version: ExtractorVersion::default(),
            workers: 2,
            engine_timeout: Duration::from_secs(600),
            max_retries: 2,
            backoff_base: Duration::from_secs(2),
            lease_visibility: Duration::from_secs(900),
            max_avg_word_length: 45.0,
            arxiv_base: "https://arxiv.org".to_string(),
            submission_base: "http://localhost:8001".to_string(),
            auth_endpoint: None,
            static_tokens: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Conventional config file location, if the platform has one and
    /// the file exists: `{config_dir}/fulltext/fulltext.toml`.
    pub fn default_path() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("fulltext").join("fulltext.toml");
        path.exists().then_some(path)
    }

    /// Load from an optional TOML file, then apply `FULLTEXT_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            file.merge_into(&mut config)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            engine_timeout: self.engine_timeout,
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            max_avg_word_length: self.max_avg_word_length,
            ..WorkerConfig::default()
        }
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get("FULLTEXT_VOLUME") {
            self.volume = PathBuf::from(v);
        }
        if let Some(v) = get("FULLTEXT_REGISTRY_DB") {
            self.registry_db = PathBuf::from(v);
        }
        if let Some(v) = get("FULLTEXT_BIND") {
            self.bind = v;
        }
        if let Some(v) = get("FULLTEXT_EXTRACTOR_BINARY") {
            self.extractor_binary = PathBuf::from(v);
        }
        if let Some(v) = get("FULLTEXT_EXTRACTOR_VERSION") {
            self.extractor_version = v.parse().map_err(|_| ConfigError::Invalid {
                key: "FULLTEXT_EXTRACTOR_VERSION",
                value: v,
            })?;
        }
        if let Some(v) = get("FULLTEXT_WORKERS") {
            self.workers = v.parse().map_err(|_| ConfigError::Invalid {
                key: "FULLTEXT_WORKERS",
                value: v,
            })?;
        }
        if let Some(v) = get("FULLTEXT_ARXIV_BASE") {
            self.arxiv_base = v;
        }
        if let Some(v) = get("FULLTEXT_SUBMISSION_BASE") {
            self.submission_base = v;
        }
        if let Some(v) = get("FULLTEXT_AUTH_ENDPOINT") {
            self.auth_endpoint = Some(v);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    volume: Option<PathBuf>,
    registry_db: Option<PathBuf>,
    bind: Option<String>,
    #[serde(default)]
    extractor: ExtractorSection,
    #[serde(default)]
    retry: RetrySection,
    #[serde(default)]
    source: SourceSection,
    #[serde(default)]
    auth: AuthSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractorSection {
    binary: Option<PathBuf>,
    version: Option<String>,
    workers: Option<usize>,
    timeout_secs: Option<u64>,
    max_avg_word_length: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    max_retries: Option<u32>,
    backoff_secs: Option<u64>,
    lease_visibility_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceSection {
    arxiv_base: Option<String>,
    submission_base: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AuthSection {
    endpoint: Option<String>,
    #[serde(default)]
    static_tokens: HashMap<String, String>,
}

impl FileConfig {
    fn merge_into(self, config: &mut ServiceConfig) -> Result<(), ConfigError> {
        if let Some(v) = self.volume {
            config.volume = v;
        }
        if let Some(v) = self.registry_db {
            config.registry_db = v;
        }
        if let Some(v) = self.bind {
            config.bind = v;
        }
        if let Some(v) = self.extractor.binary {
            config.extractor_binary = v;
        }
        if let Some(v) = self.extractor.version {
            config.extractor_version = v.parse().map_err(|_| ConfigError::Invalid {
                key: "extractor.version",
                value: v,
            })?;
        }
        if let Some(v) = self.extractor.workers {
            config.workers = v;
        }
        if let Some(v) = self.extractor.timeout_secs {
            config.engine_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.extractor.max_avg_word_length {
            config.max_avg_word_length = v;
        }
        if let Some(v) = self.retry.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.retry.backoff_secs {
            config.backoff_base = Duration::from_secs(v);
        }
        if let Some(v) = self.retry.lease_visibility_secs {
            config.lease_visibility = Duration::from_secs(v);
        }
        if let Some(v) = self.source.arxiv_base {
            config.arxiv_base = v;
        }
        if let Some(v) = self.source.submission_base {
            config.submission_base = v;
        }
        if let Some(v) = self.auth.endpoint {
            config.auth_endpoint = Some(v);
        }
        config.static_tokens.extend(self.auth.static_tokens);
        Ok(())
    }
}
