//! Pipeline configuration loaded from a JSON file.

use crate::backend::BackendConfig;
use crate::errors::ConfigError;
use crate::pipeline::{RateLimitConfig, RetryConfig, RunnerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineflowConfig {
    /// Directory holding stage input and output stores.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directory holding `<stage>.prompt` templates.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    /// Source records for the suggestion stage.
    pub source: PathBuf,
    /// Human-annotation export used in place of refine output for the
    /// consolidate stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<PathBuf>,
    /// Primary backend.
    pub backend: BackendConfig,
    /// Backend used once when the primary rejects content.
    #[serde(default)]
    pub fallback: Option<BackendConfig>,
    /// Stronger backend for the review pass.
    #[serde(default)]
    pub judge: Option<BackendConfig>,
    /// Call rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Retry behavior.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Runner settings.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Seed for the consolidation order; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

impl RefineflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, backend: BackendConfig) -> Self {
        Self {
            work_dir: default_work_dir(),
            templates_dir: default_templates_dir(),
            source: source.into(),
            annotations: None,
            backend,
            fallback: None,
            judge: None,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            runner: RunnerConfig::default(),
            seed: None,
        }
    }

    /// Sets the work directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Reads consolidation input from a human-annotation export.
    #[must_use]
    pub fn with_annotations(mut self, path: impl Into<PathBuf>) -> Self {
        self.annotations = Some(path.into());
        self
    }

    /// Sets the template directory.
    #[must_use]
    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = dir.into();
        self
    }

    /// Loads a configuration file.
    ///
    /// Relative paths are resolved against the file's directory and API keys
    /// are read from their environment variables.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::invalid(path, e.to_string()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_json(&text, base).map_err(|e| match e {
            ConfigError::InvalidConfig { message, .. } => ConfigError::invalid(path, message),
            other => other,
        })
    }

    /// Parses configuration JSON, resolving relative paths against `base`.
    pub fn from_json(text: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::invalid(base, e.to_string()))?;
        config.work_dir = resolve(base, &config.work_dir);
        config.templates_dir = resolve(base, &config.templates_dir);
        config.source = resolve(base, &config.source);
        config.annotations = config.annotations.map(|path| resolve(base, &path));
        config.resolve_api_keys();
        config.validate(base)?;
        Ok(config)
    }

    /// Reads API keys for every configured backend.
    pub fn resolve_api_keys(&mut self) {
        self.backend.resolve_api_key();
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.resolve_api_key();
        }
        if let Some(judge) = self.judge.as_mut() {
            judge.resolve_api_key();
        }
    }

    fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        if self.runner.workers == 0 {
            return Err(ConfigError::invalid(origin, "runner.workers must be at least 1"));
        }
        if self.rate_limit.max_calls == 0 {
            return Err(ConfigError::invalid(origin, "rate_limit.max_calls must be at least 1"));
        }
        if std::time::Instant::now().checked_add(self.rate_limit.interval()).is_none() {
            return Err(ConfigError::invalid(origin, "rate_limit.interval_seconds is out of range"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(origin, "retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
