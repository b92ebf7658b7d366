//! On-disk fixtures for pipeline tests.

use std::io;
use std::path::{Path, PathBuf};

use crate::backend::BackendConfig;
use crate::config::RefineflowConfig;
use crate::core::{Record, Stage};
use crate::pipeline::{RateLimitConfig, RetryConfig};

/// Default templates written by [`TestWorkspace`].
pub const TEMPLATES: [(Stage, &str); 5] = [
    (
        Stage::Critique,
        "Context: $context$\nSuggestion: $suggestion$\nCritique the suggestion.",
    ),
    (
        Stage::Reflection,
        "Suggestion: $suggestion$\nCritique: $critique$\nDo you accept the critique?",
    ),
    (
        Stage::ReflectionExplain,
        "Critique: $critique$\nExplain whether the critique holds.",
    ),
    (
        Stage::Refine,
        "Suggestion: $suggestion$\nCritique: $critique$\nReflection: $reflection$\nRefine the suggestion.",
    ),
    (
        Stage::Consolidate,
        "Context: $context$\nSuggestion 1: $suggestion1$\nSuggestion 2: $suggestion2$\nWhich is better?",
    ),
];

/// A work directory laid out for a pipeline run.
#[derive(Debug, Clone)]
pub struct TestWorkspace {
    root: PathBuf,
}

impl TestWorkspace {
    /// Lays out templates under `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let workspace = Self { root: root.into() };
        std::fs::create_dir_all(workspace.templates_dir())?;
        for (stage, text) in TEMPLATES {
            std::fs::write(workspace.templates_dir().join(format!("{stage}.prompt")), text)?;
        }
        Ok(workspace)
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The template directory.
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    /// The work directory.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    /// The source store path.
    #[must_use]
    pub fn source_path(&self) -> PathBuf {
        self.root.join("source.jsonl")
    }

    /// Writes source records, one JSON line each.
    pub fn write_source(&self, records: &[Record]) -> io::Result<()> {
        let mut text = String::new();
        for record in records {
            text.push_str(&serde_json::to_string(record)?);
            text.push('\n');
        }
        std::fs::write(self.source_path(), text)
    }

    /// A configuration with fast retries and no practical rate limit.
    #[must_use]
    pub fn config(&self, backend: BackendConfig) -> RefineflowConfig {
        let mut config = RefineflowConfig::new(self.source_path(), backend)
            .with_work_dir(self.work_dir())
            .with_templates_dir(self.templates_dir());
        config.retry = RetryConfig::new().with_max_attempts(2).with_base_delay_ms(1);
        config.rate_limit = RateLimitConfig {
            max_calls: 10_000,
            interval_seconds: 1,
        };
        config.runner.workers = 4;
        config.seed = Some(7);
        config
    }
}
