//! Error types for the refineflow pipeline.
//!
//! Two channels are kept apart: [`ConfigError`] aborts a stage run, while
//! [`BackendError`] is scoped to a single work item and never aborts a batch.

use crate::core::Stage;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for refineflow operations.
#[derive(Debug, Error)]
pub enum RefineflowError {
    /// A fatal configuration error.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A backend call failed.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RefineflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Misconfiguration that must stop the stage run.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A record lacks a field its stage requires.
    #[error("Stage '{stage}' requires field '{field}' but record {key} does not have it")]
    MissingField {
        /// The stage being rendered.
        stage: Stage,
        /// The missing field.
        field: &'static str,
        /// Printable record key.
        key: String,
    },

    /// The template bound to a stage could not be read.
    #[error("Could not read prompt template for stage '{stage}' at {}: {reason}", path.display())]
    MissingTemplate {
        /// The stage the template is bound to.
        stage: Stage,
        /// The template path.
        path: PathBuf,
        /// The underlying IO failure.
        reason: String,
    },

    /// An input store does not exist.
    #[error("Input file {} does not exist", path.display())]
    MissingInput {
        /// The input path.
        path: PathBuf,
    },

    /// A configuration file could not be loaded.
    #[error("Invalid configuration in {}: {message}", path.display())]
    InvalidConfig {
        /// The configuration path.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// A stage name did not match any known stage.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// An operation needs a backend role that is not configured.
    #[error("No {0} backend configured")]
    MissingBackend(&'static str),
}

impl ConfigError {
    /// Creates a missing field error for a record key.
    #[must_use]
    pub fn missing_field(stage: Stage, field: &'static str, key: &str) -> Self {
        Self::MissingField {
            stage,
            field,
            key: display_key(key),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Failure of a single backend call.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network failure, server error or unreadable response.
    #[error("Transient backend error: {message}")]
    Transient {
        /// Error description.
        message: String,
    },

    /// The backend asked the caller to slow down.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Authoritative wait before retrying, when the backend provided one.
        retry_after: Option<Duration>,
        /// Error description.
        message: String,
    },

    /// The content was rejected by a policy filter.
    #[error("Content rejected by policy filter: {message}")]
    PolicyRejected {
        /// Error description.
        message: String,
    },

    /// The request can never succeed as sent (auth, malformed request).
    #[error("Backend rejected request: {message}")]
    Fatal {
        /// Error description.
        message: String,
    },

    /// Retries ran out.
    #[error("Backend call failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of counted attempts made.
        attempts: usize,
        /// The final error.
        last: Box<BackendError>,
    },
}

impl BackendError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a rate limit error with an optional retry hint.
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::RateLimited {
            retry_after,
            message: message.into(),
        }
    }

    /// Creates a policy rejection error.
    #[must_use]
    pub fn policy_rejected(message: impl Into<String>) -> Self {
        Self::PolicyRejected {
            message: message.into(),
        }
    }

    /// Creates a non-retryable error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    /// Returns the retry hint carried by a rate limit error.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Returns a short stable digest of a record key.
#[must_use]
pub fn key_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..6])
}

/// Formats a record key for diagnostics: digest plus a truncated preview.
#[must_use]
pub fn display_key(key: &str) -> String {
    const PREVIEW_CHARS: usize = 48;
    let flat: String = key
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .take(PREVIEW_CHARS)
        .collect();
    let ellipsis = if key.chars().count() > PREVIEW_CHARS { "..." } else { "" };
    format!("[{}] \"{flat}{ellipsis}\"", key_digest(key))
}
