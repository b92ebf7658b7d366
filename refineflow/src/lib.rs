//! # Refineflow
//!
//! A staged suggestion, critique, reflection and refinement pipeline over
//! language model backends.
//!
//! Refineflow provides:
//!
//! - **Stage gating**: each stage declares the record fields it needs and how
//!   its prompt is rendered from a `$field$` template
//! - **Resumable execution**: append-only JSONL stores, a single writer task
//!   and key-based skipping make every stage safe to rerun
//! - **Backend call policy**: rolling-window rate limiting, bounded retries
//!   and a one-shot fallback on policy rejection
//! - **Heuristic classification**: reflection acceptance and position-debiased
//!   consolidation judgments
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use refineflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = RefineflowConfig::from_path("refineflow.json")?;
//! let pipeline = Pipeline::new(config, Arc::new(HttpBackend::new()));
//! pipeline.run(&[Stage::Suggestion, Stage::Critique]).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod backend;
pub mod classify;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod prompt;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(feature = "http")]
    pub use crate::backend::HttpBackend;
    pub use crate::backend::{Backend, BackendConfig, BackendKind, ChatMessage, ChatRequest, Role};
    pub use crate::classify::{
        ConsolidationComparator, Label, ReflectionClassifier, ReflectionStats, ReviewOutcome,
        Verdict, VerdictTally,
    };
    pub use crate::config::RefineflowConfig;
    pub use crate::core::{Field, OutputEntry, Record, Stage};
    pub use crate::errors::{BackendError, ConfigError, RefineflowError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, RunnerEvent};
    pub use crate::pipeline::{
        JsonlStore, Pipeline, RateLimiter, Rendered, ResumableJobRunner, Retrier, RunSummary,
        StageGraph, WorkItem,
    };
    pub use crate::prompt::PromptTemplate;
}
