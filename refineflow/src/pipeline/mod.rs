//! Stage graph, backend call policy and resumable execution.
//!
//! This module provides:
//! - The stage graph that gates records and renders prompts
//! - Rate limiting and retry around the backend
//! - Append-only stores and the resumable job runner
//! - The pipeline orchestrator tying stages together

mod graph;
mod limiter;
mod orchestrator;
mod retry;
mod runner;
mod store;


pub use graph::{Rendered, SkipReason, StageGraph};
pub use limiter::{RateLimitConfig, RateLimiter};
pub use orchestrator::{Pipeline, PrepareReport, StageReport, StageStatus};
pub use retry::{BackoffStrategy, Completion, JitterStrategy, Retrier, RetryConfig, RetryState};
pub use runner::{
    FailureRecord, OutputInterpreter, ResumableJobRunner, RunSummary, RunnerConfig, WorkItem,
};
pub use store::{load_annotation_records, spawn_writer, JsonlStore, WriteFailure, WriterReport};
