//! Testing utilities for refineflow pipelines.
//!
//! This module provides:
//! - A scripted backend with per-prompt and per-configuration answers
//! - An on-disk workspace with templates and a source store

mod fixtures;
mod mocks;

pub use fixtures::{TestWorkspace, TEMPLATES};
pub use mocks::{RecordedCall, Script, ScriptedBackend};
