//! Events emitted by the job runner.

use crate::core::Stage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A runner lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunnerEvent {
    /// A stage run began.
    #[serde(rename = "runner.started")]
    Started {
        /// Run identifier.
        run_id: Uuid,
        /// Stage being run.
        stage: Stage,
        /// Items submitted.
        total: usize,
        /// Items left after the resume check.
        pending: usize,
    },
    /// An item's entry was durably written to the output store.
    #[serde(rename = "item.completed")]
    ItemCompleted {
        /// Run identifier.
        run_id: Uuid,
        /// Printable item key.
        key: String,
        /// Backend that produced the text.
        model: String,
        /// Entries written so far in this run.
        completed: usize,
        /// Items pending at start.
        total: usize,
    },
    /// An item was dropped.
    #[serde(rename = "item.dropped")]
    ItemDropped {
        /// Run identifier.
        run_id: Uuid,
        /// Printable item key.
        key: String,
        /// Why it was dropped.
        error: String,
    },
    /// A stage run finished.
    #[serde(rename = "runner.completed")]
    Completed {
        /// Run identifier.
        run_id: Uuid,
        /// Stage that ran.
        stage: Stage,
        /// Items written.
        succeeded: usize,
        /// Items dropped.
        dropped: usize,
        /// Items skipped as already complete.
        skipped: usize,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
}

impl RunnerEvent {
    /// The dotted event type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "runner.started",
            Self::ItemCompleted { .. } => "item.completed",
            Self::ItemDropped { .. } => "item.dropped",
            Self::Completed { .. } => "runner.completed",
        }
    }

    /// The run this event belongs to.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        match self {
            Self::Started { run_id, .. }
            | Self::ItemCompleted { run_id, .. }
            | Self::ItemDropped { run_id, .. }
            | Self::Completed { run_id, .. } => *run_id,
        }
    }
}
