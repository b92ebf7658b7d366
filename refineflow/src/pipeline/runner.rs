//! Resumable, concurrent execution of one stage's work items.
//!
//! Items already present in the output store are skipped. The rest are sent
//! through the [`Retrier`] by a bounded number of concurrent workers, and
//! every success is handed to the single writer task of the output store.
//! Item failures are dropped and reported, never fatal to the batch.

use super::retry::{Completion, Retrier};
use super::store::{spawn_writer, JsonlStore};
use crate::classify::{ConsolidationComparator, Label, ReviewOutcome, Verdict};
use crate::core::{OutputEntry, Record, Stage};
use crate::errors::{display_key, BackendError, RefineflowError};
use crate::events::{EventSink, NoOpEventSink, RunnerEvent};
use crate::observability::SpanTimer;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Concurrent backend calls.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Skip items already in the output store.
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Capacity of the channel feeding the writer task.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_workers() -> usize {
    15
}

fn default_resume() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resume: default_resume(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl RunnerConfig {
    /// Sets the worker count.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Enables or disables resume.
    #[must_use]
    pub const fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// How generated text is turned into an output entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputInterpreter {
    /// Store the text as is.
    #[default]
    Passthrough,
    /// Parse a consolidation label and de-bias it into a verdict.
    Consolidation,
    /// Parse a judge label into a review outcome.
    Review,
}

/// One prompt to send.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// The record, with the prompt in `test_input`.
    pub record: Record,
    /// Verdict of an earlier judgment, carried through a review pass.
    pub verdict: Option<Verdict>,
}

impl WorkItem {
    /// Creates an item for `record` with a rendered prompt.
    #[must_use]
    pub fn new(mut record: Record, prompt: impl Into<String>) -> Self {
        record.test_input = Some(prompt.into());
        Self {
            record,
            verdict: None,
        }
    }

    /// Creates an item from a record that already carries its prompt.
    #[must_use]
    pub const fn from_prepared(record: Record) -> Self {
        Self {
            record,
            verdict: None,
        }
    }

    /// Attaches an earlier verdict.
    #[must_use]
    pub const fn with_verdict(mut self, verdict: Option<Verdict>) -> Self {
        self.verdict = verdict;
        self
    }

    /// The completion key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.record.key()
    }

    /// The prompt text.
    #[must_use]
    pub fn prompt(&self) -> &str {
        self.record.key()
    }
}

/// Record of a dropped item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: Stage,
    /// Printable item key.
    pub key: String,
    /// Error message.
    pub error: String,
    /// Error type name.
    pub error_type: String,
    /// Whether running the stage again may succeed.
    pub recoverable: bool,
    /// Unix timestamp of the failure.
    pub timestamp: f64,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(stage: Stage, key: &str, error: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            stage,
            key: display_key(key),
            error: error.into(),
            error_type: "Error".to_string(),
            recoverable: true,
            timestamp: now,
        }
    }

    /// Creates a failure record from a backend error.
    #[must_use]
    pub fn from_backend(stage: Stage, key: &str, error: &BackendError) -> Self {
        let (error_type, recoverable) = match error {
            BackendError::Transient { .. } => ("Transient", true),
            BackendError::RateLimited { .. } => ("RateLimited", true),
            BackendError::Exhausted { .. } => ("Exhausted", true),
            BackendError::PolicyRejected { .. } => ("PolicyRejected", false),
            BackendError::Fatal { .. } => ("Fatal", false),
        };
        Self {
            error_type: error_type.to_string(),
            recoverable,
            ..Self::new(stage, key, error.to_string())
        }
    }

    /// Sets the error type.
    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }
}

/// Outcome of one stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: Uuid,
    /// Stage that ran.
    pub stage: Stage,
    /// Items submitted.
    pub total: usize,
    /// Items already complete or duplicated in the batch.
    pub skipped: usize,
    /// Items written to the store.
    pub succeeded: usize,
    /// Items dropped after failing.
    pub dropped: usize,
    /// Items whose judgment could not be interpreted or was contradicted.
    pub anomalies: usize,
    /// One record per dropped item.
    pub failures: Vec<FailureRecord>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl RunSummary {
    /// Returns true if any items were dropped.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Share of attempted items that were written.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let attempted = self.succeeded + self.dropped;
        if attempted == 0 {
            return 1.0;
        }
        self.succeeded as f64 / attempted as f64
    }
}

/// Runs work items against a backend with resume and bounded concurrency.
pub struct ResumableJobRunner {
    config: RunnerConfig,
    sink: Arc<dyn EventSink>,
    interpreter: OutputInterpreter,
}

impl std::fmt::Debug for ResumableJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableJobRunner")
            .field("config", &self.config)
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

impl Default for ResumableJobRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl ResumableJobRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NoOpEventSink),
            interpreter: OutputInterpreter::default(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets how generated text is interpreted.
    #[must_use]
    pub const fn with_interpreter(mut self, interpreter: OutputInterpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// The runner settings.
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs `items` for `stage`, appending results to `store`.
    pub async fn run(
        &self,
        stage: Stage,
        items: Vec<WorkItem>,
        retrier: &Retrier,
        store: &JsonlStore,
    ) -> Result<RunSummary, RefineflowError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("runner", %run_id, stage = %stage);
        self.run_inner(run_id, stage, items, retrier, store)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        stage: Stage,
        items: Vec<WorkItem>,
        retrier: &Retrier,
        store: &JsonlStore,
    ) -> Result<RunSummary, RefineflowError> {
        let timer = SpanTimer::start();
        let total = items.len();

        let completed_keys = if self.config.resume {
            store.completed_keys().await?
        } else {
            HashSet::new()
        };
        let mut seen = HashSet::new();
        let pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !completed_keys.contains(item.key()) && seen.insert(item.key().to_string()))
            .collect();
        let skipped = total - pending.len();
        let pending_total = pending.len();

        info!(total, skipped, pending = pending_total, "Starting stage run");
        self.sink
            .emit(&RunnerEvent::Started {
                run_id,
                stage,
                total,
                pending: pending_total,
            })
            .await;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let sink = Arc::clone(&self.sink);
        let writer = spawn_writer(store.clone(), rx, move |entry, written| {
            sink.try_emit(&RunnerEvent::ItemCompleted {
                run_id,
                key: display_key(entry.key()),
                model: entry.model.clone(),
                completed: written,
                total: pending_total,
            });
        });

        let mut results = stream::iter(pending)
            .map(|item| async move {
                let request = retrier.request(item.prompt());
                let result = retrier.call(&request).await;
                (item, result)
            })
            .buffer_unordered(self.config.workers.max(1));

        let mut failures = Vec::new();
        let mut anomalies = 0;
        let mut finished = 0;

        while let Some((item, result)) = results.next().await {
            finished += 1;
            match result {
                Ok(completion) => {
                    let (entry, anomalous) = self.interpret(item, completion);
                    if anomalous {
                        anomalies += 1;
                    }
                    if let Err(e) = tx.send(entry).await {
                        let failure = FailureRecord::new(stage, e.0.key(), "writer task stopped")
                            .with_error_type("Write");
                        self.drop_item(run_id, failure, &mut failures).await;
                        continue;
                    }
                }
                Err(err) => {
                    let failure = FailureRecord::from_backend(stage, item.key(), &err);
                    self.drop_item(run_id, failure, &mut failures).await;
                }
            }
            info!(completed = finished, total = pending_total, "Progress");
        }
        drop(results);
        drop(tx);

        let report = writer
            .await
            .map_err(|e| RefineflowError::Internal(format!("writer task failed: {e}")))?;
        for write_failure in report.failures {
            let failure = FailureRecord::new(stage, &write_failure.key, write_failure.error)
                .with_error_type("Write");
            self.drop_item(run_id, failure, &mut failures).await;
        }

        let summary = RunSummary {
            run_id,
            stage,
            total,
            skipped,
            succeeded: report.written,
            dropped: failures.len(),
            anomalies,
            failures,
            duration_ms: timer.elapsed_ms(),
        };

        info!(
            succeeded = summary.succeeded,
            dropped = summary.dropped,
            skipped = summary.skipped,
            anomalies = summary.anomalies,
            success_rate = summary.success_rate(),
            duration_ms = summary.duration_ms,
            "Stage run completed"
        );
        self.sink
            .emit(&RunnerEvent::Completed {
                run_id,
                stage,
                succeeded: summary.succeeded,
                dropped: summary.dropped,
                skipped: summary.skipped,
                duration_ms: summary.duration_ms,
            })
            .await;

        Ok(summary)
    }

    async fn drop_item(&self, run_id: Uuid, failure: FailureRecord, failures: &mut Vec<FailureRecord>) {
        warn!(
            key = %failure.key,
            error_type = %failure.error_type,
            error = %failure.error,
            "Dropping item"
        );
        self.sink
            .emit(&RunnerEvent::ItemDropped {
                run_id,
                key: failure.key.clone(),
                error: failure.error.clone(),
            })
            .await;
        failures.push(failure);
    }

    /// Builds the output entry; the flag is true for an anomalous judgment.
    fn interpret(&self, item: WorkItem, completion: Completion) -> (OutputEntry, bool) {
        let order = item.record.initial_suggestion_first;
        let mut entry = OutputEntry::new(completion.model, item.record, completion.text);
        match self.interpreter {
            OutputInterpreter::Passthrough => (entry, false),
            OutputInterpreter::Consolidation => {
                let label = Label::parse(entry.output());
                entry.label = Some(label);
                entry.verdict = order.map(|first| ConsolidationComparator::debias(label, first));
                if entry.verdict.is_none() {
                    warn!(key = %display_key(entry.key()), "Consolidation entry has no presentation order");
                }
                let anomalous = entry.verdict.is_none();
                (entry, anomalous)
            }
            OutputInterpreter::Review => {
                let label = Label::parse(entry.output());
                entry.label = Some(label);
                entry.verdict = item.verdict;
                entry.review = order.map(|first| ConsolidationComparator::review(label, first));
                let anomalous = !matches!(
                    entry.review,
                    Some(ReviewOutcome::ValidatedWin | ReviewOutcome::ExplicitTie)
                );
                (entry, anomalous)
            }
        }
    }
}
