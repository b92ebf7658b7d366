//! Stage orchestration over a work directory.
//!
//! Each stage reads its predecessor's output store, renders prompts into its
//! own input store and runs the job runner into its output store. Prompts are
//! rendered once per context: a rerun reuses the stored input, so choices
//! made at render time (such as the consolidation order) survive resumes.

use super::graph::{Rendered, SkipReason, StageGraph};
use super::limiter::RateLimiter;
use super::retry::Retrier;
use super::runner::{OutputInterpreter, ResumableJobRunner, RunSummary, WorkItem};
use super::store::{load_annotation_records, JsonlStore};
use crate::backend::{Backend, BackendConfig};
use crate::classify::{
    ConsolidationComparator, CritiqueAgreement, ReflectionStats, VerdictTally,
};
use crate::config::RefineflowConfig;
use crate::core::{OutputEntry, Record, Stage};
use crate::errors::{ConfigError, RefineflowError};
use crate::events::{EventSink, NoOpEventSink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// How the records of a stage were prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareReport {
    /// Records read from the predecessor.
    pub source_records: usize,
    /// Newly rendered prompts appended to the input store.
    pub rendered: usize,
    /// Records already in the input store.
    pub reused: usize,
    /// Records excluded from the stage, by reason.
    pub skipped: BTreeMap<String, usize>,
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Input preparation.
    pub prepare: PrepareReport,
    /// The runner's summary.
    pub summary: RunSummary,
}

/// Progress of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    /// The stage.
    pub stage: Stage,
    /// Prompts in the input store.
    pub prepared: usize,
    /// Prepared prompts with an output entry.
    pub completed: usize,
    /// Prepared prompts without an output entry.
    pub pending: usize,
}

/// Runs pipeline stages against one configuration.
pub struct Pipeline {
    config: RefineflowConfig,
    backend: Arc<dyn Backend>,
    graph: StageGraph,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("work_dir", &self.config.work_dir)
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(config: RefineflowConfig, backend: Arc<dyn Backend>) -> Self {
        let comparator = config
            .seed
            .map_or_else(ConsolidationComparator::new, ConsolidationComparator::with_seed);
        let graph = StageGraph::new(&config.templates_dir).with_comparator(Arc::new(comparator));
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        Self {
            config,
            backend,
            graph,
            limiter,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink handed to every runner.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &RefineflowConfig {
        &self.config
    }

    /// The stage graph.
    #[must_use]
    pub const fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Prepared prompts for `stage`.
    #[must_use]
    pub fn input_store(&self, stage: Stage) -> JsonlStore {
        JsonlStore::new(self.config.work_dir.join(format!("{stage}.input.jsonl")))
    }

    /// Output entries of `stage`.
    #[must_use]
    pub fn output_store(&self, stage: Stage) -> JsonlStore {
        JsonlStore::new(self.config.work_dir.join(format!("{stage}.output.jsonl")))
    }

    /// Output of the judge review pass.
    #[must_use]
    pub fn review_store(&self) -> JsonlStore {
        JsonlStore::new(self.config.work_dir.join("consolidate.review.jsonl"))
    }

    fn retrier(&self, primary: BackendConfig, fallback: Option<BackendConfig>) -> Retrier {
        Retrier::new(Arc::clone(&self.backend), primary, Arc::clone(&self.limiter))
            .with_fallback(fallback)
            .with_retry(self.config.retry.clone())
    }

    fn runner(&self, interpreter: OutputInterpreter) -> ResumableJobRunner {
        ResumableJobRunner::new(self.config.runner)
            .with_sink(Arc::clone(&self.sink))
            .with_interpreter(interpreter)
    }

    /// Input records for `stage`, before rendering.
    ///
    /// With an annotation export configured, consolidation reads its records
    /// from the export instead of the refine output.
    pub async fn source_records(&self, stage: Stage) -> Result<Vec<Record>, RefineflowError> {
        if let (Stage::Consolidate, Some(path)) = (stage, &self.config.annotations) {
            return load_annotation_records(path).await;
        }
        match stage.predecessor() {
            None => JsonlStore::new(&self.config.source).read_required().await,
            Some(previous) => Ok(self
                .output_store(previous)
                .read_required()
                .await?
                .into_iter()
                .map(|entry| StageGraph::prepare(entry, stage))
                .collect()),
        }
    }

    /// Renders prompts for records not yet in the input store and returns
    /// every prepared item.
    pub async fn prepare(&self, stage: Stage) -> Result<(Vec<WorkItem>, PrepareReport), RefineflowError> {
        let records = self.source_records(stage).await?;
        let input = self.input_store(stage);
        let existing: Vec<Record> = input.read().await?;
        let mut known: HashSet<String> = existing.iter().map(|r| r.context.clone()).collect();

        let mut report = PrepareReport {
            source_records: records.len(),
            reused: existing.len(),
            ..PrepareReport::default()
        };
        let mut fresh = Vec::new();
        for mut record in records {
            if known.contains(&record.context) {
                continue;
            }
            match self.graph.render(&mut record, stage)? {
                Rendered::Prompt(prompt) => {
                    known.insert(record.context.clone());
                    record.test_input = Some(prompt);
                    fresh.push(record);
                }
                Rendered::Skip(reason) => {
                    *report.skipped.entry(skip_label(reason).to_string()).or_insert(0) += 1;
                }
            }
        }
        input.append(&fresh).await?;
        report.rendered = fresh.len();

        let items = existing
            .into_iter()
            .chain(fresh)
            .map(WorkItem::from_prepared)
            .collect();
        Ok((items, report))
    }

    /// Prepares and runs one stage.
    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport, RefineflowError> {
        let (items, prepare) = self.prepare(stage).await?;
        info!(
            stage = %stage,
            rendered = prepare.rendered,
            reused = prepare.reused,
            "Prepared stage inputs"
        );
        let interpreter = if stage == Stage::Consolidate {
            OutputInterpreter::Consolidation
        } else {
            OutputInterpreter::Passthrough
        };
        let retrier = self.retrier(self.config.backend.clone(), self.config.fallback.clone());
        let summary = self
            .runner(interpreter)
            .run(stage, items, &retrier, &self.output_store(stage))
            .await?;
        Ok(StageReport { prepare, summary })
    }

    /// Runs the requested stages one after another in dependency order.
    pub async fn run(&self, stages: &[Stage]) -> Result<Vec<StageReport>, RefineflowError> {
        let mut reports = Vec::new();
        for stage in StageGraph::execution_order(stages) {
            reports.push(self.run_stage(stage).await?);
        }
        Ok(reports)
    }

    /// Counts prepared, completed and pending prompts of a stage.
    pub async fn status(&self, stage: Stage) -> Result<StageStatus, RefineflowError> {
        let prepared: Vec<Record> = self.input_store(stage).read().await?;
        let completed_keys = self.output_store(stage).completed_keys().await?;
        let prepared_keys: HashSet<&str> = prepared.iter().map(Record::key).collect();
        let completed = prepared_keys
            .iter()
            .filter(|key| completed_keys.contains(**key))
            .count();
        Ok(StageStatus {
            stage,
            prepared: prepared_keys.len(),
            completed,
            pending: prepared_keys.len() - completed,
        })
    }

    /// Sends every refinement win to the judge backend once.
    pub async fn review(&self) -> Result<RunSummary, RefineflowError> {
        let judge = self
            .config
            .judge
            .clone()
            .ok_or(ConfigError::MissingBackend("judge"))?;
        let items = self
            .output_store(Stage::Consolidate)
            .read_entries()
            .await?
            .into_iter()
            .filter(|entry| entry.verdict.is_some_and(ConsolidationComparator::needs_review))
            .map(|entry| {
                let verdict = entry.verdict;
                let mut record = entry.record;
                record.test_output = None;
                WorkItem::from_prepared(record).with_verdict(verdict)
            })
            .collect();
        let retrier = self.retrier(judge, None);
        self.runner(OutputInterpreter::Review)
            .run(Stage::Consolidate, items, &retrier, &self.review_store())
            .await
    }

    /// Verdict counts over consolidation output, with review outcomes.
    pub async fn tally(&self) -> Result<VerdictTally, RefineflowError> {
        let entries = self.output_store(Stage::Consolidate).read_entries().await?;
        let reviews = self.review_store().read_entries().await?;
        let reviewed = VerdictTally::collect(&reviews);
        Ok(VerdictTally {
            validated_wins: reviewed.validated_wins,
            explicit_ties: reviewed.explicit_ties,
            anomalies: reviewed.anomalies,
            ..VerdictTally::collect(&entries)
        })
    }

    /// Acceptance statistics over reflection output.
    pub async fn reflection_stats(&self) -> Result<ReflectionStats, RefineflowError> {
        let entries = self.output_store(Stage::Reflection).read_entries().await?;
        Ok(ReflectionStats::collect(entries.iter().map(|entry| &entry.record)))
    }

    /// Compares accepted critiques across reflection outputs of several runs.
    ///
    /// Every store must exist.
    pub async fn critique_agreement(
        &self,
        stores: &[PathBuf],
    ) -> Result<CritiqueAgreement, RefineflowError> {
        let mut runs = Vec::with_capacity(stores.len());
        for path in stores {
            runs.push(JsonlStore::new(path).read_required::<OutputEntry>().await?);
        }
        Ok(CritiqueAgreement::collect(
            runs.iter().map(|entries| entries.iter().map(|entry| &entry.record)),
        ))
    }
}

const fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::EmptyContext => "empty_context",
        SkipReason::CritiqueNotAccepted => "critique_not_accepted",
        SkipReason::EmptyRefinement => "empty_refinement",
    }
}
