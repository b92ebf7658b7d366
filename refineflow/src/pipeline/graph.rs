//! Stage dependencies, gating and prompt rendering.

use crate::classify::{Arrangement, ConsolidationComparator, ReflectionClassifier};
use crate::core::{OutputEntry, Record, Stage};
use crate::errors::ConfigError;
use crate::prompt::PromptTemplate;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Placeholder names a rendered record can bind.
const BINDABLE_PLACEHOLDERS: [&str; 7] = [
    "context",
    "suggestion",
    "critique",
    "reflection",
    "refine",
    "suggestion1",
    "suggestion2",
];

/// Why a record was not turned into a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The context is empty.
    EmptyContext,
    /// The reflection does not accept the critique.
    CritiqueNotAccepted,
    /// The refinement is blank.
    EmptyRefinement,
}

/// Result of rendering a record for a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// The prompt to send.
    Prompt(String),
    /// The record does not take part in the stage.
    Skip(SkipReason),
}

/// Renders stage prompts and decides which records take part in a stage.
#[derive(Debug)]
pub struct StageGraph {
    templates_dir: PathBuf,
    templates: RwLock<HashMap<Stage, Arc<PromptTemplate>>>,
    classifier: ReflectionClassifier,
    comparator: Arc<ConsolidationComparator>,
}

impl StageGraph {
    /// Creates a graph reading `<stage>.prompt` files from `templates_dir`.
    #[must_use]
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            templates: RwLock::new(HashMap::new()),
            classifier: ReflectionClassifier::new(),
            comparator: Arc::new(ConsolidationComparator::new()),
        }
    }

    /// Uses a specific comparator, e.g. a seeded one.
    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<ConsolidationComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Binds a template to a stage without reading it from disk.
    #[must_use]
    pub fn with_template(self, stage: Stage, template: PromptTemplate) -> Self {
        self.templates.write().insert(stage, Arc::new(template));
        self
    }

    /// The template directory.
    #[must_use]
    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    /// The comparator used for consolidation ordering.
    #[must_use]
    pub fn comparator(&self) -> &Arc<ConsolidationComparator> {
        &self.comparator
    }

    /// Path of the template file bound to `stage`.
    #[must_use]
    pub fn template_path(&self, stage: Stage) -> PathBuf {
        self.templates_dir.join(format!("{stage}.prompt"))
    }

    /// Returns the template for `stage`, loading it on first use.
    pub fn template(&self, stage: Stage) -> Result<Arc<PromptTemplate>, ConfigError> {
        if let Some(template) = self.templates.read().get(&stage) {
            return Ok(Arc::clone(template));
        }
        let path = self.template_path(stage);
        let template = PromptTemplate::load(&path).map_err(|e| ConfigError::MissingTemplate {
            stage,
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let unbindable = Self::unbindable_placeholders(&template);
        if !unbindable.is_empty() {
            warn!(
                stage = %stage,
                path = %path.display(),
                placeholders = ?unbindable,
                "Template placeholders will be left unsubstituted"
            );
        }
        let template = Arc::new(template);
        self.templates
            .write()
            .entry(stage)
            .or_insert_with(|| Arc::clone(&template));
        Ok(template)
    }

    /// Placeholders in `template` that no record field can bind.
    #[must_use]
    pub fn unbindable_placeholders(template: &PromptTemplate) -> Vec<String> {
        template
            .placeholders()
            .into_iter()
            .filter(|name| !BINDABLE_PLACEHOLDERS.contains(&name.as_str()))
            .collect()
    }

    /// Renders the prompt for `record` at `stage`.
    ///
    /// Missing required fields and unreadable templates are fatal. For
    /// `consolidate` the presentation order is chosen here and stored on the
    /// record; an order already on the record is kept.
    pub fn render(&self, record: &mut Record, stage: Stage) -> Result<Rendered, ConfigError> {
        if let Some(field) = record.missing_for(stage) {
            return Err(ConfigError::missing_field(stage, field.as_str(), record.key()));
        }

        if !stage.uses_template() {
            if record.context.is_empty() {
                return Ok(Rendered::Skip(SkipReason::EmptyContext));
            }
            return Ok(Rendered::Prompt(record.context.clone()));
        }

        let template = self.template(stage)?;

        match stage {
            Stage::Refine if !self.classifier.accepts(record.reflection.as_deref().unwrap_or_default()) => {
                return Ok(Rendered::Skip(SkipReason::CritiqueNotAccepted));
            }
            Stage::Consolidate if record.refine.as_deref().unwrap_or_default().trim().is_empty() => {
                return Ok(Rendered::Skip(SkipReason::EmptyRefinement));
            }
            _ => {}
        }

        let mut bindings = record.bindings();
        if stage == Stage::Consolidate {
            let original = record.suggestion.as_deref().unwrap_or_default();
            let refinement = record.refine.as_deref().unwrap_or_default();
            let arrangement = match record.initial_suggestion_first {
                Some(first) => Arrangement::ordered(original, refinement, first),
                None => self.comparator.arrange(original, refinement),
            };
            bindings.insert("suggestion1".to_string(), arrangement.first.to_string());
            bindings.insert("suggestion2".to_string(), arrangement.second.to_string());
            record.initial_suggestion_first = Some(arrangement.initial_suggestion_first);
        }

        Ok(Rendered::Prompt(template.render(&bindings)))
    }

    /// Builds the input record for `stage` from an entry of its predecessor.
    #[must_use]
    pub fn prepare(entry: OutputEntry, stage: Stage) -> Record {
        match stage.predecessor() {
            Some(previous) => entry.into_next_record(previous),
            None => {
                let mut record = entry.record;
                record.test_input = None;
                record.test_output = None;
                record.initial_suggestion_first = None;
                record
            }
        }
    }

    /// Orders the requested stages so every stage follows its predecessor.
    ///
    /// Duplicates are dropped; stages that were not requested are not added.
    #[must_use]
    pub fn execution_order(stages: &[Stage]) -> Vec<Stage> {
        fn visit(
            stage: Stage,
            requested: &HashSet<Stage>,
            visited: &mut HashSet<Stage>,
            result: &mut Vec<Stage>,
        ) {
            if !visited.insert(stage) {
                return;
            }
            if let Some(previous) = stage.predecessor() {
                if requested.contains(&previous) {
                    visit(previous, requested, visited, result);
                }
            }
            result.push(stage);
        }

        let requested: HashSet<Stage> = stages.iter().copied().collect();
        let mut visited = HashSet::new();
        let mut result = Vec::with_capacity(requested.len());
        for stage in stages {
            visit(*stage, &requested, &mut visited, &mut result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;
    use pretty_assertions::assert_eq;

    fn graph() -> StageGraph {
        StageGraph::new("/nonexistent")
            .with_template(Stage::Critique, PromptTemplate::new("C: $context$ S: $suggestion$"))
            .with_template(Stage::Reflection, PromptTemplate::new("R: $critique$"))
            .with_template(Stage::Refine, PromptTemplate::new("F: $critique$ / $reflection$"))
            .with_template(
                Stage::Consolidate,
                PromptTemplate::new("1) $suggestion1$\n2) $suggestion2$"),
            )
            .with_comparator(Arc::new(ConsolidationComparator::with_seed(3)))
    }

    fn full_record() -> Record {
        Record::new("ctx")
            .with(Field::Suggestion, "orig")
            .with(Field::Critique, "too blunt")
            .with(Field::Reflection, "I accept.")
            .with(Field::Refine, "better")
    }

    #[test]
    fn test_unbindable_placeholders() {
        let template = PromptTemplate::new("$context$ $suggestion1$ $critque$ $suggestion3$");
        assert_eq!(
            StageGraph::unbindable_placeholders(&template),
            vec!["critque".to_string(), "suggestion3".to_string()]
        );
        assert!(StageGraph::unbindable_placeholders(&PromptTemplate::new("R: $critique$")).is_empty());
    }

    #[test]
    fn test_suggestion_prompt_is_context() {
        let mut record = Record::new("A friend asked me to lie.");
        assert_eq!(
            graph().render(&mut record, Stage::Suggestion).unwrap(),
            Rendered::Prompt("A friend asked me to lie.".to_string())
        );

        let mut empty = Record::new("");
        assert_eq!(
            graph().render(&mut empty, Stage::Suggestion).unwrap(),
            Rendered::Skip(SkipReason::EmptyContext)
        );
    }

    #[test]
    fn test_render_substitutes_record_fields() {
        let mut record = Record::new("ctx").with(Field::Suggestion, "costs $critique$");
        assert_eq!(
            graph().render(&mut record, Stage::Critique).unwrap(),
            Rendered::Prompt("C: ctx S: costs $critique$".to_string())
        );
    }

    #[test]
    fn test_missing_required_field_is_fatal() {
        let mut record = Record::new("ctx").with(Field::Suggestion, "s");
        let err = graph().render(&mut record, Stage::Refine).unwrap_err();

        match err {
            ConfigError::MissingField { stage, field, key } => {
                assert_eq!(stage, Stage::Refine);
                assert_eq!(field, "critique");
                assert!(key.contains("ctx"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_template_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let graph = StageGraph::new(dir.path());
        let mut record = Record::new("ctx").with(Field::Suggestion, "s");

        assert!(matches!(
            graph.render(&mut record, Stage::Critique),
            Err(ConfigError::MissingTemplate { stage: Stage::Critique, .. })
        ));
    }

    #[test]
    fn test_template_loaded_from_dir_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("critique.prompt"), "Critique: $suggestion$").unwrap();
        let graph = StageGraph::new(dir.path());
        let mut record = Record::new("ctx").with(Field::Suggestion, "s");

        assert_eq!(
            graph.render(&mut record, Stage::Critique).unwrap(),
            Rendered::Prompt("Critique: s".to_string())
        );

        std::fs::remove_file(dir.path().join("critique.prompt")).unwrap();
        assert!(graph.render(&mut record, Stage::Critique).is_ok());
    }

    #[test]
    fn test_refine_gated_by_reflection() {
        let graph = graph();

        let mut accepted = full_record();
        assert!(matches!(
            graph.render(&mut accepted, Stage::Refine).unwrap(),
            Rendered::Prompt(_)
        ));

        let mut rejected = full_record().with(Field::Reflection, "No, I disagree.");
        assert_eq!(
            graph.render(&mut rejected, Stage::Refine).unwrap(),
            Rendered::Skip(SkipReason::CritiqueNotAccepted)
        );

        let mut excluded = full_record().with(Field::Reflection, "");
        assert_eq!(
            graph.render(&mut excluded, Stage::Refine).unwrap(),
            Rendered::Skip(SkipReason::CritiqueNotAccepted)
        );
    }

    #[test]
    fn test_consolidate_skips_blank_refinement() {
        let mut record = full_record().with(Field::Refine, "   ");
        assert_eq!(
            graph().render(&mut record, Stage::Consolidate).unwrap(),
            Rendered::Skip(SkipReason::EmptyRefinement)
        );
    }

    #[test]
    fn test_consolidate_records_presentation_order() {
        let graph = graph();
        for _ in 0..16 {
            let mut record = full_record();
            let Rendered::Prompt(prompt) = graph.render(&mut record, Stage::Consolidate).unwrap() else {
                panic!("expected a prompt");
            };
            let expected = if record.initial_suggestion_first == Some(true) {
                "1) orig\n2) better"
            } else {
                "1) better\n2) orig"
            };
            assert!(record.initial_suggestion_first.is_some());
            assert_eq!(prompt, expected);
        }
    }

    #[test]
    fn test_consolidate_keeps_existing_order() {
        let mut record = full_record();
        record.initial_suggestion_first = Some(false);

        assert_eq!(
            graph().render(&mut record, Stage::Consolidate).unwrap(),
            Rendered::Prompt("1) better\n2) orig".to_string())
        );
        assert_eq!(record.initial_suggestion_first, Some(false));
    }

    #[test]
    fn test_prepare_moves_output_into_field() {
        let mut record = Record::new("ctx").with(Field::Suggestion, "s");
        record.test_input = Some("prompt".to_string());
        let entry = OutputEntry::new("chatgpt", record, "crit");

        let next = StageGraph::prepare(entry, Stage::Reflection);

        assert_eq!(next.critique.as_deref(), Some("crit"));
        assert_eq!(next.test_input, None);
        assert_eq!(next.test_output, None);
    }

    #[test]
    fn test_execution_order() {
        assert_eq!(
            StageGraph::execution_order(&[Stage::Refine, Stage::Suggestion, Stage::Critique, Stage::Reflection]),
            vec![Stage::Suggestion, Stage::Critique, Stage::Reflection, Stage::Refine]
        );
        assert_eq!(
            StageGraph::execution_order(&[Stage::Consolidate, Stage::Critique, Stage::Consolidate]),
            vec![Stage::Consolidate, Stage::Critique]
        );
        assert_eq!(
            StageGraph::execution_order(&[Stage::ReflectionExplain, Stage::Critique]),
            vec![Stage::Critique, Stage::ReflectionExplain]
        );
    }
}
