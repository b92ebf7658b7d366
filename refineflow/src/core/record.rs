//! Records and output entries as stored in the line-oriented stores.

use super::{Field, Stage};
use crate::classify::{Label, ReviewOutcome, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The unit of work, keyed by its context text.
///
/// Fields are `None` until the stage producing them has run. An empty string
/// is a deliberate "excluded" marker, not a missing value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The context text. Source stores may call it `text`.
    #[serde(alias = "text")]
    pub context: String,
    /// Initial response to the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Critique of the suggestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<String>,
    /// Reflection on the critique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    /// Refined suggestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refine: Option<String>,
    /// Rendered prompt for the current stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_input: Option<String>,
    /// Generated text for the current stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_output: Option<String>,
    /// Presentation order chosen when rendering a consolidation prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_suggestion_first: Option<bool>,
    /// Fields this crate does not interpret, carried through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Record {
    /// Creates a record for a context.
    #[must_use]
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            ..Self::default()
        }
    }

    /// Sets a field.
    #[must_use]
    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    /// Returns a field's value if present.
    #[must_use]
    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::Context => Some(self.context.as_str()),
            Field::Suggestion => self.suggestion.as_deref(),
            Field::Critique => self.critique.as_deref(),
            Field::Reflection => self.reflection.as_deref(),
            Field::Refine => self.refine.as_deref(),
        }
    }

    /// Sets a field's value.
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        match field {
            Field::Context => self.context = value,
            Field::Suggestion => self.suggestion = Some(value),
            Field::Critique => self.critique = Some(value),
            Field::Reflection => self.reflection = Some(value),
            Field::Refine => self.refine = Some(value),
        }
    }

    /// Returns the first field `stage` requires that this record lacks.
    #[must_use]
    pub fn missing_for(&self, stage: Stage) -> Option<Field> {
        stage
            .required_fields()
            .iter()
            .copied()
            .find(|field| self.get(*field).is_none())
    }

    /// The key a completed work item is recognised by.
    ///
    /// This is the rendered prompt when one exists, else the context.
    #[must_use]
    pub fn key(&self) -> &str {
        self.test_input.as_deref().unwrap_or(&self.context)
    }

    /// Bound placeholder values for template rendering.
    #[must_use]
    pub fn bindings(&self) -> BTreeMap<String, String> {
        [
            Field::Context,
            Field::Suggestion,
            Field::Critique,
            Field::Reflection,
            Field::Refine,
        ]
        .into_iter()
        .filter_map(|field| {
            self.get(field)
                .map(|value| (field.as_str().to_string(), value.to_string()))
        })
        .collect()
    }
}

/// One line of a stage's output store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    /// Name of the model that produced `test_output`.
    #[serde(default)]
    pub model: String,
    /// The record, including `test_input` and `test_output`.
    #[serde(flatten)]
    pub record: Record,
    /// Raw label parsed from a consolidation response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
    /// De-biased consolidation verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Outcome of the judge review pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewOutcome>,
}

impl OutputEntry {
    /// Keys an entry writes itself and therefore never carries over from
    /// the record's extra fields.
    pub const RESERVED_KEYS: [&'static str; 4] = ["model", "label", "verdict", "review"];

    /// Creates an entry from a record and the generated text.
    ///
    /// Extra record fields named like entry fields are dropped so each
    /// stored line has unique keys.
    #[must_use]
    pub fn new(model: impl Into<String>, mut record: Record, output: impl Into<String>) -> Self {
        for key in Self::RESERVED_KEYS {
            record.extra.remove(key);
        }
        record.test_output = Some(output.into());
        Self {
            model: model.into(),
            record,
            label: None,
            verdict: None,
            review: None,
        }
    }

    /// The completion key of this entry.
    #[must_use]
    pub fn key(&self) -> &str {
        self.record.key()
    }

    /// Generated text, empty if absent.
    #[must_use]
    pub fn output(&self) -> &str {
        self.record.test_output.as_deref().unwrap_or_default()
    }

    /// Turns an entry produced by `stage` into an input record for its successors.
    ///
    /// The generated text lands in the field `stage` produces; per-stage
    /// bookkeeping (prompt, output, presentation order) is cleared.
    #[must_use]
    pub fn into_next_record(self, stage: Stage) -> Record {
        let mut record = self.record;
        let output = record.test_output.take().unwrap_or_default();
        if let Some(field) = stage.output_field() {
            record.set(field, output);
        }
        record.test_input = None;
        record.initial_suggestion_first = None;
        record
    }
}
