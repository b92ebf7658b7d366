//! Heuristic acceptance check for reflection text.
//!
//! The phrase list is closed and one-sided: anything that does not match is
//! treated as a rejected critique. A phrase only counts when it starts a word,
//! so "disagree" does not read as "agree".

use crate::core::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Phrases whose presence marks a critique as accepted.
pub const ACCEPTANCE_PHRASES: [&str; 8] = [
    "yes",
    "accept",
    "agree",
    "the critique is valid",
    "the critique is helpful",
    "the critique is reasonable",
    "the critique is more ethically reasonable",
    "the critique is very helpful",
];

/// Deterministic text-to-decision classifier for reflections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReflectionClassifier;

impl ReflectionClassifier {
    /// Creates a classifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true if the text accepts the critique.
    #[must_use]
    pub fn accepts(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        ACCEPTANCE_PHRASES
            .iter()
            .any(|phrase| contains_at_word_start(&lowered, phrase))
    }

    /// Classifies a record's reflection.
    ///
    /// Falls back to `test_output` when the reflection is missing or empty,
    /// which is how raw reflection-stage output entries carry it.
    #[must_use]
    pub fn accepts_record(&self, record: &Record) -> bool {
        let text = match record.reflection.as_deref() {
            Some(reflection) if !reflection.is_empty() => reflection,
            _ => record.test_output.as_deref().unwrap_or_default(),
        };
        self.accepts(text)
    }

    /// Returns true if a critique raises an actual issue.
    #[must_use]
    pub fn has_critique(&self, critique: &str) -> bool {
        !critique.to_lowercase().contains("none")
    }
}

fn contains_at_word_start(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(idx, _)| {
        haystack[..idx]
            .chars()
            .next_back()
            .map_or(true, |prev| !prev.is_alphanumeric())
    })
}

/// Acceptance statistics over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionStats {
    /// Records inspected.
    pub total: usize,
    /// Records whose critique raises an issue.
    pub substantive_critiques: usize,
    /// Records with a substantive critique whose reflection accepts it.
    pub accepted: usize,
}

impl ReflectionStats {
    /// Collects statistics over records.
    pub fn collect<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let classifier = ReflectionClassifier::new();
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            let critique = record.critique.as_deref().unwrap_or_default();
            if classifier.has_critique(critique) {
                stats.substantive_critiques += 1;
                if classifier.accepts_record(record) {
                    stats.accepted += 1;
                }
            }
        }
        stats
    }

    /// Fraction of records whose critique was accepted.
    #[must_use]
    pub fn acceptance_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.total as f64
    }
}

/// Overlap of accepted critiques across several reflection runs.
///
/// Contexts are compared by text. Each run contributes the set of contexts
/// whose substantive critique it accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueAgreement {
    /// Accepted contexts per run, in input order.
    pub accepted: Vec<usize>,
    /// Shared accepted contexts for every pair of runs `(i, j)` with `i < j`.
    pub pairwise: Vec<(usize, usize, usize)>,
    /// Contexts accepted by every run.
    pub all_runs: usize,
    /// Distinct contexts with a substantive critique in any run.
    pub substantive_critiques: usize,
    /// Distinct contexts accepted by at least one run.
    pub accepted_any: usize,
}

impl CritiqueAgreement {
    /// Compares runs given as record sets.
    pub fn collect<'a, R>(runs: impl IntoIterator<Item = R>) -> Self
    where
        R: IntoIterator<Item = &'a Record>,
    {
        let classifier = ReflectionClassifier::new();
        let mut substantive = BTreeSet::new();
        let mut per_run: Vec<BTreeSet<&'a str>> = Vec::new();

        for run in runs {
            let mut accepted = BTreeSet::new();
            for record in run {
                let critique = record.critique.as_deref().unwrap_or_default();
                if !classifier.has_critique(critique) {
                    continue;
                }
                substantive.insert(record.context.as_str());
                if classifier.accepts_record(record) {
                    accepted.insert(record.context.as_str());
                }
            }
            per_run.push(accepted);
        }

        let mut pairwise = Vec::new();
        for (i, a) in per_run.iter().enumerate() {
            for (j, b) in per_run.iter().enumerate().skip(i + 1) {
                pairwise.push((i, j, a.intersection(b).count()));
            }
        }
        let all_runs = per_run.split_first().map_or(0, |(first, rest)| {
            first
                .iter()
                .filter(|context| rest.iter().all(|run| run.contains(*context)))
                .count()
        });
        let accepted_any = per_run
            .iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len();

        Self {
            accepted: per_run.iter().map(BTreeSet::len).collect(),
            pairwise,
            all_runs,
            substantive_critiques: substantive.len(),
            accepted_any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;

    #[test]
    fn test_accepts_fixtures() {
        let classifier = ReflectionClassifier::new();

        assert!(classifier.accepts("The critique is helpful and I agree."));
        assert!(classifier.accepts("Yes, I accept the critique"));
        assert!(!classifier.accepts("No, I disagree."));
        assert!(!classifier.accepts(""));
    }

    #[test]
    fn test_accepts_is_case_insensitive() {
        let classifier = ReflectionClassifier::new();
        assert!(classifier.accepts("THE CRITIQUE IS VALID"));
        assert!(classifier.accepts("I Accept."));
    }

    #[test]
    fn test_unmatched_text_is_rejected() {
        let classifier = ReflectionClassifier::new();
        assert!(!classifier.accepts("The original suggestion stands."));
        assert!(!classifier.accepts("No."));
    }

    #[test]
    fn test_phrases_match_at_word_start_only() {
        let classifier = ReflectionClassifier::new();
        assert!(!classifier.accepts("I disagree with the critique"));
        assert!(classifier.accepts("I agreed after thinking it over"));
        assert!(classifier.accepts("The critique is acceptable"));
        assert!(classifier.accepts("(yes)"));
    }

    #[test]
    fn test_accepts_record_falls_back_to_test_output() {
        let classifier = ReflectionClassifier::new();
        let mut record = Record::new("ctx");
        record.test_output = Some("Yes".to_string());
        assert!(classifier.accepts_record(&record));

        record.reflection = Some(String::new());
        assert!(classifier.accepts_record(&record));

        record.reflection = Some("No.".to_string());
        assert!(!classifier.accepts_record(&record));
    }

    #[test]
    fn test_has_critique() {
        let classifier = ReflectionClassifier::new();
        assert!(classifier.has_critique("The suggestion ignores the friend's feelings."));
        assert!(!classifier.has_critique("None."));
        assert!(!classifier.has_critique("NONE"));
    }

    #[test]
    fn test_stats_collect() {
        let records = vec![
            Record::new("a")
                .with(Field::Critique, "Too harsh.")
                .with(Field::Reflection, "I accept."),
            Record::new("b")
                .with(Field::Critique, "Too vague.")
                .with(Field::Reflection, "No."),
            Record::new("c")
                .with(Field::Critique, "None")
                .with(Field::Reflection, "Yes"),
        ];

        let stats = ReflectionStats::collect(&records);

        assert_eq!(
            stats,
            ReflectionStats {
                total: 3,
                substantive_critiques: 2,
                accepted: 1,
            }
        );
        assert!((stats.acceptance_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_empty() {
        let stats = ReflectionStats::collect(&Vec::<Record>::new());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.acceptance_rate(), 0.0);
    }

    fn reflected(context: &str, critique: &str, reflection: &str) -> Record {
        Record::new(context)
            .with(Field::Critique, critique)
            .with(Field::Reflection, reflection)
    }

    #[test]
    fn test_critique_agreement_across_runs() {
        let first = vec![
            reflected("a", "Too harsh.", "Yes"),
            reflected("b", "Too vague.", "I accept."),
            reflected("c", "None", "Yes"),
        ];
        let second = vec![
            reflected("a", "Rude.", "I agree."),
            reflected("b", "Unclear.", "No."),
            reflected("d", "Missing empathy.", "Yes"),
        ];
        let third = vec![reflected("a", "Blunt.", "The critique is valid.")];

        let agreement = CritiqueAgreement::collect([&first, &second, &third]);

        assert_eq!(agreement.accepted, vec![2, 2, 1]);
        assert_eq!(agreement.pairwise, vec![(0, 1, 1), (0, 2, 1), (1, 2, 1)]);
        assert_eq!(agreement.all_runs, 1);
        assert_eq!(agreement.substantive_critiques, 3);
        assert_eq!(agreement.accepted_any, 3);
    }

    #[test]
    fn test_critique_agreement_without_runs() {
        let agreement = CritiqueAgreement::collect(Vec::<Vec<Record>>::new().iter());
        assert_eq!(agreement, CritiqueAgreement::default());
    }
}
