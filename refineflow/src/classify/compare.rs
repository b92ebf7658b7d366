//! Position-bias control for consolidation judgments.
//!
//! The two candidates are shown in a random order; the judge's label refers
//! to a position and is mapped back to a candidate with the recorded order.

use crate::core::OutputEntry;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A positional judgment parsed from judge output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// Neither side won.
    Tied,
    /// The first candidate won.
    Left,
    /// The second candidate won.
    Right,
}

impl Label {
    /// Parses a judge response into a label.
    ///
    /// An explicit "tied" wins. Otherwise a lone `1` or `2` decides, and when
    /// both digits occur the first one mentioned decides. Anything else,
    /// including "both" without digits, is a tie.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        if text.to_lowercase().contains("tied") {
            return Self::Tied;
        }
        match (text.find('1'), text.find('2')) {
            (Some(one), Some(two)) if one < two => Self::Left,
            (Some(_), Some(_)) | (None, Some(_)) => Self::Right,
            (Some(_), None) => Self::Left,
            (None, None) => Self::Tied,
        }
    }

    /// Numeric code: 0 tied, 1 left, 2 right.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Tied => 0,
            Self::Left => 1,
            Self::Right => 2,
        }
    }
}

/// A judgment expressed in terms of the candidates rather than positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The original suggestion is better.
    OriginalBetter,
    /// The refinement is better.
    RefinementBetter,
    /// Neither is better.
    Tied,
}

/// Result of asking a stronger judge to confirm a refinement win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    /// The stronger judge also prefers the refinement.
    ValidatedWin,
    /// The stronger judge calls it a tie.
    ExplicitTie,
    /// The stronger judge prefers the original; kept for manual review.
    Anomalous,
}

/// The two candidates in presentation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrangement<'a> {
    /// Text shown as suggestion 1.
    pub first: &'a str,
    /// Text shown as suggestion 2.
    pub second: &'a str,
    /// Whether the original suggestion is shown first.
    pub initial_suggestion_first: bool,
}

impl<'a> Arrangement<'a> {
    /// Arranges the candidates in a known order.
    #[must_use]
    pub const fn ordered(
        original: &'a str,
        refinement: &'a str,
        initial_suggestion_first: bool,
    ) -> Self {
        if initial_suggestion_first {
            Self {
                first: original,
                second: refinement,
                initial_suggestion_first,
            }
        } else {
            Self {
                first: refinement,
                second: original,
                initial_suggestion_first,
            }
        }
    }
}

/// Randomizes presentation order and interprets judge labels.
#[derive(Debug)]
pub struct ConsolidationComparator {
    rng: Mutex<StdRng>,
}

impl Default for ConsolidationComparator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolidationComparator {
    /// Creates a comparator seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a comparator with a fixed seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Picks a presentation order for the two candidates.
    pub fn arrange<'a>(&self, original: &'a str, refinement: &'a str) -> Arrangement<'a> {
        let initial_suggestion_first = self.rng.lock().gen_bool(0.5);
        Arrangement::ordered(original, refinement, initial_suggestion_first)
    }

    /// Parses a judge response.
    #[must_use]
    pub fn parse(&self, text: &str) -> Label {
        Label::parse(text)
    }

    /// Maps a positional label back to the candidates.
    #[must_use]
    pub const fn debias(label: Label, initial_suggestion_first: bool) -> Verdict {
        match (label, initial_suggestion_first) {
            (Label::Tied, _) => Verdict::Tied,
            (Label::Left, true) | (Label::Right, false) => Verdict::OriginalBetter,
            (Label::Left, false) | (Label::Right, true) => Verdict::RefinementBetter,
        }
    }

    /// Returns true if a primary verdict should be confirmed by a stronger judge.
    #[must_use]
    pub fn needs_review(verdict: Verdict) -> bool {
        verdict == Verdict::RefinementBetter
    }

    /// Interprets the stronger judge's label for a reviewed comparison.
    #[must_use]
    pub const fn review(label: Label, initial_suggestion_first: bool) -> ReviewOutcome {
        match Self::debias(label, initial_suggestion_first) {
            Verdict::RefinementBetter => ReviewOutcome::ValidatedWin,
            Verdict::Tied => ReviewOutcome::ExplicitTie,
            Verdict::OriginalBetter => ReviewOutcome::Anomalous,
        }
    }
}

/// Verdict and review counts over consolidation output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictTally {
    /// Comparisons won by the original.
    pub original_better: usize,
    /// Comparisons won by the refinement.
    pub refinement_better: usize,
    /// Tied comparisons.
    pub tied: usize,
    /// Entries without a verdict.
    pub undecided: usize,
    /// Reviews confirming the refinement.
    pub validated_wins: usize,
    /// Reviews ending in a tie.
    pub explicit_ties: usize,
    /// Reviews contradicting the primary judge.
    pub anomalies: usize,
}

impl VerdictTally {
    /// Tallies entries.
    pub fn collect<'a>(entries: impl IntoIterator<Item = &'a OutputEntry>) -> Self {
        let mut tally = Self::default();
        for entry in entries {
            match entry.verdict {
                Some(Verdict::OriginalBetter) => tally.original_better += 1,
                Some(Verdict::RefinementBetter) => tally.refinement_better += 1,
                Some(Verdict::Tied) => tally.tied += 1,
                None => tally.undecided += 1,
            }
            match entry.review {
                Some(ReviewOutcome::ValidatedWin) => tally.validated_wins += 1,
                Some(ReviewOutcome::ExplicitTie) => tally.explicit_ties += 1,
                Some(ReviewOutcome::Anomalous) => tally.anomalies += 1,
                None => {}
            }
        }
        tally
    }

    /// Share of decided comparisons won by the refinement.
    #[must_use]
    pub fn refinement_win_rate(&self) -> f64 {
        let decided = self.original_better + self.refinement_better;
        if decided == 0 {
            return 0.0;
        }
        self.refinement_better as f64 / decided as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;

    #[test]
    fn test_parse_fixtures() {
        assert_eq!(Label::parse("Suggestion 2 is more ethical"), Label::Right);
        assert_eq!(Label::parse("Both are tied"), Label::Tied);
        assert_eq!(Label::parse("1 and 2 are both acceptable"), Label::Left);
    }

    #[test]
    fn test_parse_first_mention_wins() {
        assert_eq!(Label::parse("2, not 1"), Label::Right);
        assert_eq!(Label::parse("Suggestion #1"), Label::Left);
    }

    #[test]
    fn test_parse_defaults_to_tied() {
        assert_eq!(Label::parse(""), Label::Tied);
        assert_eq!(Label::parse("I cannot decide."), Label::Tied);
        assert_eq!(Label::parse("They are both fine"), Label::Tied);
        assert_eq!(Label::parse("TIED, though 2 is close"), Label::Tied);
    }

    #[test]
    fn test_label_codes() {
        assert_eq!(Label::Tied.code(), 0);
        assert_eq!(Label::Left.code(), 1);
        assert_eq!(Label::Right.code(), 2);
    }

    #[test]
    fn test_debias() {
        assert_eq!(
            ConsolidationComparator::debias(Label::Left, true),
            Verdict::OriginalBetter
        );
        assert_eq!(
            ConsolidationComparator::debias(Label::Left, false),
            Verdict::RefinementBetter
        );
        assert_eq!(
            ConsolidationComparator::debias(Label::Right, true),
            Verdict::RefinementBetter
        );
        assert_eq!(
            ConsolidationComparator::debias(Label::Right, false),
            Verdict::OriginalBetter
        );
        assert_eq!(
            ConsolidationComparator::debias(Label::Tied, false),
            Verdict::Tied
        );
    }

    #[test]
    fn test_review_outcomes() {
        assert_eq!(
            ConsolidationComparator::review(Label::Right, true),
            ReviewOutcome::ValidatedWin
        );
        assert_eq!(
            ConsolidationComparator::review(Label::Tied, true),
            ReviewOutcome::ExplicitTie
        );
        assert_eq!(
            ConsolidationComparator::review(Label::Right, false),
            ReviewOutcome::Anomalous
        );
    }

    #[test]
    fn test_needs_review_only_for_refinement_wins() {
        assert!(ConsolidationComparator::needs_review(Verdict::RefinementBetter));
        assert!(!ConsolidationComparator::needs_review(Verdict::OriginalBetter));
        assert!(!ConsolidationComparator::needs_review(Verdict::Tied));
    }

    #[test]
    fn test_arrange_places_candidates_by_order() {
        let comparator = ConsolidationComparator::with_seed(7);
        let mut seen_first = false;
        let mut seen_second = false;

        for _ in 0..64 {
            let arrangement = comparator.arrange("orig", "ref");
            if arrangement.initial_suggestion_first {
                assert_eq!((arrangement.first, arrangement.second), ("orig", "ref"));
                seen_first = true;
            } else {
                assert_eq!((arrangement.first, arrangement.second), ("ref", "orig"));
                seen_second = true;
            }
        }

        assert!(seen_first && seen_second);
    }

    #[test]
    fn test_seeded_comparators_agree() {
        let a = ConsolidationComparator::with_seed(42);
        let b = ConsolidationComparator::with_seed(42);
        for _ in 0..16 {
            assert_eq!(
                a.arrange("x", "y").initial_suggestion_first,
                b.arrange("x", "y").initial_suggestion_first
            );
        }
    }

    #[test]
    fn test_tally() {
        let entry = |verdict, review| {
            let mut entry = OutputEntry::new("gpt", Record::new("ctx"), "1");
            entry.verdict = verdict;
            entry.review = review;
            entry
        };
        let entries = vec![
            entry(Some(Verdict::RefinementBetter), Some(ReviewOutcome::ValidatedWin)),
            entry(Some(Verdict::RefinementBetter), Some(ReviewOutcome::Anomalous)),
            entry(Some(Verdict::OriginalBetter), None),
            entry(Some(Verdict::Tied), None),
            entry(None, None),
        ];

        let tally = VerdictTally::collect(&entries);

        assert_eq!(tally.refinement_better, 2);
        assert_eq!(tally.original_better, 1);
        assert_eq!(tally.tied, 1);
        assert_eq!(tally.undecided, 1);
        assert_eq!(tally.validated_wins, 1);
        assert_eq!(tally.anomalies, 1);
        assert!((tally.refinement_win_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
