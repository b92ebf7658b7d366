//! Deterministic interpretation of free-text model output.
//!
//! - [`ReflectionClassifier`] decides whether a reflection accepts its critique
//! - [`ConsolidationComparator`] turns judge responses into de-biased verdicts

mod compare;
mod reflection;

pub use compare::{
    Arrangement, ConsolidationComparator, Label, ReviewOutcome, Verdict, VerdictTally,
};
pub use reflection::{
    CritiqueAgreement, ReflectionClassifier, ReflectionStats, ACCEPTANCE_PHRASES,
};
