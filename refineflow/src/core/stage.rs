//! Pipeline stages and the record fields they read and write.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A record field that stages read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// The situation the suggestion responds to.
    Context,
    /// The initial response.
    Suggestion,
    /// Critique of the suggestion.
    Critique,
    /// Reflection on the critique.
    Reflection,
    /// Refined suggestion.
    Refine,
}

impl Field {
    /// Returns the wire name of the field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Suggestion => "suggestion",
            Self::Critique => "critique",
            Self::Reflection => "reflection",
            Self::Refine => "refine",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One phase of the refinement pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Produce an initial suggestion for a context.
    Suggestion,
    /// Critique the suggestion.
    Critique,
    /// Decide whether the critique is accepted.
    Reflection,
    /// Explain the reflection decision.
    #[serde(alias = "ref-exp")]
    ReflectionExplain,
    /// Refine the suggestion using an accepted critique.
    Refine,
    /// Compare the original and refined suggestions.
    Consolidate,
}

impl Stage {
    /// Every stage in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Suggestion,
        Self::Critique,
        Self::Reflection,
        Self::ReflectionExplain,
        Self::Refine,
        Self::Consolidate,
    ];

    /// Returns the wire name of the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Suggestion => "suggestion",
            Self::Critique => "critique",
            Self::Reflection => "reflection",
            Self::ReflectionExplain => "reflection-explain",
            Self::Refine => "refine",
            Self::Consolidate => "consolidate",
        }
    }

    /// Returns the stage whose output feeds this one.
    #[must_use]
    pub const fn predecessor(self) -> Option<Self> {
        match self {
            Self::Suggestion => None,
            Self::Critique => Some(Self::Suggestion),
            Self::Reflection | Self::ReflectionExplain => Some(Self::Critique),
            Self::Refine => Some(Self::Reflection),
            Self::Consolidate => Some(Self::Refine),
        }
    }

    /// Fields that must be present on a record before this stage can render.
    #[must_use]
    pub const fn required_fields(self) -> &'static [Field] {
        match self {
            Self::Suggestion => &[Field::Context],
            Self::Critique => &[Field::Context, Field::Suggestion],
            Self::Reflection | Self::ReflectionExplain => {
                &[Field::Context, Field::Suggestion, Field::Critique]
            }
            Self::Refine => &[
                Field::Context,
                Field::Suggestion,
                Field::Critique,
                Field::Reflection,
            ],
            Self::Consolidate => &[Field::Context, Field::Suggestion, Field::Refine],
        }
    }

    /// The field this stage's generated text populates for its successors.
    #[must_use]
    pub const fn output_field(self) -> Option<Field> {
        match self {
            Self::Suggestion => Some(Field::Suggestion),
            Self::Critique => Some(Field::Critique),
            Self::Reflection | Self::ReflectionExplain => Some(Field::Reflection),
            Self::Refine => Some(Field::Refine),
            Self::Consolidate => None,
        }
    }

    /// Returns true if the stage renders its prompt from a template file.
    #[must_use]
    pub const fn uses_template(self) -> bool {
        !matches!(self, Self::Suggestion)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suggestion" => Ok(Self::Suggestion),
            "critique" => Ok(Self::Critique),
            "reflection" => Ok(Self::Reflection),
            "reflection-explain" | "ref-exp" => Ok(Self::ReflectionExplain),
            "refine" => Ok(Self::Refine),
            "consolidate" => Ok(Self::Consolidate),
            other => Err(ConfigError::UnknownStage(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predecessor_map() {
        assert_eq!(Stage::Suggestion.predecessor(), None);
        assert_eq!(Stage::Critique.predecessor(), Some(Stage::Suggestion));
        assert_eq!(Stage::Reflection.predecessor(), Some(Stage::Critique));
        assert_eq!(Stage::ReflectionExplain.predecessor(), Some(Stage::Critique));
        assert_eq!(Stage::Refine.predecessor(), Some(Stage::Reflection));
        assert_eq!(Stage::Consolidate.predecessor(), Some(Stage::Refine));
    }

    #[test]
    fn test_required_fields_grow_along_the_chain() {
        assert_eq!(Stage::Suggestion.required_fields(), &[Field::Context]);
        assert!(Stage::Refine.required_fields().contains(&Field::Reflection));
        assert!(Stage::Consolidate.required_fields().contains(&Field::Refine));
        assert!(!Stage::Consolidate.required_fields().contains(&Field::Critique));
    }

    #[test]
    fn test_predecessor_output_is_required() {
        for stage in Stage::ALL {
            if let Some(prev) = stage.predecessor() {
                let produced = prev.output_field().unwrap();
                assert!(
                    stage.required_fields().contains(&produced),
                    "{stage} should require {produced}"
                );
            }
        }
    }

    #[test]
    fn test_parse_and_display_round_trip_names() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!("ref-exp".parse::<Stage>().unwrap(), Stage::ReflectionExplain);
        assert!(matches!(
            "polish".parse::<Stage>(),
            Err(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Stage::ReflectionExplain).unwrap();
        assert_eq!(json, "\"reflection-explain\"");
        let parsed: Stage = serde_json::from_str("\"ref-exp\"").unwrap();
        assert_eq!(parsed, Stage::ReflectionExplain);
    }
}
