//! Prompt templates with `$name$` placeholders.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_-]*)\$").expect("placeholder pattern is valid")
});

/// A loaded prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    text: String,
    source: Option<PathBuf>,
}

impl PromptTemplate {
    /// Creates a template from text.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: None,
        }
    }

    /// Loads a template from a file.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Ok(Self {
            text,
            source: Some(path.to_path_buf()),
        })
    }

    /// Returns the raw template text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the file the template was loaded from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Names of all placeholders in the template.
    #[must_use]
    pub fn placeholders(&self) -> BTreeSet<String> {
        PLACEHOLDER
            .captures_iter(&self.text)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Substitutes bound placeholders in one left-to-right pass.
    ///
    /// Values are inserted verbatim and never rescanned. Unbound placeholders
    /// stay in the output unchanged.
    #[must_use]
    pub fn render(&self, bindings: &BTreeMap<String, String>) -> String {
        PLACEHOLDER
            .replace_all(&self.text, |caps: &Captures<'_>| {
                bindings
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}
