//! Scripted backends for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::backend::{Backend, BackendConfig, ChatRequest};
use crate::errors::BackendError;

/// How a [`ScriptedBackend`] answers a matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Reply with fixed text.
    Reply(String),
    /// Reply with `"<config name>: <prompt>"`.
    Echo,
    /// Fail every call with a transient error.
    AlwaysFail,
    /// Fail the first `n` calls for a prompt, then echo.
    FailTimes(usize),
    /// Reject the content.
    PolicyReject,
    /// Rate-limit the first `n` calls for a prompt with the given hint, then echo.
    RateLimitTimes(usize, Duration),
    /// Fail with a non-retryable error.
    Fatal,
}

#[derive(Debug, Clone)]
struct Rule {
    prompt_contains: Option<String>,
    config: Option<String>,
    script: Script,
}

impl Rule {
    fn matches(&self, prompt: &str, config: &str) -> bool {
        self.prompt_contains
            .as_deref()
            .map_or(true, |needle| prompt.contains(needle))
            && self.config.as_deref().map_or(true, |name| name == config)
    }
}

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Name of the configuration used.
    pub config: String,
    /// The user prompt.
    pub prompt: String,
}

/// A backend whose answers are scripted per prompt or per configuration.
///
/// Rules are tried in insertion order; the first match decides. Calls that
/// match no rule use the default script.
#[derive(Debug)]
pub struct ScriptedBackend {
    default: Script,
    rules: Vec<Rule>,
    calls: Mutex<Vec<RecordedCall>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new(Script::Echo)
    }
}

impl ScriptedBackend {
    /// Creates a backend answering every call with `default`.
    #[must_use]
    pub fn new(default: Script) -> Self {
        Self {
            default,
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a backend that echoes every prompt.
    #[must_use]
    pub fn echo() -> Self {
        Self::default()
    }

    /// Uses `script` for prompts containing `needle`.
    #[must_use]
    pub fn on_prompt(mut self, needle: impl Into<String>, script: Script) -> Self {
        self.rules.push(Rule {
            prompt_contains: Some(needle.into()),
            config: None,
            script,
        });
        self
    }

    /// Uses `script` for calls made with the named configuration.
    #[must_use]
    pub fn on_config(mut self, name: impl Into<String>, script: Script) -> Self {
        self.rules.push(Rule {
            prompt_contains: None,
            config: Some(name.into()),
            script,
        });
        self
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the number of calls whose prompt contains `needle`.
    #[must_use]
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.prompt.contains(needle))
            .count()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.attempts.lock().clear();
    }

    fn script_for(&self, prompt: &str, config: &str) -> &Script {
        self.rules
            .iter()
            .find(|rule| rule.matches(prompt, config))
            .map_or(&self.default, |rule| &rule.script)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn complete(
        &self,
        request: &ChatRequest,
        config: &BackendConfig,
    ) -> Result<String, BackendError> {
        let prompt = request.prompt().to_string();
        self.calls.lock().push(RecordedCall {
            config: config.name.clone(),
            prompt: prompt.clone(),
        });
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(prompt.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let echo = format!("{}: {prompt}", config.name);

        match self.script_for(&prompt, &config.name) {
            Script::Reply(text) => Ok(text.clone()),
            Script::Echo => Ok(echo),
            Script::AlwaysFail => Err(BackendError::transient("scripted failure")),
            Script::FailTimes(n) if attempt <= *n => {
                Err(BackendError::transient(format!("scripted failure {attempt}")))
            }
            Script::FailTimes(_) => Ok(echo),
            Script::PolicyReject => Err(BackendError::policy_rejected("content_filter")),
            Script::RateLimitTimes(n, wait) if attempt <= *n => Err(
                BackendError::rate_limited(Some(*wait), "scripted rate limit"),
            ),
            Script::RateLimitTimes(..) => Ok(echo),
            Script::Fatal => Err(BackendError::fatal("scripted fatal error")),
        }
    }
}
