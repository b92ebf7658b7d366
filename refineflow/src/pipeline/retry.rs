//! Bounded retry of backend calls with rate limiting and policy fallback.
//!
//! Transient failures are retried with a configurable backoff and jitter. A
//! policy rejection takes a one-shot detour through the fallback backend
//! configuration for that call only.

use super::limiter::RateLimiter;
use crate::backend::{Backend, BackendConfig, ChatRequest};
use crate::errors::BackendError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    #[default]
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum counted attempts (including the initial one).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_attempts() -> usize {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }
}

/// Attempt bookkeeping for one call.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Counted attempts made so far.
    pub attempt: usize,
    /// Whether the uncounted retry-after retry has been spent.
    pub hint_spent: bool,
    previous_delay: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no counted attempts remain.
    #[must_use]
    pub const fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt >= config.max_attempts
    }

    /// Calculates the delay before the next attempt.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let step = self.attempt.saturating_sub(1);

        let delay = match config.backoff {
            BackoffStrategy::Exponential => {
                let exponent = u32::try_from(step).unwrap_or(u32::MAX);
                base.saturating_mul(2u64.saturating_pow(exponent)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(step as u64 + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Generated text and the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The generated text.
    pub text: String,
    /// Name of the backend configuration that answered.
    pub model: String,
}

/// Rate-limited, retrying front for a [`Backend`].
pub struct Retrier {
    backend: Arc<dyn Backend>,
    primary: BackendConfig,
    fallback: Option<BackendConfig>,
    limiter: Arc<RateLimiter>,
    config: RetryConfig,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("primary", &self.primary.name)
            .field("fallback", &self.fallback.as_ref().map(|c| &c.name))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    /// Creates a retrier with default retry settings and no fallback.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, primary: BackendConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            backend,
            primary,
            fallback: None,
            limiter,
            config: RetryConfig::default(),
        }
    }

    /// Sets the configuration used when the primary rejects content.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Option<BackendConfig>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    /// The primary backend configuration.
    #[must_use]
    pub const fn primary(&self) -> &BackendConfig {
        &self.primary
    }

    /// Name recorded on entries produced by the primary backend.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.primary.name
    }

    /// Builds a request for `prompt` with the primary configuration.
    #[must_use]
    pub fn request(&self, prompt: &str) -> ChatRequest {
        self.primary.request(prompt)
    }

    /// Completes a request, retrying transient failures.
    ///
    /// A policy detour re-renders the prompt with the fallback's own system
    /// message and temperature.
    pub async fn call(&self, request: &ChatRequest) -> Result<Completion, BackendError> {
        match self.call_with(request, &self.primary).await {
            Err(err @ BackendError::PolicyRejected { .. }) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        primary = %self.primary.name,
                        fallback = %fallback.name,
                        error = %err,
                        "Policy rejection, retrying with fallback backend"
                    );
                    let detour = fallback.request(request.prompt());
                    self.call_with(&detour, fallback).await
                }
                None => Err(err),
            },
            other => other,
        }
    }

    async fn call_with(
        &self,
        request: &ChatRequest,
        config: &BackendConfig,
    ) -> Result<Completion, BackendError> {
        let mut state = RetryState::new();

        loop {
            self.limiter.acquire().await;
            let err = match self.backend.complete(request, config).await {
                Ok(text) => {
                    return Ok(Completion {
                        text,
                        model: config.name.clone(),
                    })
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if let Some(wait) = err.retry_after() {
                if !state.hint_spent {
                    state.hint_spent = true;
                    debug!(
                        backend = %config.name,
                        wait_ms = wait.as_millis() as u64,
                        "Backend asked to retry later"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }

            state.attempt += 1;
            if state.is_exhausted(&self.config) {
                return Err(BackendError::Exhausted {
                    attempts: state.attempt,
                    last: Box::new(err),
                });
            }

            let computed = state.calculate_delay(&self.config);
            let delay = err.retry_after().unwrap_or(computed);
            debug!(
                backend = %config.name,
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::testing::{Script, ScriptedBackend};
    use tokio::time::Instant;

    fn retrier(mock: MockBackend) -> Retrier {
        Retrier::new(
            Arc::new(mock),
            BackendConfig::new("primary", "gpt-3.5-turbo"),
            Arc::new(RateLimiter::unlimited()),
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::from_prompt("sys", "prompt", 1.0)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 2000);
        assert_eq!(config.backoff, BackoffStrategy::Constant);
        assert_eq!(config.jitter, JitterStrategy::None);
    }

    #[test]
    fn test_retry_config_from_json() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 3, "backoff": "exponential", "jitter": "full"}"#)
                .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 2000);
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_calculate_delay_strategies() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential);
        let mut state = RetryState::new();

        state.attempt = 1;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
        state.attempt = 3;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(400));

        let linear = config.clone().with_backoff(BackoffStrategy::Linear);
        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));

        let constant = config.with_backoff(BackoffStrategy::Constant);
        state.attempt = 9;
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_backoff(BackoffStrategy::Exponential);
        let mut state = RetryState::new();
        state.attempt = 10;

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_calculate_delay_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();
        state.attempt = 1;

        for _ in 0..10 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let mut mock = MockBackend::new();
        let mut calls = 0;
        mock.expect_complete().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(BackendError::transient("timeout"))
            } else {
                Ok("done".to_string())
            }
        });
        let start = Instant::now();

        let completion = retrier(mock).call(&request()).await.unwrap();

        assert_eq!(completion.text, "done");
        assert_eq!(completion.model, "primary");
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_attempts() {
        let mut mock = MockBackend::new();
        mock.expect_complete()
            .times(5)
            .returning(|_, _| Err(BackendError::transient("502")));

        let err = retrier(mock).call(&request()).await.unwrap_err();

        match err {
            BackendError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, BackendError::Transient { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let mut mock = MockBackend::new();
        mock.expect_complete()
            .times(1)
            .returning(|_, _| Err(BackendError::fatal("401 unauthorized")));

        let err = retrier(mock).call(&request()).await.unwrap_err();

        assert!(matches!(err, BackendError::Fatal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_uncounted() {
        let mut mock = MockBackend::new();
        let mut calls = 0;
        mock.expect_complete().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(BackendError::rate_limited(
                    Some(Duration::from_secs(30)),
                    "retry after 30 seconds",
                ))
            } else {
                Ok("ok".to_string())
            }
        });
        let retrier = retrier(mock).with_retry(RetryConfig::new().with_max_attempts(1));
        let start = Instant::now();

        let completion = retrier.call(&request()).await.unwrap();

        assert_eq!(completion.text, "ok");
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_hint_is_counted_and_still_waits_the_hint() {
        let backend = Arc::new(ScriptedBackend::new(Script::RateLimitTimes(
            2,
            Duration::from_secs(30),
        )));
        let retrier = Retrier::new(
            Arc::clone(&backend) as Arc<dyn Backend>,
            BackendConfig::new("primary", "m"),
            Arc::new(RateLimiter::unlimited()),
        )
        .with_retry(RetryConfig::new().with_max_attempts(2));
        let start = Instant::now();

        let completion = retrier.call(&request()).await.unwrap();

        assert_eq!(completion.text, "primary: prompt");
        assert_eq!(backend.call_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_hint_exhausts_single_attempt() {
        let backend = Arc::new(ScriptedBackend::new(Script::RateLimitTimes(
            2,
            Duration::from_secs(30),
        )));
        let retrier = Retrier::new(
            Arc::clone(&backend) as Arc<dyn Backend>,
            BackendConfig::new("primary", "m"),
            Arc::new(RateLimiter::unlimited()),
        )
        .with_retry(RetryConfig::new().with_max_attempts(1));
        let start = Instant::now();

        let err = retrier.call(&request()).await.unwrap_err();

        match err {
            BackendError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, BackendError::RateLimited { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(backend.call_count(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_rejection_detours_through_fallback() {
        let mut mock = MockBackend::new();
        mock.expect_complete()
            .withf(|_, config| config.name == "primary")
            .times(1)
            .returning(|_, _| Err(BackendError::policy_rejected("content_filter")));
        mock.expect_complete()
            .withf(|request, config| {
                config.name == "fallback"
                    && request.temperature.abs() < f32::EPSILON
                    && request.messages[0].content == "FALLBACK SYSTEM"
                    && request.prompt() == "prompt"
            })
            .times(1)
            .returning(|_, _| Ok("safe answer".to_string()));
        let fallback = BackendConfig::new("fallback", "gpt-4")
            .with_temperature(0.0)
            .with_system_prompt("FALLBACK SYSTEM");
        let retrier = retrier(mock).with_fallback(Some(fallback));

        let completion = retrier.call(&request()).await.unwrap();

        assert_eq!(completion.text, "safe answer");
        assert_eq!(completion.model, "fallback");
        assert_eq!(retrier.model_name(), "primary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_rejection_is_not_detoured_again() {
        let mut mock = MockBackend::new();
        mock.expect_complete()
            .times(2)
            .returning(|_, _| Err(BackendError::policy_rejected("content_filter")));
        let retrier = retrier(mock)
            .with_fallback(Some(BackendConfig::new("fallback", "gpt-4")));

        let err = retrier.call(&request()).await.unwrap_err();

        assert!(matches!(err, BackendError::PolicyRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_rejection_without_fallback() {
        let mut mock = MockBackend::new();
        mock.expect_complete()
            .times(1)
            .returning(|_, _| Err(BackendError::policy_rejected("content_filter")));

        let err = retrier(mock).call(&request()).await.unwrap_err();

        assert!(matches!(err, BackendError::PolicyRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_is_acquired_per_attempt() {
        let mut mock = MockBackend::new();
        let mut calls = 0;
        mock.expect_complete().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(BackendError::transient("reset"))
            } else {
                Ok("ok".to_string())
            }
        });
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let retrier = Retrier::new(
            Arc::new(mock),
            BackendConfig::new("primary", "m"),
            Arc::clone(&limiter),
        );

        retrier.call(&request()).await.unwrap();

        assert_eq!(limiter.in_window().await, 2);
    }
}
