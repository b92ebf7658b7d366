//! OpenAI-compatible chat-completions client.

use super::{Backend, BackendConfig, BackendKind, ChatRequest};
use crate::errors::BackendError;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;

static RETRY_AFTER_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry after (\d+) seconds?").expect("retry hint pattern is valid")
});

/// Chat-completions backend over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    /// Creates a backend with a fresh connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend sharing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Builds the endpoint URL for a configuration.
#[must_use]
pub(crate) fn endpoint(config: &BackendConfig) -> String {
    let base = config.base_url.trim_end_matches('/');
    match config.kind {
        BackendKind::OpenAi => format!("{base}/chat/completions"),
        BackendKind::Azure => format!(
            "{base}/openai/deployments/{}/chat/completions?api-version={}",
            config.model,
            config.api_version.as_deref().unwrap_or("2023-05-15")
        ),
    }
}

fn body(request: &ChatRequest, config: &BackendConfig) -> Value {
    let mut body = json!({
        "messages": request.messages,
        "temperature": request.temperature,
    });
    if config.kind == BackendKind::OpenAi {
        body["model"] = json!(config.model);
    }
    if let Some(max_tokens) = config.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

/// Maps a failed HTTP response to a backend error.
pub(crate) fn classify_failure(
    status: u16,
    retry_after_header: Option<&str>,
    text: &str,
) -> BackendError {
    if is_content_filter(text) {
        return BackendError::policy_rejected(text);
    }
    match status {
        429 => {
            let hint = retry_after_header
                .and_then(|value| value.trim().parse::<u64>().ok())
                .or_else(|| {
                    RETRY_AFTER_HINT
                        .captures(text)
                        .and_then(|caps| caps[1].parse::<u64>().ok())
                })
                .map(Duration::from_secs);
            BackendError::rate_limited(hint, text)
        }
        500..=599 | 408 => BackendError::transient(format!("HTTP {status}: {text}")),
        _ => BackendError::fatal(format!("HTTP {status}: {text}")),
    }
}

fn is_content_filter(text: &str) -> bool {
    text.contains("content_filter") || text.contains("content management policy")
}

/// Extracts the generated text from a successful response body.
pub(crate) fn extract_content(response: &Value) -> Result<String, BackendError> {
    let choice = response
        .pointer("/choices/0")
        .ok_or_else(|| BackendError::transient("response has no choices"))?;
    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(BackendError::policy_rejected(
            "completion stopped by content filter",
        ));
    }
    choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::transient("response missing message content"))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn complete(
        &self,
        request: &ChatRequest,
        config: &BackendConfig,
    ) -> Result<String, BackendError> {
        let key = config.api_key.as_deref().ok_or_else(|| {
            BackendError::fatal(format!("no API key in ${}", config.api_key_env))
        })?;

        let builder = self.client.post(endpoint(config)).json(&body(request, config));
        let builder = match config.kind {
            BackendKind::OpenAi => builder.bearer_auth(key),
            BackendKind::Azure => builder.header("api-key", key),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(
                status.as_u16(),
                retry_after.as_deref(),
                &text,
            ));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| BackendError::transient(e.to_string()))?;
        extract_content(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Role;

    #[test]
    fn test_endpoints() {
        let openai = BackendConfig::new("chatgpt", "gpt-3.5-turbo")
            .with_base_url("https://api.openai.com/v1/");
        assert_eq!(
            endpoint(&openai),
            "https://api.openai.com/v1/chat/completions"
        );

        let mut azure = BackendConfig::new("gpt4", "gpt4-deploy")
            .with_kind(BackendKind::Azure)
            .with_base_url("https://example.openai.azure.com");
        azure.api_version = Some("2024-02-01".to_string());
        assert_eq!(
            endpoint(&azure),
            "https://example.openai.azure.com/openai/deployments/gpt4-deploy/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn test_body_includes_model_for_openai_only() {
        let request = ChatRequest::from_prompt("sys", "hi", 0.5);
        let openai = body(&request, &BackendConfig::new("a", "gpt-4"));
        assert_eq!(openai["model"], "gpt-4");
        assert_eq!(openai["messages"][1]["role"], json!(Role::User));

        let azure = body(
            &request,
            &BackendConfig::new("a", "gpt-4").with_kind(BackendKind::Azure),
        );
        assert!(azure.get("model").is_none());
    }

    #[test]
    fn test_rate_limit_hint_from_header() {
        let err = classify_failure(429, Some("7"), "slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_rate_limit_hint_from_message() {
        let err = classify_failure(
            429,
            None,
            "Requests to the deployment have exceeded the limit. Please retry after 22 seconds.",
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(22)));

        let err = classify_failure(429, None, "Too many requests");
        assert!(matches!(err, BackendError::RateLimited { retry_after: None, .. }));
    }

    #[test]
    fn test_failure_classes() {
        assert!(matches!(
            classify_failure(400, None, r#"{"error": {"code": "content_filter"}}"#),
            BackendError::PolicyRejected { .. }
        ));
        assert!(matches!(
            classify_failure(503, None, "unavailable"),
            BackendError::Transient { .. }
        ));
        assert!(matches!(
            classify_failure(401, None, "bad key"),
            BackendError::Fatal { .. }
        ));
    }

    #[test]
    fn test_extract_content() {
        let ok = json!({"choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]});
        assert_eq!(extract_content(&ok).unwrap(), "hello");

        let filtered = json!({"choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]});
        assert!(matches!(
            extract_content(&filtered),
            Err(BackendError::PolicyRejected { .. })
        ));

        assert!(matches!(
            extract_content(&json!({})),
            Err(BackendError::Transient { .. })
        ));
    }
}
