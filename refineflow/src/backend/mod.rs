//! The text-generation backend boundary.
//!
//! A [`Backend`] turns a role-tagged message list into generated text. The
//! [`BackendConfig`] is an immutable value passed with every call, so a
//! fallback is just a different configuration for one call.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpBackend;

use crate::errors::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default system message sent ahead of every prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You should adhere to the instruction of the user.";

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// The prompt.
    User,
    /// A previous model reply.
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who is speaking.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Messages in order.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f32,
}

impl ChatRequest {
    /// Builds a system-plus-user request.
    #[must_use]
    pub fn from_prompt(system: &str, prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            messages: vec![
                ChatMessage::new(Role::System, system),
                ChatMessage::new(Role::User, prompt),
            ],
            temperature,
        }
    }

    /// Text of the last user message.
    #[must_use]
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str())
    }
}

/// Wire dialect of a backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI-style `/chat/completions` with bearer auth.
    #[default]
    OpenAi,
    /// Azure OpenAI deployments with an `api-key` header.
    Azure,
}

/// Immutable configuration for one backend endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Name recorded as `model` on output entries.
    pub name: String,
    /// Endpoint dialect.
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL of the endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model or deployment name.
    pub model: String,
    /// API version query parameter (Azure only).
    #[serde(default)]
    pub api_version: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// System message sent ahead of the prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Upper bound on generated tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Resolved API key, never serialized.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl BackendConfig {
    /// Creates a configuration with defaults for everything but the names.
    #[must_use]
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BackendKind::default(),
            base_url: default_base_url(),
            model: model.into(),
            api_version: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
            max_tokens: None,
            api_key: None,
        }
    }

    /// Sets the endpoint dialect.
    #[must_use]
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the system message.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Sets the API key directly.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Reads the API key from `api_key_env` unless one is already set.
    pub fn resolve_api_key(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var(&self.api_key_env).ok();
        }
    }

    /// Builds the request for a rendered prompt.
    #[must_use]
    pub fn request(&self, prompt: impl Into<String>) -> ChatRequest {
        ChatRequest::from_prompt(&self.system_prompt, prompt, self.temperature)
    }
}

/// Produces text for a chat request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Completes a request against the endpoint described by `config`.
    async fn complete(
        &self,
        request: &ChatRequest,
        config: &BackendConfig,
    ) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults_from_json() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"name": "chatgpt", "model": "gpt-3.5-turbo"}"#).unwrap();

        assert_eq!(config.kind, BackendKind::OpenAi);
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let config = BackendConfig::new("gpt4", "gpt-4").with_api_key("sk-secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    fn test_request_carries_system_and_prompt() {
        let config = BackendConfig::new("chatgpt", "gpt-3.5-turbo").with_temperature(0.2);
        let request = config.request("Critique this.");

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.prompt(), "Critique this.");
        assert_eq!(request.temperature, 0.2);
    }

    #[test]
    fn test_azure_kind_parses() {
        let config: BackendConfig = serde_json::from_str(
            r#"{"name": "gpt4", "kind": "azure", "model": "gpt4-deploy", "api_version": "2023-05-15"}"#,
        )
        .unwrap();
        assert_eq!(config.kind, BackendKind::Azure);
        assert_eq!(config.api_version.as_deref(), Some("2023-05-15"));
    }
}
