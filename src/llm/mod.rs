//! LLM integration for matforge.
//!
//! Provides the chat-completion client used by the extraction stage and the
//! supervisor's intent classification. The client targets any
//! OpenAI-compatible endpoint (a local Ollama server works out of the box);
//! everything behind the [`LanguageModel`] trait so tests and alternative
//! providers can swap in.

pub mod extraction;

use async_trait::async_trait;
use reqwest::Client;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub use extraction::{DocumentExtractor, LlmExtractor, RawExtraction};

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for text generation from an LLM.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Model identifier to use for generation.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Create a new generation request with default parameters.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the temperature for this request.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the max tokens for this request.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics reported by the endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens produced in the completion.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens billed.
    #[serde(default)]
    pub total_tokens: u32,
}

/// A single generated choice from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// The generated message.
    pub message: Message,
}

/// Response from an LLM generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Identifier assigned by the endpoint, when present.
    #[serde(default)]
    pub id: String,
    /// Model that generated this response.
    #[serde(default)]
    pub model: String,
    /// Generated choices/completions.
    pub choices: Vec<Choice>,
    /// Token usage statistics.
    #[serde(default)]
    pub usage: Usage,
}

impl GenerationResponse {
    /// Get the content of the first choice, if available.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// Provider of chat completions.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generates a completion for the request.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Default request timeout for chat completions.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP client for OpenAI-compatible chat-completion endpoints.
pub struct ChatClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
}

impl ChatClient {
    /// Creates a client for the given API base URL.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Creates a client from `MATFORGE_API_BASE` / `MATFORGE_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if the base URL is not set.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("MATFORGE_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("MATFORGE_API_KEY").ok();
        Ok(Self::new(api_base, api_key))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let mut builder = self.client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        if parsed.choices.is_empty() {
            return Err(LlmError::EmptyCompletion);
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, "system");
        assert_eq!(Message::user("u").role, "user");
        assert_eq!(Message::assistant("a").role, "assistant");
    }

    #[test]
    fn test_generation_request_builder() {
        let request = GenerationRequest::new("gpt-4o-mini", vec![Message::user("hi")])
            .with_temperature(0.1)
            .with_max_tokens(256);
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.temperature, Some(0.1));
        assert_eq!(request.max_tokens, Some(256));
    }

    #[test]
    fn test_request_serialization_skips_unset_fields() {
        let request = GenerationRequest::new("m", vec![Message::user("hi")]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
    }

    #[test]
    fn test_response_first_content() {
        let response = GenerationResponse {
            id: String::new(),
            model: "m".to_string(),
            choices: vec![Choice {
                message: Message::assistant("answer"),
            }],
            usage: Usage::default(),
        };
        assert_eq!(response.first_content(), Some("answer"));
    }

    #[test]
    fn test_response_deserializes_without_usage() {
        // Local endpoints frequently omit id/usage fields.
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#;
        let response: GenerationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.first_content(), Some("ok"));
        assert_eq!(response.usage.total_tokens, 0);
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = ChatClient::new("http://localhost:11434/v1/", None);
        assert_eq!(
            client.completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }
}
