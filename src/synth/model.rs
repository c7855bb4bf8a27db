//! Language model backends.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ModelError;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    OpenAi,
    Anthropic,
}

impl ModelProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "gpt-4o-mini",
            ModelProvider::Anthropic => "claude-3-5-haiku-latest",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => OPENAI_BASE_URL,
            ModelProvider::Anthropic => ANTHROPIC_BASE_URL,
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "OPENAI_API_KEY",
            ModelProvider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

/// Resolved settings for an HTTP model backend.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub provider: ModelProvider,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

pub fn build_model(endpoint: ModelEndpoint) -> Result<Arc<dyn LanguageModel>, ModelError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ModelError::Transport(e.to_string()))?;
    Ok(match endpoint.provider {
        ModelProvider::OpenAi => Arc::new(OpenAiModel {
            client,
            base_url: endpoint.base_url,
            model: endpoint.model,
            api_key: endpoint.api_key,
        }),
        ModelProvider::Anthropic => Arc::new(AnthropicModel {
            client,
            base_url: endpoint.base_url,
            model: endpoint.model,
            api_key: endpoint.api_key,
        }),
    })
}

async fn send(builder: reqwest::RequestBuilder) -> Result<String, ModelError> {
    let response = builder
        .send()
        .await
        .map_err(|e| ModelError::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ModelError::Transport(e.to_string()))?;
    if status.as_u16() == 429 {
        return Err(ModelError::RateLimited);
    }
    if !status.is_success() {
        return Err(ModelError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        });
    }
    Ok(body)
}

/// Both providers nest the message under `error.message`.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

// OpenAI chat completions

pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_chat_response(body: &str) -> Result<String, ModelError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| ModelError::Decode(e.to_string()))?;
    Ok(response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            seed: request.seed,
        };
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        parse_chat_response(&send(builder).await?)
    }
}

// Anthropic messages

pub struct AnthropicModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

fn parse_messages_response(body: &str) -> Result<String, ModelError> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| ModelError::Decode(e.to_string()))?;
    Ok(response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join(""))
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let body = MessagesRequest {
            model: &self.model,
            system: &request.system,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.user,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut builder = self
            .client
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        parse_messages_response(&send(builder).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"```sql\nSELECT 1\n```"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_chat_response(body).unwrap(), "```sql\nSELECT 1\n```");

        let body = r#"{"choices":[]}"#;
        assert_eq!(parse_chat_response(body).unwrap(), "");

        assert!(matches!(parse_chat_response("<html>"), Err(ModelError::Decode(_))));
    }

    #[test]
    fn test_parse_messages_response() {
        let body = r#"{"id":"m","type":"message","content":[{"type":"text","text":"MATCH (n) "},{"type":"text","text":"RETURN n"}],"stop_reason":"end_turn"}"#;
        assert_eq!(parse_messages_response(body).unwrap(), "MATCH (n) RETURN n");
    }

    #[test]
    fn test_api_error_message() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(api_error_message(body), "Incorrect API key provided");
        assert_eq!(api_error_message("bad gateway"), "bad gateway");
    }

    #[test]
    fn test_chat_request_omits_missing_seed() {
        let body = ChatRequest {
            model: "m",
            messages: vec![],
            temperature: 0.0,
            max_tokens: 10,
            seed: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("seed").is_none());
    }

    #[test]
    fn test_provider_serde() {
        let provider: ModelProvider = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(provider, ModelProvider::Anthropic);
        assert_eq!(ModelProvider::default(), ModelProvider::OpenAi);
        assert_eq!(serde_json::to_string(&ModelProvider::OpenAi).unwrap(), "\"openai\"");
    }
}
