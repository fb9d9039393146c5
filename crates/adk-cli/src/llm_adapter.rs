//! A small Anthropic Messages API client implementing `adk_core::interfaces::
//! LLMProvider`, built fresh in the same style as `embedding_adapter.rs`
//! rather than reused from a teacher crate: a `reqwest::Client`, a header
//! map, a JSON body, and status-then-parse error handling. `adk-core` only
//! needs `generate_content` (the default `stream_content` forwards to it as
//! a single chunk), so this ports only the non-streaming request/response
//! path — no SSE parsing, no tool-definition wire format, since the core's
//! planning prompts ask the model for a JSON plan body rather than native
//! tool use.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use adk_core::error::{AdkError, Result};
use adk_core::interfaces::{ChatMessage, GenerationRequest, GenerationResponse, LLMProvider};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicLlmProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl AnthropicLlmProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(AdkError::Llm("anthropic provider is missing an API key".to_string()));
        }

        let mut headers = HeaderMap::new();
        let mut key_header = HeaderValue::from_str(&api_key)
            .map_err(|e| AdkError::Llm(format!("invalid API key header: {e}")))?;
        key_header.set_sensitive(true);
        headers.insert("x-api-key", key_header);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .default_headers(headers)
            .build()
            .map_err(|e| AdkError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, base_url: ANTHROPIC_BASE_URL.to_string(), model: model.into() })
    }

    /// Anthropic expects the system prompt as a top-level field and only
    /// `user`/`assistant` roles in `messages`; fold anything tagged
    /// `"system"` into the single top-level field instead.
    fn build_request_body(&self, request: &GenerationRequest) -> Value {
        let mut system = request.system_instruction.clone();
        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len());
        for m in &request.messages {
            if m.role == "system" {
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&m.content);
                    }
                    None => system = Some(m.content.clone()),
                }
                continue;
            }
            let role = if m.role == "assistant" { "assistant" } else { "user" };
            messages.push(json!({ "role": role, "content": m.content }));
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn parse_response(&self, v: &Value) -> Result<GenerationResponse> {
        let content = v["content"]
            .as_array()
            .ok_or_else(|| AdkError::Llm("missing `content` array in response".to_string()))?;

        let mut text = String::new();
        for block in content {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    return Err(AdkError::Llm(
                        "model returned native tool calls; the core's planning prompts ask for a JSON plan body instead".to_string(),
                    ));
                }
                _ => {}
            }
        }

        let prompt_tokens = v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
        Ok(GenerationResponse { text, prompt_tokens, completion_tokens })
    }
}

#[async_trait]
impl LLMProvider for AnthropicLlmProvider {
    async fn generate_content(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let body = self.build_request_body(&request);
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdkError::Llm(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AdkError::Llm(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(AdkError::Llm(format!("API returned {status}: {text}")));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| AdkError::Llm(format!("invalid JSON response: {e}")))?;
        self.parse_response(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_api_key() {
        let err = AnthropicLlmProvider::new("", "claude-haiku-4").unwrap_err();
        assert_eq!(err.kind(), "ERR_LLM");
    }

    #[test]
    fn build_request_body_folds_system_messages_into_top_level_field() {
        let provider = AnthropicLlmProvider::new("test-key", "claude-sonnet-4-5").unwrap();
        let request = GenerationRequest {
            system_instruction: Some("You are helpful.".to_string()),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: "Extra context.".to_string() },
                ChatMessage { role: "user".to_string(), content: "Hello".to_string() },
            ],
            temperature: Some(0.2),
            max_tokens: Some(512),
            tools: None,
        };

        let body = provider.build_request_body(&request);
        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["system"], "You are helpful.\nExtra context.");
        assert_eq!(body["max_tokens"], 512);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Hello");
    }

    #[test]
    fn parse_response_extracts_text_and_usage() {
        let provider = AnthropicLlmProvider::new("test-key", "claude-sonnet-4-5").unwrap();
        let response_json = json!({
            "content": [{"type": "text", "text": "Hello, world!"}],
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let response = provider.parse_response(&response_json).unwrap();
        assert_eq!(response.text, "Hello, world!");
        assert_eq!(response.prompt_tokens, 10);
        assert_eq!(response.completion_tokens, 5);
    }

    #[test]
    fn parse_response_rejects_native_tool_use() {
        let provider = AnthropicLlmProvider::new("test-key", "claude-sonnet-4-5").unwrap();
        let response_json = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "x", "input": {}}],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        });
        assert!(provider.parse_response(&response_json).is_err());
    }
}
