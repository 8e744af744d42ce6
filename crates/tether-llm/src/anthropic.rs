//! Anthropic Messages API adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{Value, json};

use crate::errors::{ConfigurationError, SDKError};
use crate::provider::ProviderAdapter;
use crate::types::{ContentPart, Message, Request, Response, Role, Usage};

pub const ANTHROPIC_PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4_096;

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct AnthropicAdapter {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Result<Self, SDKError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| SDKError::Configuration(ConfigurationError::new(error.to_string())))?;
        Ok(Self { config, http })
    }

    /// Builds an adapter from `ANTHROPIC_API_KEY` and optional `ANTHROPIC_BASE_URL`.
    pub fn from_env() -> Result<Self, SDKError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            SDKError::Configuration(ConfigurationError::new("ANTHROPIC_API_KEY is not set"))
        })?;
        let mut config = AnthropicConfig::new(api_key);
        if let Ok(base_url) = std::env::var("ANTHROPIC_BASE_URL") {
            config.base_url = base_url;
        }
        Self::new(config)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        ANTHROPIC_PROVIDER
    }

    async fn complete(&self, request: Request) -> Result<Response, SDKError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let body = build_request_body(&request);
        let response = self
            .http
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    SDKError::Timeout(self.config.timeout)
                } else {
                    SDKError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|error| SDKError::Transport(error.to_string()))?;

        if !status.is_success() {
            return Err(map_error_status(status, &text, retry_after));
        }

        let raw: Value = serde_json::from_str(&text)
            .map_err(|error| SDKError::InvalidResponse(error.to_string()))?;
        parse_response(&raw)
    }
}

pub(crate) fn build_request_body(request: &Request) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(system) = &request.system {
        body["system"] = Value::String(system.clone());
    }
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.parameters,
                        })
                    })
                    .collect(),
            );
        }
    }
    body
}

fn message_to_wire(message: &Message) -> Value {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let content: Vec<Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
            ContentPart::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect();
    json!({ "role": role, "content": content })
}

pub(crate) fn parse_response(raw: &Value) -> Result<Response, SDKError> {
    let blocks = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| SDKError::InvalidResponse("missing content array".to_string()))?;

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => content.push(ContentPart::Text {
                text: block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str);
                let name = block.get("name").and_then(Value::as_str);
                let (Some(id), Some(name)) = (id, name) else {
                    return Err(SDKError::InvalidResponse(
                        "tool_use block without id or name".to_string(),
                    ));
                };
                content.push(ContentPart::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            other => {
                tracing::debug!(block_type = ?other, "ignoring unsupported content block");
            }
        }
    }

    let usage = raw.get("usage");
    Ok(Response {
        id: string_field(raw, "id"),
        model: string_field(raw, "model"),
        provider: ANTHROPIC_PROVIDER.to_string(),
        message: Message {
            role: Role::Assistant,
            content,
        },
        stop_reason: raw
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: Usage {
            input_tokens: usage
                .and_then(|usage| usage.get("input_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .and_then(|usage| usage.get("output_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        },
    })
}

fn string_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

/// 429 and 529 (overloaded) are rate limits; everything else is a provider error.
pub(crate) fn map_error_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> SDKError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529 {
        return SDKError::RateLimit {
            provider: ANTHROPIC_PROVIDER.to_string(),
            message,
            retry_after,
        };
    }
    SDKError::Provider {
        provider: ANTHROPIC_PROVIDER.to_string(),
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolDefinition, ToolResult};

    #[test]
    fn request_body_carries_system_tools_and_tool_results() {
        let mut request = Request::new(
            "claude-sonnet",
            vec![
                Message::user("fix the build"),
                Message::tool_results(vec![ToolResult {
                    tool_call_id: "toolu_1".to_string(),
                    content: "ok".to_string(),
                    is_error: false,
                }]),
            ],
        );
        request.system = Some("be careful".to_string());
        request.tools = Some(vec![ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            parameters: json!({ "type": "object" }),
        }]);

        let body = build_request_body(&request);
        assert_eq!(body["system"], "be careful");
        assert_eq!(body["max_tokens"], 4_096);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_result");
        assert_eq!(body["messages"][1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn request_without_tools_omits_tool_field() {
        let body = build_request_body(&Request::new("m", vec![Message::user("plan")]));
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
    }

    #[test]
    fn response_parsing_preserves_block_order() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-sonnet",
            "stop_reason": "tool_use",
            "content": [
                { "type": "text", "text": "Reading." },
                { "type": "tool_use", "id": "toolu_1", "name": "read_file", "input": { "path": "/w/a" } }
            ],
            "usage": { "input_tokens": 12, "output_tokens": 7 }
        });
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.text(), "Reading.");
        assert_eq!(response.tool_calls()[0].id, "toolu_1");
        assert_eq!(response.usage.output_tokens, 7);
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn too_many_requests_maps_to_rate_limit() {
        let error = map_error_status(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"slow down"}}"#,
            Some(Duration::from_secs(3)),
        );
        assert!(error.is_rate_limit());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));

        let overloaded = map_error_status(StatusCode::from_u16(529).unwrap(), "overloaded", None);
        assert!(overloaded.is_rate_limit());

        let bad = map_error_status(StatusCode::BAD_REQUEST, "nope", None);
        assert!(matches!(bad, SDKError::Provider { status: 400, .. }));
    }
}
