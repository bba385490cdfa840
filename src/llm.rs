use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Tool definition offered to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String, // JSON string
}

impl ToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
            .map_err(|e| ResolveError::Llm(format!("Invalid arguments for {}: {}", self.name, e)))
    }
}

/// Message in chat format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: "assistant".to_string(), content, tool_calls, tool_call_id: None }
    }

    pub fn tool_result(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NlRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Structured model reply: free text and/or tool calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NlResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl NlResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_calls: Vec::new() }
    }

    pub fn tool(call: ToolCall) -> Self {
        Self { text: None, tool_calls: vec![call] }
    }
}

/// Natural-language provider
#[async_trait]
pub trait NlProvider: Send + Sync {
    async fn complete(&self, request: &NlRequest) -> Result<NlResponse>;
}

/// Client for OpenAI-compatible chat completion endpoints
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
    backoff_base: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }

    pub fn with_backoff(mut self, max_retries: u32, base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = base;
        self
    }

    fn build_body(&self, request: &NlRequest) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({ "role": m.role });

                if let Some(ref content) = m.content {
                    msg["content"] = serde_json::json!(content);
                }

                if !m.tool_calls.is_empty() {
                    msg["tool_calls"] = serde_json::Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|c| {
                                serde_json::json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": { "name": c.name, "arguments": c.arguments },
                                })
                            })
                            .collect(),
                    );
                }

                if let Some(ref id) = m.tool_call_id {
                    msg["tool_call_id"] = serde_json::json!(id);
                }

                msg
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "temperature": 0.1,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = serde_json::json!("auto");
        }

        // Set token limits
        if self.model.starts_with("gpt-5") || self.model.contains("o1") || self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else {
            body["max_tokens"] = serde_json::json!(2000);
        }

        body
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.backoff_base.as_millis().max(1) as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

#[async_trait]
impl NlProvider for OpenAiClient {
    async fn complete(&self, request: &NlRequest) -> Result<NlResponse> {
        let body = self.build_body(request);

        let mut attempt = 0;
        let response_json: serde_json::Value = loop {
            let response = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ResolveError::Llm(format!("LLM API call failed: {}", e)))?;

            let status = response.status();
            let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < self.max_retries {
                let delay = self.backoff_delay(attempt);
                warn!("LLM API returned {}, retrying in {:?}", status, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ResolveError::Llm(format!("LLM API error ({}): {}", status, error_text)));
            }

            break response
                .json()
                .await
                .map_err(|e| ResolveError::Llm(format!("Failed to parse LLM response: {}", e)))?;
        };

        parse_completion(&response_json)
    }
}

/// Extract text and tool calls from a chat completion payload.
pub fn parse_completion(response_json: &serde_json::Value) -> Result<NlResponse> {
    if let Some(error) = response_json.get("error") {
        return Err(ResolveError::Llm(format!("LLM API error: {}", error)));
    }

    let message = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .map(|c| &c["message"])
        .ok_or_else(|| ResolveError::Llm("No choices in LLM response".to_string()))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .map(|c| c.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for (idx, call) in calls.iter().enumerate() {
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| ResolveError::Llm("No function name in tool call".to_string()))?
                .to_string();
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}").to_string();
            let id = call["id"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("call_{}", idx));
            tool_calls.push(ToolCall { id, name, arguments });
        }
    }

    debug!("LLM replied with {} tool calls", tool_calls.len());
    Ok(NlResponse { text, tool_calls })
}
