//! Language model abstraction and an OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::ModelSettings;
use crate::errors::ModelError;

/// A tool call requested by the model. `arguments` is the decoded JSON
/// object, or the raw string when the model sent invalid JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Wire representation for the chat completions API.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::System { content } => json!({"role": "system", "content": content}),
            Self::User { content } => json!({"role": "user", "content": content}),
            Self::Assistant {
                content,
                tool_calls,
            } => {
                let mut msg = json!({"role": "assistant", "content": content});
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": c.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    msg["tool_calls"] = Value::Array(calls);
                }
                msg
            }
            Self::Tool {
                tool_call_id,
                name,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "name": name,
                "content": content,
            }),
        }
    }
}

/// Tool metadata advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// One assistant response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, ModelError>;
}

/// Client for any endpoint speaking the OpenAI chat completions protocol.
#[derive(Clone)]
pub struct ChatCompletionsModel {
    client: reqwest::Client,
    settings: ModelSettings,
}

impl ChatCompletionsModel {
    pub fn new(settings: ModelSettings) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self { client, settings })
    }

    fn payload(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
        let mut payload = json!({
            "model": self.settings.model,
            "messages": messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
            "temperature": self.settings.temperature,
        });
        if let Some(obj) = payload.as_object_mut() {
            if let Some(limit) = self.settings.max_tokens {
                obj.insert("max_tokens".to_string(), Value::from(limit));
            }
            if !tools.is_empty() {
                obj.insert(
                    "tools".to_string(),
                    Value::Array(tools.iter().map(ToolDefinition::to_wire).collect()),
                );
                obj.insert("tool_choice".to_string(), Value::from("auto"));
            }
        }
        payload
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, ModelError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(ModelError::MissingApiKey)?;
        let url = format!(
            "{}/chat/completions",
            self.settings.api_base.trim_end_matches('/')
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&self.payload(messages, tools))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(ModelError::Status { status, body });
        }

        let value: Value = response.json().await?;
        parse_chat_response(&value)
    }
}

/// Extract the first choice's text and tool calls.
pub fn parse_chat_response(value: &Value) -> Result<ModelResponse, ModelError> {
    let message = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ModelError::Malformed("missing choices[0].message".to_string()))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for (index, call) in calls.iter().enumerate() {
            let function = call
                .get("function")
                .ok_or_else(|| ModelError::Malformed("tool call without function".to_string()))?;
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| ModelError::Malformed("tool call without name".to_string()))?
                .to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(other) => other.clone(),
                None => json!({}),
            };
            let id = call
                .get("id")
                .and_then(|i| i.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", index));
            tool_calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }
    }

    Ok(ModelResponse { text, tool_calls })
}
