//! Anthropic Messages API wire model.
//!
//! These types mirror the subset of the Messages API the proxy accepts and
//! produces. Message content is kept as raw [`serde_json::Value`] where the
//! API allows both strings and block arrays; the protocol adapter flattens
//! it per upstream dialect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An incoming `/v1/messages` request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,

    /// System prompt: a string or an array of text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

impl MessagesRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Flatten the system field to plain text (string or text-block array).
    pub fn system_text(&self) -> Option<String> {
        let system = self.system.as_ref()?;
        let text = flatten_to_text(system);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// A single conversation turn. Content can be a string or a block array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Value,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Value::String(content.into()),
        }
    }
}

/// A tool definition in Anthropic format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// The `thinking` request toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

/// A content block in an assembled (non-streaming) response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String, signature: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Token usage reported on responses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Flatten a string-or-block-array value into plain text. Non-text blocks
/// are JSON-encoded so nothing silently disappears.
pub fn flatten_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                    Some(_) => parts.push(block.to_string()),
                    None => {
                        if let Some(text) = block.as_str() {
                            parts.push(text.to_string());
                        } else {
                            parts.push(block.to_string());
                        }
                    }
                }
            }
            parts.join("\n\n")
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_request() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "openai+gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(request.model, "openai+gpt-4o");
        assert!(!request.is_streaming());
        assert!(!request.has_tools());
    }

    #[test]
    fn test_system_text_from_blocks() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [],
            "system": [
                {"type": "text", "text": "Policy A"},
                {"type": "text", "text": "Policy B"}
            ]
        }))
        .unwrap();

        assert_eq!(request.system_text().unwrap(), "Policy A\n\nPolicy B");
    }

    #[test]
    fn test_flatten_encodes_non_text_blocks() {
        let content = json!([
            {"type": "text", "text": "result below"},
            {"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"}
        ]);

        let flat = flatten_to_text(&content);
        assert!(flat.starts_with("result below\n\n"));
        assert!(flat.contains("\"tool_use_id\":\"toolu_1\""));
    }

    #[test]
    fn test_content_block_serialization() {
        let block = ContentBlock::ToolUse {
            id: "toolu_abc".to_string(),
            name: "get_weather".to_string(),
            input: json!({"city": "SF"}),
        };
        let encoded = serde_json::to_value(&block).unwrap();
        assert_eq!(encoded["type"], "tool_use");
        assert_eq!(encoded["input"]["city"], "SF");
    }
}
