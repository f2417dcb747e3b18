//! Bidirectional wire framing for the two upstream dialects.
//!
//! A [`Protocol`] value carries the full capability set for one dialect:
//! request headers, request body, non-streaming response parsing, and the
//! streaming chunk decode via [`SseDecoder`]. The decoder tolerates CRLF
//! and LF and buffers incomplete tail lines across reads, so multi-byte
//! characters split by the transport never corrupt a line.

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::warn;

use crate::types::{flatten_to_text, MessagesRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Anthropic,
}

/// One decoded unit of upstream stream output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub reasoning: Option<String>,
    pub done: bool,
}

/// A parsed non-streaming upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub text: String,
    pub reasoning: Option<String>,
}

impl Protocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "openai" => Some(Protocol::OpenAi),
            "anthropic" => Some(Protocol::Anthropic),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
        }
    }

    /// Chat endpoint under a configured base URL.
    pub fn chat_endpoint(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Protocol::OpenAi => format!("{base}/chat/completions"),
            Protocol::Anthropic => format!("{base}/messages"),
        }
    }

    pub fn build_headers(&self, api_key: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match self {
            Protocol::OpenAi => {
                if let Some(key) = api_key {
                    headers.insert("Authorization", format!("Bearer {key}").parse()?);
                }
            }
            Protocol::Anthropic => {
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
                if let Some(key) = api_key {
                    headers.insert("x-api-key", key.parse()?);
                }
            }
        }
        Ok(headers)
    }

    /// Frame the enriched request for this dialect. Absent optional fields
    /// are omitted entirely.
    pub fn build_request_body(
        &self,
        request: &MessagesRequest,
        upstream_model: &str,
        stream: bool,
    ) -> Value {
        match self {
            Protocol::OpenAi => self.build_openai_body(request, upstream_model, stream),
            Protocol::Anthropic => self.build_anthropic_body(request, upstream_model, stream),
        }
    }

    fn build_openai_body(
        &self,
        request: &MessagesRequest,
        upstream_model: &str,
        stream: bool,
    ) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system_text() {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            // Claude content blocks flatten to plain strings for chat
            // backends; non-text blocks are JSON-encoded.
            messages.push(json!({
                "role": message.role,
                "content": flatten_to_text(&message.content),
            }));
        }

        let mut body = json!({
            "model": upstream_model,
            "messages": messages,
            "stream": stream,
        });
        set_optional(&mut body, "max_tokens", request.max_tokens.map(Value::from));
        set_optional(
            &mut body,
            "temperature",
            request.temperature.map(|v| json!(v)),
        );
        set_optional(&mut body, "top_p", request.top_p.map(|v| json!(v)));
        body
    }

    fn build_anthropic_body(
        &self,
        request: &MessagesRequest,
        upstream_model: &str,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": upstream_model,
            "messages": request.messages,
            "stream": stream,
        });
        set_optional(
            &mut body,
            "system",
            request.system_text().map(Value::String),
        );
        set_optional(&mut body, "max_tokens", request.max_tokens.map(Value::from));
        set_optional(
            &mut body,
            "temperature",
            request.temperature.map(|v| json!(v)),
        );
        set_optional(&mut body, "top_p", request.top_p.map(|v| json!(v)));
        body
    }

    /// Extract assistant text (and native reasoning, when present) from a
    /// non-streaming upstream response body.
    pub fn parse_response(&self, body: &Value) -> Result<UpstreamMessage> {
        match self {
            Protocol::OpenAi => {
                let message = body
                    .get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|a| a.first())
                    .and_then(|c| c.get("message"))
                    .ok_or_else(|| anyhow::anyhow!("upstream response missing choices[0].message"))?;
                Ok(UpstreamMessage {
                    text: message
                        .get("content")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    reasoning: message
                        .get("reasoning_content")
                        .and_then(|r| r.as_str())
                        .map(str::to_string),
                })
            }
            Protocol::Anthropic => {
                let blocks = body
                    .get("content")
                    .and_then(|c| c.as_array())
                    .ok_or_else(|| anyhow::anyhow!("upstream response missing content array"))?;
                let mut text = String::new();
                let mut reasoning = String::new();
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            text.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or(""));
                        }
                        Some("thinking") => {
                            reasoning.push_str(
                                block.get("thinking").and_then(|t| t.as_str()).unwrap_or(""),
                            );
                        }
                        _ => {}
                    }
                }
                Ok(UpstreamMessage {
                    text,
                    reasoning: if reasoning.is_empty() {
                        None
                    } else {
                        Some(reasoning)
                    },
                })
            }
        }
    }
}

fn set_optional(body: &mut Value, key: &str, value: Option<Value>) {
    if let (Some(obj), Some(value)) = (body.as_object_mut(), value) {
        obj.insert(key.to_string(), value);
    }
}

/// Incremental decoder for an upstream SSE byte stream.
///
/// Bytes go in as they arrive; complete lines come out as [`StreamChunk`]s.
/// The Anthropic dialect pairs each `event:` line with the `data:` line
/// that follows it.
#[derive(Debug)]
pub struct SseDecoder {
    protocol: Protocol,
    buf: Vec<u8>,
    event_name: Option<String>,
}

impl SseDecoder {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            buf: Vec::new(),
            event_name: None,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buf.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(chunk) = self.decode_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamChunk> {
        if line.is_empty() {
            return None;
        }
        match self.protocol {
            Protocol::OpenAi => self.decode_openai_line(line),
            Protocol::Anthropic => self.decode_anthropic_line(line),
        }
    }

    fn decode_openai_line(&mut self, line: &str) -> Option<StreamChunk> {
        let data = line.strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            return Some(StreamChunk {
                done: true,
                ..Default::default()
            });
        }

        let parsed: Value = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "dropping malformed upstream SSE line");
                return None;
            }
        };
        let delta = parsed.get("choices")?.get(0)?.get("delta")?;
        let text = delta
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let reasoning = delta
            .get("reasoning_content")
            .and_then(|r| r.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if text.is_none() && reasoning.is_none() {
            return None;
        }
        Some(StreamChunk {
            text,
            reasoning,
            done: false,
        })
    }

    fn decode_anthropic_line(&mut self, line: &str) -> Option<StreamChunk> {
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
            return None;
        }

        let data = line.strip_prefix("data:")?.trim();
        let event = self.event_name.take()?;
        match event.as_str() {
            "content_block_delta" => {
                let parsed: Value = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed upstream SSE line");
                        return None;
                    }
                };
                let delta = parsed.get("delta")?;
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => Some(StreamChunk {
                        text: delta.get("text").and_then(|t| t.as_str()).map(str::to_string),
                        ..Default::default()
                    }),
                    Some("thinking_delta") => Some(StreamChunk {
                        reasoning: delta
                            .get("thinking")
                            .and_then(|t| t.as_str())
                            .map(str::to_string),
                        ..Default::default()
                    }),
                    _ => None,
                }
            }
            "message_stop" => Some(StreamChunk {
                done: true,
                ..Default::default()
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "m",
            "system": "sys",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [{"type": "text", "text": "hello"}]}
            ],
            "max_tokens": 256,
            "temperature": 0.5
        }))
        .unwrap()
    }

    #[test]
    fn test_openai_body_flattens_blocks() {
        let body = Protocol::OpenAi.build_request_body(&request(), "gpt-4o", true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "sys");
        assert_eq!(messages[2]["content"], "hello");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_anthropic_body_keeps_blocks() {
        let body = Protocol::Anthropic.build_request_body(&request(), "claude-x", false);
        assert_eq!(body["system"], "sys");
        assert!(body["messages"][1]["content"].is_array());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_headers() {
        let openai = Protocol::OpenAi.build_headers(Some("sk-test")).unwrap();
        assert_eq!(openai["Authorization"], "Bearer sk-test");

        let anthropic = Protocol::Anthropic.build_headers(Some("sk-test")).unwrap();
        assert_eq!(anthropic["x-api-key"], "sk-test");
        assert_eq!(anthropic["anthropic-version"], ANTHROPIC_VERSION);

        let bare = Protocol::OpenAi.build_headers(None).unwrap();
        assert!(bare.get("Authorization").is_none());
    }

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(
            Protocol::OpenAi.chat_endpoint("https://x.example/v1/"),
            "https://x.example/v1/chat/completions"
        );
        assert_eq!(
            Protocol::Anthropic.chat_endpoint("https://y.example/v1"),
            "https://y.example/v1/messages"
        );
    }

    #[test]
    fn test_openai_stream_decode() {
        let mut decoder = SseDecoder::new(Protocol::OpenAi);
        let chunks = decoder.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
              data: [DONE]\n",
        );
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].text.as_deref(), Some("lo"));
        assert!(chunks[2].done);
    }

    #[test]
    fn test_openai_reasoning_delta() {
        let mut decoder = SseDecoder::new(Protocol::OpenAi);
        let chunks =
            decoder.feed(b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm\"}}]}\n");
        assert_eq!(chunks[0].reasoning.as_deref(), Some("hmm"));
    }

    #[test]
    fn test_decoder_buffers_partial_lines() {
        let mut decoder = SseDecoder::new(Protocol::OpenAi);
        assert!(decoder
            .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"")
            .is_empty());
        let chunks = decoder.feed(b"}}]}\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text.as_deref(), Some("a"));
    }

    #[test]
    fn test_decoder_tolerates_crlf() {
        let mut decoder = SseDecoder::new(Protocol::Anthropic);
        let chunks = decoder.feed(
            b"event: content_block_delta\r\n\
              data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\r\n\r\n\
              event: message_stop\r\ndata: {}\r\n\r\n",
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text.as_deref(), Some("hi"));
        assert!(chunks[1].done);
    }

    #[test]
    fn test_malformed_json_line_is_dropped() {
        let mut decoder = SseDecoder::new(Protocol::OpenAi);
        let chunks = decoder.feed(b"data: {not json}\ndata: [DONE]\n");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
    }

    #[test]
    fn test_parse_openai_response() {
        let message = Protocol::OpenAi
            .parse_response(&json!({
                "choices": [{"message": {"content": "four", "reasoning_content": "2+2"}}]
            }))
            .unwrap();
        assert_eq!(message.text, "four");
        assert_eq!(message.reasoning.as_deref(), Some("2+2"));
    }

    #[test]
    fn test_parse_anthropic_response() {
        let message = Protocol::Anthropic
            .parse_response(&json!({
                "content": [
                    {"type": "thinking", "thinking": "weighing"},
                    {"type": "text", "text": "Answer: 4"}
                ]
            }))
            .unwrap();
        assert_eq!(message.text, "Answer: 4");
        assert_eq!(message.reasoning.as_deref(), Some("weighing"));
    }
}
