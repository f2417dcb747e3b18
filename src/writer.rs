//! Anthropic SSE stream writer.
//!
//! Owns the outgoing event stream for one response and enforces the
//! block-index discipline: every `content_block_start` takes the next
//! index, deltas and stops reuse the index of the block they belong to,
//! and indices are never reused. Text is aggregated and flushed on a time
//! interval; thinking and tool-input payloads stream in small paced chunks.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::parser::ParserEvent;
use crate::tokens;
use crate::trigger::random_alnum;

pub type SseFrame = std::result::Result<Bytes, std::io::Error>;
pub type SseSender = mpsc::Sender<SseFrame>;

const RESPONSE_MODEL: &str = "claude-proxy";
/// Output accounting always counts with this encoder.
const COUNT_MODEL: &str = "cl100k_base";
const CHUNK_CHARS: usize = 5;
const CHUNK_PACING: Duration = Duration::from_millis(10);

pub struct ClaudeSseWriter {
    tx: SseSender,
    message_id: String,
    next_block_index: usize,
    text_index: Option<usize>,
    thinking_index: Option<usize>,
    has_tool_calls: bool,
    finished: bool,
    pending_text: String,
    last_flush: Instant,
    aggregation_interval: Duration,
    accumulated_tokens: u64,
    token_multiplier: f64,
}

impl ClaudeSseWriter {
    pub fn new(
        tx: SseSender,
        request_id: &str,
        aggregation_interval_ms: u64,
        token_multiplier: f64,
    ) -> Self {
        let token_multiplier = if token_multiplier.is_finite() && token_multiplier > 0.0 {
            token_multiplier
        } else {
            1.0
        };
        Self {
            tx,
            message_id: format!("msg_{request_id}"),
            next_block_index: 0,
            text_index: None,
            thinking_index: None,
            has_tool_calls: false,
            finished: false,
            pending_text: String::new(),
            last_flush: Instant::now(),
            aggregation_interval: Duration::from_millis(aggregation_interval_ms),
            accumulated_tokens: 0,
            token_multiplier,
        }
    }

    /// Emit `message_start` followed by the initial ping.
    pub async fn init(&mut self, input_tokens: u64) -> Result<()> {
        self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": RESPONSE_MODEL,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0}
                }
            }),
        )
        .await?;
        self.ping().await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.emit("ping", json!({"type": "ping"})).await
    }

    /// Emit an error frame. Messages must already be non-sensitive.
    pub async fn error(&mut self, error_type: &str, message: &str) -> Result<()> {
        self.emit(
            "error",
            json!({"type": "error", "error": {"type": error_type, "message": message}}),
        )
        .await
    }

    pub async fn handle_events(&mut self, events: Vec<ParserEvent>) -> Result<()> {
        for event in events {
            if self.finished {
                break;
            }
            match event {
                ParserEvent::Text { content } => {
                    if self.thinking_index.is_some() {
                        self.close_thinking_block().await?;
                    }
                    self.pending_text.push_str(&content);
                    self.flush_text(false).await?;
                }
                ParserEvent::Thinking { content } => {
                    self.flush_text(true).await?;
                    self.close_text_block().await?;
                    self.write_thinking(&content).await?;
                }
                ParserEvent::ToolCall { name, arguments } => {
                    self.flush_text(true).await?;
                    self.close_text_block().await?;
                    self.close_thinking_block().await?;
                    self.write_tool_use(&name, arguments).await?;
                }
                ParserEvent::ToolCallFailed { .. } => {
                    // The retry controller owns this path; nothing to emit
                    // from here.
                }
                ParserEvent::End => self.finish_message().await?,
            }
        }
        Ok(())
    }

    /// Output tokens with the multiplier applied, as reported at finish.
    pub fn total_output_tokens(&self) -> u64 {
        let scaled = (self.accumulated_tokens as f64 * self.token_multiplier).ceil();
        (scaled as u64).max(1)
    }

    pub fn has_tool_calls(&self) -> bool {
        self.has_tool_calls
    }

    async fn flush_text(&mut self, force: bool) -> Result<()> {
        if self.pending_text.is_empty() {
            return Ok(());
        }
        if !force && self.last_flush.elapsed() < self.aggregation_interval {
            return Ok(());
        }

        if self.text_index.is_none() {
            let index = self.open_block();
            self.text_index = Some(index);
            self.emit(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""}
                }),
            )
            .await?;
        }

        let text = std::mem::take(&mut self.pending_text);
        let index = self.text_index.unwrap_or(0);
        self.accumulated_tokens += tokens::count(&text, COUNT_MODEL) as u64;
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text}
            }),
        )
        .await?;
        self.last_flush = Instant::now();
        Ok(())
    }

    async fn write_thinking(&mut self, content: &str) -> Result<()> {
        if self.thinking_index.is_none() {
            let index = self.open_block();
            self.thinking_index = Some(index);
            self.emit(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "thinking", "thinking": "", "signature": ""}
                }),
            )
            .await?;
        }

        let index = self.thinking_index.unwrap_or(0);
        let chunks = char_chunks(content, CHUNK_CHARS);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.accumulated_tokens += tokens::count(&chunk, COUNT_MODEL) as u64;
            self.emit(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "thinking_delta", "thinking": chunk}
                }),
            )
            .await?;
            if i < last {
                tokio::time::sleep(CHUNK_PACING).await;
            }
        }
        Ok(())
    }

    async fn write_tool_use(&mut self, name: &str, arguments: Map<String, Value>) -> Result<()> {
        let index = self.open_block();
        let tool_id = format!("toolu_{}", random_alnum(12));
        self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "tool_use", "id": tool_id, "name": name, "input": {}}
            }),
        )
        .await?;

        let payload = Value::Object(arguments).to_string();
        self.accumulated_tokens += tokens::count(&payload, COUNT_MODEL) as u64;
        let chunks = char_chunks(&payload, CHUNK_CHARS);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.emit(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "input_json_delta", "partial_json": chunk}
                }),
            )
            .await?;
            if i < last {
                tokio::time::sleep(CHUNK_PACING).await;
            }
        }

        self.emit(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        )
        .await?;
        self.has_tool_calls = true;
        Ok(())
    }

    async fn finish_message(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_text(true).await?;
        self.close_thinking_block().await?;
        self.close_text_block().await?;

        let stop_reason = if self.has_tool_calls {
            "tool_use"
        } else {
            "end_turn"
        };
        self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": self.total_output_tokens()}
            }),
        )
        .await?;
        self.emit("message_stop", json!({"type": "message_stop"})).await?;
        self.finished = true;
        Ok(())
    }

    async fn close_text_block(&mut self) -> Result<()> {
        if let Some(index) = self.text_index.take() {
            self.emit(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            )
            .await?;
        }
        Ok(())
    }

    async fn close_thinking_block(&mut self) -> Result<()> {
        if let Some(index) = self.thinking_index.take() {
            self.emit(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "signature_delta", "signature": ""}
                }),
            )
            .await?;
            self.emit(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            )
            .await?;
        }
        Ok(())
    }

    fn open_block(&mut self) -> usize {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    async fn emit(&mut self, event: &str, data: Value) -> Result<()> {
        let frame = format!("event: {event}\ndata: {data}\n\n");
        self.tx
            .send(Ok(Bytes::from(frame)))
            .await
            .map_err(|_| anyhow!("client disconnected"))
    }
}

/// Split on char boundaries into chunks of at most `size` chars.
fn char_chunks(s: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in s.chars() {
        current.push(c);
        count += 1;
        if count >= size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
