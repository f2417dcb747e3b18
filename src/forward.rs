//! End-to-end request forwarding.
//!
//! Composes enrichment, upstream dispatch, the incremental parser, the SSE
//! writer, and the retry controller into the streaming and non-streaming
//! flows. The upstream body is consumed as it arrives and never fully
//! buffered; when the client disconnects, the writer's channel closes and
//! the in-flight upstream request is dropped with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::ProxyError;
use crate::parser::{ParserEvent, StreamParser};
use crate::protocol::SseDecoder;
use crate::redact;
use crate::retry;
use crate::tokens;
use crate::trigger::random_alnum;
use crate::types::ContentBlock;
use crate::writer::{ClaudeSseWriter, SseFrame};

const ERROR_SNIPPET_LEN: usize = 200;

/// Open the SSE response and spawn the pump that fills it.
pub async fn forward_streaming(
    client: reqwest::Client,
    config: Arc<Config>,
    ctx: RequestContext,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<SseFrame>(100);

    tokio::spawn(async move {
        let mut writer = ClaudeSseWriter::new(
            tx,
            &ctx.request_id,
            config.aggregation_interval_ms,
            config.token_multiplier,
        );
        if let Err(err) = pump_upstream(&client, &config, &ctx, &mut writer).await {
            // Send failures mean the client went away; everything else was
            // already reported as an error frame.
            debug!(request_id = %ctx.request_id, error = %err, "stream closed early");
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn pump_upstream(
    client: &reqwest::Client,
    config: &Config,
    ctx: &RequestContext,
    writer: &mut ClaudeSseWriter,
) -> Result<()> {
    writer.init(ctx.input_tokens() as u64).await?;

    let protocol = ctx.upstream.protocol;
    let url = protocol.chat_endpoint(&ctx.upstream.base_url);
    let body = protocol.build_request_body(&ctx.enriched, &ctx.upstream.upstream_model, true);
    debug!(
        url = %url,
        payload = %redact::redact_value(&body),
        "dispatching streaming upstream request"
    );

    let headers = match protocol.build_headers(ctx.upstream.api_key.as_deref()) {
        Ok(headers) => headers,
        Err(err) => {
            warn!(error = %err, "upstream credentials are not header-safe");
            writer.error("api_error", "upstream configuration invalid").await?;
            return Ok(());
        }
    };

    let response = client
        .post(&url)
        .headers(headers)
        .json(&body)
        .timeout(Duration::from_millis(config.timeout_ms))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            writer
                .error(
                    "timeout_error",
                    &format!("upstream timed out after {}ms", config.timeout_ms),
                )
                .await?;
            return Ok(());
        }
        Err(err) => {
            warn!(error = %err, "upstream request failed");
            writer.error("api_error", "upstream request failed").await?;
            return Ok(());
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let snippet = snippet(&response.text().await.unwrap_or_default());
        warn!(%status, snippet, "upstream rejected request");
        writer
            .error("api_error", &format!("upstream returned {status}"))
            .await?;
        return Ok(());
    }

    let mut decoder = SseDecoder::new(protocol);
    let mut parser = StreamParser::new(ctx.delimiter.as_ref());
    let mut stream = response.bytes_stream();
    let mut upstream_done = false;

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "upstream read failed mid-stream");
                writer.error("api_error", "upstream read failed").await?;
                return Ok(());
            }
        };
        for piece in decoder.feed(&bytes) {
            if let Some(text) = piece.text {
                parser.feed_str(&text);
            }
            if let Some(reasoning) = piece.reasoning {
                parser.feed_reasoning(&reasoning);
            }
            if piece.done {
                upstream_done = true;
            }
        }
        writer.handle_events(parser.consume_events()).await?;
        if upstream_done {
            break;
        }
    }

    parser.finish();
    let mut failed = None;
    let mut remaining = Vec::new();
    for event in parser.consume_events() {
        match event {
            ParserEvent::ToolCallFailed {
                content,
                prior_text,
            } => failed = Some((content, prior_text)),
            ParserEvent::End => {}
            other => remaining.push(other),
        }
    }
    writer.handle_events(remaining).await?;

    if let Some((content, prior_text)) = failed {
        retry::recover_tool_call(client, ctx, config.timeout_ms, &content, &prior_text, writer)
            .await?;
    }
    writer.handle_events(vec![ParserEvent::End]).await
}

/// Single round-trip flow: POST upstream, parse, reassemble an Anthropic
/// message body. Malformed tool territory degrades to text here; the SSE
/// repair loop only applies to streaming responses.
pub async fn forward_non_streaming(
    client: &reqwest::Client,
    config: &Config,
    ctx: &RequestContext,
) -> Result<Value, ProxyError> {
    let input_tokens = ctx.input_tokens() as u64;
    let protocol = ctx.upstream.protocol;
    let url = protocol.chat_endpoint(&ctx.upstream.base_url);
    let body = protocol.build_request_body(&ctx.enriched, &ctx.upstream.upstream_model, false);
    debug!(
        url = %url,
        payload = %redact::redact_value(&body),
        "dispatching upstream request"
    );

    let headers = protocol
        .build_headers(ctx.upstream.api_key.as_deref())
        .map_err(|_| ProxyError::Config("upstream configuration invalid".to_string()))?;

    let response = client
        .post(&url)
        .headers(headers)
        .json(&body)
        .timeout(Duration::from_millis(config.timeout_ms))
        .send()
        .await
        .map_err(|err| {
            if err.is_timeout() {
                ProxyError::Timeout(config.timeout_ms)
            } else {
                ProxyError::UpstreamRead(err.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body_snippet = snippet(&response.text().await.unwrap_or_default());
        return Err(ProxyError::UpstreamHttp {
            status: status.as_u16(),
            body_snippet,
        });
    }

    let parsed: Value = response
        .json()
        .await
        .map_err(|err| ProxyError::UpstreamRead(err.to_string()))?;
    let message = protocol
        .parse_response(&parsed)
        .map_err(|err| ProxyError::UpstreamRead(err.to_string()))?;

    let mut blocks: Vec<ContentBlock> = Vec::new();
    if let Some(reasoning) = message.reasoning {
        blocks.push(ContentBlock::Thinking {
            thinking: reasoning,
            signature: String::new(),
        });
    }

    let mut parser = StreamParser::new(ctx.delimiter.as_ref());
    parser.feed_str(&message.text);
    parser.finish();
    for event in parser.consume_events() {
        match event {
            ParserEvent::Text { content } => blocks.push(ContentBlock::Text { text: content }),
            ParserEvent::Thinking { content } => blocks.push(ContentBlock::Thinking {
                thinking: content,
                signature: String::new(),
            }),
            ParserEvent::ToolCall { name, arguments } => blocks.push(ContentBlock::ToolUse {
                id: format!("toolu_{}", random_alnum(12)),
                name,
                input: Value::Object(arguments),
            }),
            ParserEvent::ToolCallFailed { content, .. } => {
                warn!("malformed tool call in non-streaming response, degrading to text");
                blocks.push(ContentBlock::Text { text: content });
            }
            ParserEvent::End => {}
        }
    }

    let has_tool_use = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let stop_reason = if has_tool_use { "tool_use" } else { "end_turn" };

    Ok(json!({
        "id": format!("msg_{}", ctx.request_id),
        "type": "message",
        "role": "assistant",
        "model": ctx.original.model,
        "content": blocks,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens(&blocks, config.token_multiplier),
        }
    }))
}

fn output_tokens(blocks: &[ContentBlock], multiplier: f64) -> u64 {
    let multiplier = if multiplier.is_finite() && multiplier > 0.0 {
        multiplier
    } else {
        1.0
    };
    let mut accumulated = 0u64;
    for block in blocks {
        let text = match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Thinking { thinking, .. } => thinking.clone(),
            ContentBlock::ToolUse { input, .. } => input.to_string(),
        };
        accumulated += tokens::count(&text, "cl100k_base") as u64;
    }
    ((accumulated as f64 * multiplier).ceil() as u64).max(1)
}

fn snippet(body: &str) -> String {
    let mut snippet: String = body.chars().take(ERROR_SNIPPET_LEN).collect();
    if body.chars().count() > ERROR_SNIPPET_LEN {
        snippet.push('…');
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_truncates() {
        let long = "x".repeat(500);
        let s = snippet(&long);
        assert!(s.chars().count() <= ERROR_SNIPPET_LEN + 1);
        assert!(s.ends_with('…'));
        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn test_output_tokens_floor_is_one() {
        assert_eq!(output_tokens(&[], 1.0), 1);
    }

    #[test]
    fn test_output_tokens_multiplier() {
        let blocks = vec![ContentBlock::Text {
            text: "several words of visible output".to_string(),
        }];
        let base = output_tokens(&blocks, 1.0);
        assert_eq!(output_tokens(&blocks, 2.0), base * 2);
        // Bad multipliers behave as 1.0.
        assert_eq!(output_tokens(&blocks, f64::NAN), base);
        assert_eq!(output_tokens(&blocks, 0.0), base);
    }
}
