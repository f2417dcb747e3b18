//! Repair loop for malformed tool calls.
//!
//! When the stream ends in a `ToolCallFailed`, the upstream is shown its
//! own malformed output together with a correction instruction and asked
//! again, non-streamingly, up to a bounded number of attempts. The client
//! connection is kept alive with pings while the round-trips run. The
//! writer is only borrowed per call; a recovered call is injected as if
//! the upstream had produced it correctly, and exhaustion degrades the raw
//! failed text to plain text.

use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::parser::{ParserEvent, StreamParser};
use crate::types::{Message, MessagesRequest};
use crate::writer::ClaudeSseWriter;

pub const MAX_TOOL_RETRIES: usize = 3;
const BACKOFF_BASE_MS: u64 = 100;

const CORRECTION_TEMPLATE: &str = r#"Your tool invocation above was malformed and could not be parsed. Reply with a corrected invocation and nothing else, in exactly this format:

{trigger_signal}
<invoke name="$TOOL_NAME">
<parameter name="$PARAM_NAME">$PARAM_VALUE</parameter>
</invoke>

Print {trigger_signal} on its own line immediately before <invoke>, give every <parameter> a name attribute, and close the block with </invoke>."#;

/// Run the bounded repair loop. Returns true when a well-formed call was
/// recovered and written; false when the raw text was degraded instead.
pub async fn recover_tool_call(
    client: &reqwest::Client,
    ctx: &RequestContext,
    timeout_ms: u64,
    failed_content: &str,
    prior_text: &str,
    writer: &mut ClaudeSseWriter,
) -> Result<bool> {
    let delimiter = match &ctx.delimiter {
        Some(delimiter) => delimiter,
        None => {
            writer
                .handle_events(vec![ParserEvent::Text {
                    content: failed_content.to_string(),
                }])
                .await?;
            return Ok(false);
        }
    };

    let retry_request = build_retry_request(ctx, failed_content, prior_text);
    let protocol = ctx.upstream.protocol;
    let url = protocol.chat_endpoint(&ctx.upstream.base_url);
    let body = protocol.build_request_body(&retry_request, &ctx.upstream.upstream_model, false);

    for attempt in 1..=MAX_TOOL_RETRIES {
        writer.ping().await?;

        let headers = protocol.build_headers(ctx.upstream.api_key.as_deref())?;
        let response = client
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let parsed: Value = match resp.json().await {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(attempt, error = %err, "retry response unreadable");
                        backoff(attempt).await;
                        continue;
                    }
                };
                let message = match protocol.parse_response(&parsed) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(attempt, error = %err, "retry response unparseable");
                        backoff(attempt).await;
                        continue;
                    }
                };

                let mut parser = StreamParser::new(Some(delimiter));
                parser.feed_str(&message.text);
                parser.finish();
                let recovered = parser
                    .consume_events()
                    .into_iter()
                    .find(|e| matches!(e, ParserEvent::ToolCall { .. }));

                if let Some(tool_call) = recovered {
                    info!(attempt, "recovered malformed tool call");
                    writer.handle_events(vec![tool_call]).await?;
                    return Ok(true);
                }
                warn!(attempt, "retry response still malformed");
            }
            Ok(resp) => {
                warn!(attempt, status = %resp.status(), "retry attempt rejected upstream");
            }
            Err(err) => {
                warn!(attempt, error = %err, "retry attempt failed");
            }
        }
        backoff(attempt).await;
    }

    warn!("tool call retries exhausted, degrading to text");
    writer
        .handle_events(vec![ParserEvent::Text {
            content: failed_content.to_string(),
        }])
        .await?;
    Ok(false)
}

/// Original conversation + the assistant's malformed turn + a correction
/// instruction, as a non-streaming request.
fn build_retry_request(
    ctx: &RequestContext,
    failed_content: &str,
    prior_text: &str,
) -> MessagesRequest {
    let trigger = ctx
        .delimiter
        .as_ref()
        .map(|d| d.tc_start().to_string())
        .unwrap_or_default();

    let mut request = ctx.enriched.clone();
    request
        .messages
        .push(Message::assistant(format!("{prior_text}{failed_content}")));
    request.messages.push(Message::user(
        CORRECTION_TEMPLATE.replace("{trigger_signal}", &trigger),
    ));
    request.stream = Some(false);
    request
}

async fn backoff(attempt: usize) {
    let delay = BACKOFF_BASE_MS.saturating_mul(1 << (attempt - 1).min(6));
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn context() -> RequestContext {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "any",
            "messages": [{"role": "user", "content": "weather?"}],
            "tools": [{"name": "get_weather", "input_schema": {"properties": {}}}]
        }))
        .unwrap();
        RequestContext::build(&Config::for_upstream("https://up.example"), request, None).unwrap()
    }

    #[test]
    fn test_retry_request_shape() {
        let ctx = context();
        let request = build_retry_request(&ctx, "<<CALL_x>><invoke", "Checking.");

        let n = request.messages.len();
        assert_eq!(request.messages[n - 2].role, "assistant");
        assert_eq!(
            request.messages[n - 2].content,
            json!("Checking.<<CALL_x>><invoke")
        );
        assert_eq!(request.messages[n - 1].role, "user");
        let correction = request.messages[n - 1].content.as_str().unwrap();
        assert!(correction.contains(ctx.delimiter.as_ref().unwrap().tc_start()));
        assert!(!correction.contains("{trigger_signal}"));
        assert_eq!(request.stream, Some(false));
    }
}
