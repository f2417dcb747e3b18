//! Character-fed stream parser.
//!
//! Splits the upstream assistant stream into text, thinking, and tool-call
//! events by watching for `<thinking>` spans and, when a delimiter is
//! configured, the per-request trigger signal followed by an `<invoke>`
//! block. Multi-character markers are matched through a rolling window so a
//! marker split across arbitrarily small feeds is still recognized, and a
//! partially-matched prefix is withheld from text until refuted.

use serde_json::{Map, Value};

use crate::trigger::{
    TriggerDelimiter, INVOKE_CLOSE, INVOKE_OPEN, PARAM_CLOSE, PARAM_OPEN, THINKING_CLOSE,
    THINKING_OPEN,
};

/// `<parameter>` with no name attribute; structurally malformed.
const PARAM_BARE: &str = "<parameter>";

#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        name: String,
        arguments: Map<String, Value>,
    },
    /// A trigger was seen but the invocation block never parsed. `content`
    /// is the raw consumed text from the trigger onward; `prior_text` is
    /// everything already emitted as text before the trigger.
    ToolCallFailed {
        content: String,
        prior_text: String,
    },
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Normal,
    Thinking,
    /// After a matched trigger: skip whitespace, then expect `<invoke name="`.
    ToolWaitInvoke,
    ToolName,
    /// Closing quote of the name seen; expect `>`.
    ToolNameQuote,
    ToolBody,
    ToolParamName,
    ToolParamQuote,
    ToolParamValue,
    /// `</invoke>` consumed; the rest of the stream is ignored.
    ToolDone,
    /// Structure violated; consume raw text until EOF.
    ToolFailed,
}

#[derive(Debug)]
pub struct StreamParser {
    tc_start: Option<String>,
    state: State,
    window: String,
    expect_pos: usize,
    events: Vec<ParserEvent>,
    prior_text: String,
    raw_tool: String,
    tool_name: String,
    param_name: String,
    params: Map<String, Value>,
    finished: bool,
}

impl StreamParser {
    pub fn new(delimiter: Option<&TriggerDelimiter>) -> Self {
        Self {
            tc_start: delimiter.map(|d| d.tc_start().to_string()),
            state: State::Normal,
            window: String::new(),
            expect_pos: 0,
            events: Vec::new(),
            prior_text: String::new(),
            raw_tool: String::new(),
            tool_name: String::new(),
            param_name: String::new(),
            params: Map::new(),
            finished: false,
        }
    }

    pub fn feed_str(&mut self, s: &str) {
        for c in s.chars() {
            self.feed_char(c);
        }
    }

    pub fn feed_char(&mut self, c: char) {
        if self.finished {
            return;
        }
        if matches!(
            self.state,
            State::ToolWaitInvoke
                | State::ToolName
                | State::ToolNameQuote
                | State::ToolBody
                | State::ToolParamName
                | State::ToolParamQuote
                | State::ToolParamValue
                | State::ToolFailed
        ) {
            self.raw_tool.push(c);
        }

        match self.state {
            State::Normal => self.feed_normal(c),
            State::Thinking => self.feed_thinking(c),
            State::ToolWaitInvoke => self.feed_wait_invoke(c),
            State::ToolName => {
                if c == '"' {
                    self.state = State::ToolNameQuote;
                } else {
                    self.tool_name.push(c);
                }
            }
            State::ToolNameQuote => {
                if c == '>' && !self.tool_name.is_empty() {
                    self.window.clear();
                    self.state = State::ToolBody;
                } else {
                    self.state = State::ToolFailed;
                }
            }
            State::ToolBody => self.feed_tool_body(c),
            State::ToolParamName => {
                if c == '"' {
                    self.state = State::ToolParamQuote;
                } else {
                    self.param_name.push(c);
                }
            }
            State::ToolParamQuote => {
                if c == '>' && !self.param_name.is_empty() {
                    self.window.clear();
                    self.state = State::ToolParamValue;
                } else {
                    self.state = State::ToolFailed;
                }
            }
            State::ToolParamValue => self.feed_param_value(c),
            State::ToolDone | State::ToolFailed => {}
        }
    }

    /// Append an upstream-native reasoning delta verbatim.
    pub fn feed_reasoning(&mut self, s: &str) {
        if !self.finished {
            self.emit_thinking(s);
        }
    }

    /// Signal EOF. Unterminated tool territory becomes a failure event;
    /// pending window content is flushed as text or thinking.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        match self.state {
            State::Normal => {
                let tail = std::mem::take(&mut self.window);
                self.emit_text(&tail);
            }
            State::Thinking => {
                let tail = std::mem::take(&mut self.window);
                self.emit_thinking(&tail);
            }
            State::ToolDone => {}
            _ => {
                let content = std::mem::take(&mut self.raw_tool);
                let prior_text = self.prior_text.clone();
                self.events.push(ParserEvent::ToolCallFailed {
                    content,
                    prior_text,
                });
            }
        }
        self.events.push(ParserEvent::End);
    }

    /// Drain the events completed so far, in arrival order.
    pub fn consume_events(&mut self) -> Vec<ParserEvent> {
        std::mem::take(&mut self.events)
    }

    fn feed_normal(&mut self, c: char) {
        self.window.push(c);

        if self.window.ends_with(THINKING_OPEN) {
            let prefix_len = self.window.len() - THINKING_OPEN.len();
            let prefix = self.window[..prefix_len].to_string();
            self.emit_text(&prefix);
            self.window.clear();
            self.state = State::Thinking;
            return;
        }

        if let Some(tc_len) = self
            .tc_start
            .as_deref()
            .filter(|tc| self.window.ends_with(tc))
            .map(str::len)
        {
            // A partially-matched trigger prefix is dropped, not emitted.
            let prefix_len = self.window.len() - tc_len;
            let prefix = self.window[..prefix_len].to_string();
            self.emit_text(&prefix);
            self.window.clear();
            self.raw_tool = self.tc_start.clone().unwrap_or_default();
            self.expect_pos = 0;
            self.state = State::ToolWaitInvoke;
            return;
        }

        let keep = {
            let mut markers = vec![THINKING_OPEN];
            if let Some(tc) = self.tc_start.as_deref() {
                markers.push(tc);
            }
            pending_prefix_len(&self.window, &markers)
        };
        if keep < self.window.len() {
            let spill_len = self.window.len() - keep;
            let spill: String = self.window.drain(..spill_len).collect();
            self.emit_text(&spill);
        }
    }

    fn feed_thinking(&mut self, c: char) {
        self.window.push(c);

        if self.window.ends_with(THINKING_CLOSE) {
            let content_len = self.window.len() - THINKING_CLOSE.len();
            let content = self.window[..content_len].to_string();
            self.emit_thinking(&content);
            self.window.clear();
            self.state = State::Normal;
            return;
        }

        let keep = pending_prefix_len(&self.window, &[THINKING_CLOSE]);
        if keep < self.window.len() {
            let spill_len = self.window.len() - keep;
            let spill: String = self.window.drain(..spill_len).collect();
            self.emit_thinking(&spill);
        }
    }

    fn feed_wait_invoke(&mut self, c: char) {
        if self.expect_pos == 0 && c.is_whitespace() {
            return;
        }
        let expected = INVOKE_OPEN.as_bytes()[self.expect_pos] as char;
        if c == expected {
            self.expect_pos += 1;
            if self.expect_pos == INVOKE_OPEN.len() {
                self.tool_name.clear();
                self.state = State::ToolName;
            }
        } else {
            self.state = State::ToolFailed;
        }
    }

    fn feed_tool_body(&mut self, c: char) {
        self.window.push(c);

        if self.window.ends_with(PARAM_OPEN) {
            self.window.clear();
            self.param_name.clear();
            self.state = State::ToolParamName;
            return;
        }
        if self.window.ends_with(PARAM_BARE) {
            self.state = State::ToolFailed;
            return;
        }
        if self.window.ends_with(INVOKE_CLOSE) {
            let name = std::mem::take(&mut self.tool_name);
            let arguments = std::mem::take(&mut self.params);
            self.events.push(ParserEvent::ToolCall { name, arguments });
            self.window.clear();
            self.state = State::ToolDone;
            return;
        }

        // Content between parameters carries no meaning; retain only what
        // could still become a marker.
        let keep = pending_prefix_len(&self.window, &[PARAM_OPEN, PARAM_BARE, INVOKE_CLOSE]);
        let spill_len = self.window.len() - keep;
        if spill_len > 0 {
            self.window.drain(..spill_len);
        }
    }

    fn feed_param_value(&mut self, c: char) {
        self.window.push(c);

        if self.window.ends_with(PARAM_CLOSE) {
            let value_len = self.window.len() - PARAM_CLOSE.len();
            let raw = self.window[..value_len].to_string();
            let name = std::mem::take(&mut self.param_name);
            self.params.insert(name, parse_param_value(&raw));
            self.window.clear();
            self.state = State::ToolBody;
        }
    }

    fn emit_text(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        self.prior_text.push_str(content);
        if let Some(ParserEvent::Text { content: last }) = self.events.last_mut() {
            last.push_str(content);
        } else {
            self.events.push(ParserEvent::Text {
                content: content.to_string(),
            });
        }
    }

    fn emit_thinking(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        if let Some(ParserEvent::Thinking { content: last }) = self.events.last_mut() {
            last.push_str(content);
        } else {
            self.events.push(ParserEvent::Thinking {
                content: content.to_string(),
            });
        }
    }
}

/// Parameter values are JSON when they parse as JSON, verbatim otherwise.
fn parse_param_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Length in bytes of the longest window suffix that is a proper prefix of
/// one of `markers`. Markers are ASCII, so a matching suffix always falls
/// on a char boundary.
fn pending_prefix_len(window: &str, markers: &[&str]) -> usize {
    let mut best = 0;
    for marker in markers {
        let max = (marker.len() - 1).min(window.len());
        for l in (best + 1..=max).rev() {
            if window.as_bytes()[window.len() - l..] == marker.as_bytes()[..l] {
                best = l;
                break;
            }
        }
    }
    best
}
