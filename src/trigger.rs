//! Per-request trigger signal and the fixed tool-call markup markers.
//!
//! The trigger signal is a fresh opaque marker the upstream is instructed to
//! print immediately before an `<invoke>` block. A new one is drawn per
//! request so catalog XML echoed by the upstream can never misfire as a
//! tool call.

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const INVOKE_OPEN: &str = "<invoke name=\"";
pub const INVOKE_CLOSE: &str = "</invoke>";
pub const PARAM_OPEN: &str = "<parameter name=\"";
pub const PARAM_CLOSE: &str = "</parameter>";
pub const THINKING_OPEN: &str = "<thinking>";
pub const THINKING_CLOSE: &str = "</thinking>";

/// The marker bundle shared by the prompt injector and the stream parser
/// within a single request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDelimiter {
    tc_start: String,
}

impl TriggerDelimiter {
    /// Draw a fresh `<<CALL_xxxx>>` trigger. Case-sensitive, no whitespace.
    pub fn generate() -> Self {
        Self {
            tc_start: format!("<<CALL_{}>>", random_alnum(4)),
        }
    }

    /// Build a delimiter around a known trigger string (tests, retry).
    pub fn from_trigger(tc_start: impl Into<String>) -> Self {
        Self {
            tc_start: tc_start.into(),
        }
    }

    pub fn tc_start(&self) -> &str {
        &self.tc_start
    }
}

/// Random alphanumeric string from the thread-local generator.
pub fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
