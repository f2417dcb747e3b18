//! Per-request context.
//!
//! Built once at entry from the resolver and the prompt injector, then
//! carried immutably through the pipeline and dropped with the response.

use crate::config::Config;
use crate::error::ProxyError;
use crate::inject;
use crate::resolve::{self, UpstreamConfig};
use crate::tokens;
use crate::trigger::{random_alnum, TriggerDelimiter};
use crate::types::{flatten_to_text, MessagesRequest};

#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub upstream: UpstreamConfig,
    pub original: MessagesRequest,
    pub enriched: MessagesRequest,
    /// Present iff the original request carries tools.
    pub delimiter: Option<TriggerDelimiter>,
}

impl RequestContext {
    pub fn build(
        config: &Config,
        request: MessagesRequest,
        client_key: Option<&str>,
    ) -> Result<Self, ProxyError> {
        let upstream = resolve::resolve(&request.model, config, client_key)?;
        let (enriched, delimiter) = inject::enrich(&request);

        Ok(Self {
            request_id: random_alnum(12),
            upstream,
            original: request,
            enriched,
            delimiter,
        })
    }

    /// The enriched conversation as role-labeled plain text. The labels and
    /// separators are part of the counting contract; changing them changes
    /// reported input tokens.
    pub fn prompt_text(&self) -> String {
        prompt_text(&self.enriched)
    }

    pub fn input_tokens(&self) -> usize {
        tokens::count(&self.prompt_text(), &self.original.model)
    }
}

/// Role-labeled flattening of an (enriched) request.
pub fn prompt_text(request: &MessagesRequest) -> String {
    let mut sections = Vec::new();
    if let Some(system) = request.system_text() {
        sections.push(format!("System: {system}"));
    }
    for message in &request.messages {
        let label = match message.role.as_str() {
            "assistant" => "Assistant",
            _ => "User",
        };
        sections.push(format!("{label}: {}", flatten_to_text(&message.content)));
    }
    sections.join("\n\n")
}
