//! Upstream resolution from a client-visible model string.
//!
//! Resolution order: named channel (`channel+model`), then numbered
//! multi-config matched by model name, then the legacy single upstream.

use crate::config::Config;
use crate::error::ProxyError;
use crate::protocol::Protocol;

/// Everything the forwarder needs to talk to one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub upstream_model: String,
    pub protocol: Protocol,
}

pub fn resolve(
    model: &str,
    config: &Config,
    client_key: Option<&str>,
) -> Result<UpstreamConfig, ProxyError> {
    let mut resolved = resolve_inner(model, config)?;

    if config.passthrough_api_key {
        if let Some(key) = client_key {
            resolved.api_key = Some(key.to_string());
        }
    }

    Ok(resolved)
}

fn resolve_inner(model: &str, config: &Config) -> Result<UpstreamConfig, ProxyError> {
    if let Some((channel_name, rest)) = model.split_once('+') {
        if let Some(channel) = config.channels.iter().find(|c| c.name == channel_name) {
            return Ok(UpstreamConfig {
                base_url: channel.base_url.clone(),
                api_key: channel.api_key.clone(),
                upstream_model: rest.to_string(),
                protocol: channel.protocol,
            });
        }
    }

    if let Some(entry) = config.numbered.iter().find(|u| u.name_model == model) {
        return Ok(UpstreamConfig {
            base_url: entry.base_url.clone(),
            api_key: entry.api_key.clone(),
            upstream_model: entry.request_model.clone(),
            protocol: Protocol::OpenAi,
        });
    }

    if let Some(legacy) = &config.legacy {
        return Ok(UpstreamConfig {
            base_url: legacy.base_url.clone(),
            api_key: legacy.api_key.clone(),
            upstream_model: legacy
                .model_override
                .clone()
                .unwrap_or_else(|| model.to_string()),
            protocol: Protocol::OpenAi,
        });
    }

    Err(ProxyError::Config(format!(
        "no upstream configured for model '{model}'"
    )))
}
