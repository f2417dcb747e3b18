//! Environment-driven configuration.
//!
//! All settings come from process environment variables. Numbered tables
//! (`UPSTREAM_CONFIG_{n}_*`, `CHANNEL_{n}_*`) are scanned from 1 upward
//! until the first gap.

use std::collections::HashMap;

use crate::error::ProxyError;
use crate::protocol::Protocol;

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_AGGREGATION_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub auto_port: bool,

    /// Optional shared secret the client must present.
    pub client_api_key: Option<String>,
    /// When true, a client-presented key overrides the resolved upstream key.
    pub passthrough_api_key: bool,

    pub timeout_ms: u64,
    pub aggregation_interval_ms: u64,
    pub max_requests_per_minute: Option<u32>,
    pub token_multiplier: f64,

    pub legacy: Option<LegacyUpstream>,
    pub numbered: Vec<NumberedUpstream>,
    pub channels: Vec<Channel>,
}

/// The single-upstream fallback (`UPSTREAM_BASE_URL` et al).
#[derive(Debug, Clone)]
pub struct LegacyUpstream {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_override: Option<String>,
}

/// A numbered `UPSTREAM_CONFIG_{n}` entry matched by client model name.
#[derive(Debug, Clone)]
pub struct NumberedUpstream {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model name sent upstream.
    pub request_model: String,
    /// Client-visible model name this entry matches.
    pub name_model: String,
}

/// A named `CHANNEL_{n}` entry selected via the `channel+model` syntax.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub protocol: Protocol,
}

impl Config {
    pub fn from_env() -> Result<Self, ProxyError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ProxyError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ProxyError::Config(format!("PORT is not a valid port: {raw}")))?,
            None => DEFAULT_PORT,
        };

        let timeout_ms = match get("TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ProxyError::Config(format!("TIMEOUT_MS is not a number: {raw}")))?,
            None => DEFAULT_TIMEOUT_MS,
        };

        let aggregation_interval_ms = match get("AGGREGATION_INTERVAL_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                ProxyError::Config(format!("AGGREGATION_INTERVAL_MS is not a number: {raw}"))
            })?,
            None => DEFAULT_AGGREGATION_INTERVAL_MS,
        };

        let max_requests_per_minute = match get("MAX_REQUESTS_PER_MINUTE") {
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                ProxyError::Config(format!("MAX_REQUESTS_PER_MINUTE is not a number: {raw}"))
            })?),
            None => None,
        };

        let legacy = get("UPSTREAM_BASE_URL").map(|base_url| LegacyUpstream {
            base_url: base_url.to_string(),
            api_key: get("UPSTREAM_API_KEY").map(str::to_string),
            model_override: get("UPSTREAM_MODEL").map(str::to_string),
        });

        let numbered = scan_numbered(&get)?;
        let channels = scan_channels(&get)?;

        Ok(Config {
            host: get("HOST").unwrap_or(DEFAULT_HOST).to_string(),
            port,
            auto_port: parse_bool(get("AUTO_PORT")),
            client_api_key: get("CLIENT_API_KEY").map(str::to_string),
            passthrough_api_key: parse_bool(get("PASSTHROUGH_API_KEY")),
            timeout_ms,
            aggregation_interval_ms,
            max_requests_per_minute,
            token_multiplier: parse_token_multiplier(get("TOKEN_MULTIPLIER")),
            legacy,
            numbered,
            channels,
        })
    }

    /// Minimal config pointing at a single legacy upstream; used by tests.
    pub fn for_upstream(base_url: &str) -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            auto_port: false,
            client_api_key: None,
            passthrough_api_key: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            aggregation_interval_ms: 0,
            max_requests_per_minute: None,
            token_multiplier: 1.0,
            legacy: Some(LegacyUpstream {
                base_url: base_url.to_string(),
                api_key: None,
                model_override: None,
            }),
            numbered: Vec::new(),
            channels: Vec::new(),
        }
    }
}

fn scan_numbered<'a>(
    get: &impl Fn(&str) -> Option<&'a str>,
) -> Result<Vec<NumberedUpstream>, ProxyError> {
    let mut entries = Vec::new();
    for i in 1.. {
        let base_url = match get(&format!("UPSTREAM_CONFIG_{i}_BASE_URL")) {
            Some(url) => url.to_string(),
            None => break,
        };
        let name_model = get(&format!("UPSTREAM_CONFIG_{i}_NAME_MODEL"))
            .ok_or_else(|| {
                ProxyError::Config(format!("UPSTREAM_CONFIG_{i}_NAME_MODEL is required"))
            })?
            .to_string();
        let request_model = get(&format!("UPSTREAM_CONFIG_{i}_REQUEST_MODEL"))
            .map(str::to_string)
            .unwrap_or_else(|| name_model.clone());
        entries.push(NumberedUpstream {
            base_url,
            api_key: get(&format!("UPSTREAM_CONFIG_{i}_API_KEY")).map(str::to_string),
            request_model,
            name_model,
        });
    }
    Ok(entries)
}

fn scan_channels<'a>(get: &impl Fn(&str) -> Option<&'a str>) -> Result<Vec<Channel>, ProxyError> {
    let mut channels = Vec::new();
    for i in 1.. {
        let name = match get(&format!("CHANNEL_{i}_NAME")) {
            Some(name) => name.to_string(),
            None => break,
        };
        let base_url = get(&format!("CHANNEL_{i}_BASE_URL"))
            .ok_or_else(|| ProxyError::Config(format!("CHANNEL_{i}_BASE_URL is required")))?
            .to_string();
        let protocol = match get(&format!("CHANNEL_{i}_PROTOCOL")) {
            Some(raw) => Protocol::parse(raw).ok_or_else(|| {
                ProxyError::Config(format!("CHANNEL_{i}_PROTOCOL: unknown protocol {raw}"))
            })?,
            None => Protocol::OpenAi,
        };
        channels.push(Channel {
            name,
            base_url,
            api_key: get(&format!("CHANNEL_{i}_API_KEY")).map(str::to_string),
            protocol,
        });
    }
    Ok(channels)
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

/// Parse `TOKEN_MULTIPLIER` leniently: `1.2`, `1.2x`, `x1.2`, `120%`, with or
/// without quotes. Anything non-positive or non-finite falls back to 1.0.
pub fn parse_token_multiplier(raw: Option<&str>) -> f64 {
    let raw = match raw {
        Some(raw) => raw,
        None => return 1.0,
    };

    let mut s = raw.trim().to_ascii_lowercase();
    s = s.trim_matches(|c| c == '"' || c == '\'').trim().to_string();

    let mut percent = false;
    if let Some(rest) = s.strip_suffix('%') {
        percent = true;
        s = rest.trim().to_string();
    }
    if let Some(rest) = s.strip_suffix('x') {
        s = rest.trim().to_string();
    } else if let Some(rest) = s.strip_prefix('x') {
        s = rest.trim().to_string();
    }

    let value = match s.parse::<f64>() {
        Ok(v) => {
            if percent {
                v / 100.0
            } else {
                v
            }
        }
        Err(_) => return 1.0,
    };

    if !value.is_finite() || value <= 0.0 {
        1.0
    } else {
        value
    }
}
