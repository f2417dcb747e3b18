//! Error taxonomy for the proxy pipeline.
//!
//! Only the HTTP layer in `router.rs` maps these onto status codes; everything
//! below it passes `ProxyError` (or `anyhow::Error` for plumbing) upward.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Startup or per-request configuration resolution failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request body failed schema validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream returned a non-2xx status.
    #[error("upstream returned {status}: {body_snippet}")]
    UpstreamHttp { status: u16, body_snippet: String },

    /// Socket or read failure mid-stream.
    #[error("upstream read failed: {0}")]
    UpstreamRead(String),

    /// Upstream did not respond within the configured timeout.
    #[error("upstream timed out after {0}ms")]
    Timeout(u64),
}

impl ProxyError {
    /// Anthropic-style error type label for the JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Config(_) | ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::UpstreamHttp { .. } | ProxyError::UpstreamRead(_) => "api_error",
            ProxyError::Timeout(_) => "timeout_error",
        }
    }

    /// HTTP status for the non-streaming error path.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Config(_) | ProxyError::InvalidRequest(_) => 400,
            ProxyError::UpstreamHttp { .. } | ProxyError::UpstreamRead(_) => 502,
            ProxyError::Timeout(_) => 504,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::Config("x".into()).status_code(), 400);
        assert_eq!(
            ProxyError::UpstreamHttp {
                status: 500,
                body_snippet: "boom".into()
            }
            .status_code(),
            502
        );
        assert_eq!(ProxyError::Timeout(120_000).status_code(), 504);
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            ProxyError::InvalidRequest("bad".into()).error_type(),
            "invalid_request_error"
        );
        assert_eq!(ProxyError::UpstreamRead("eof".into()).error_type(), "api_error");
    }
}
