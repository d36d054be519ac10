use http::{HeaderName, HeaderValue};
use reqwest::Url;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, RelayError};

/// Session id used when the caller does not supply one.
pub const DEFAULT_SESSION_ID: &str = "unknown-session";

/// What to send upstream. Immutable for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub target_url: String,
    pub request_body: Value,
    /// Caller headers; merged over the fixed streaming base headers.
    pub request_headers: Vec<(String, String)>,
}

impl UpstreamRequest {
    pub fn new(target_url: impl Into<String>, request_body: Value) -> Self {
        Self {
            target_url: target_url.into(),
            request_body,
            request_headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    /// Reject a malformed target or caller header before anything is sent.
    pub fn validate(&self) -> CoreResult<()> {
        let url = Url::parse(&self.target_url)
            .map_err(|e| RelayError::Config(format!("target url {:?}: {e}", self.target_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "target url scheme {:?} is not http(s)",
                url.scheme()
            )));
        }
        self.typed_headers().map(|_| ())
    }

    /// Caller headers as typed pairs, in insertion order.
    pub(crate) fn typed_headers(&self) -> CoreResult<Vec<(HeaderName, HeaderValue)>> {
        self.request_headers
            .iter()
            .map(|(k, v)| {
                let name = HeaderName::from_bytes(k.as_bytes())
                    .map_err(|e| RelayError::Config(format!("header name {k:?}: {e}")))?;
                let value = HeaderValue::from_str(v)
                    .map_err(|e| RelayError::Config(format!("header value for {k}: {e}")))?;
                Ok((name, value))
            })
            .collect()
    }
}

/// Per-request relay state. Owned by exactly one relay task; nothing here is
/// shared with other sessions.
#[derive(Debug)]
pub struct StreamSession {
    pub session_id: String,
    pub request: UpstreamRequest,
    pub(crate) retry_count: u32,
    pub(crate) complete_response_received: bool,
    pub(crate) empty_text_terminal_count: u32,
    pub(crate) chunk_count: u64,
    pub(crate) cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(session_id: Option<String>, request: UpstreamRequest) -> Self {
        Self {
            session_id: session_id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
            request,
            retry_count: 0,
            complete_response_received: false,
            empty_text_terminal_count: 0,
            chunk_count: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the session to an external cancellation signal (e.g. client disconnect).
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this session when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn complete_response_received(&self) -> bool {
        self.complete_response_received
    }

    pub fn empty_text_terminal_count(&self) -> u32 {
        self.empty_text_terminal_count
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }
}
