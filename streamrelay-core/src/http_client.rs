use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, HeaderValue, header};
use reqwest::{Client, StatusCode};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};
use crate::session::UpstreamRequest;

/// Characters of an upstream error body kept in the synthetic error event.
const ERROR_BODY_CHARS: usize = 300;

/// Request context carries tracing ids for one attempt.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub session_id: Option<&'a str>,
    /// Zero for the first attempt, `n` for the n-th retry.
    pub attempt: u32,
}

/// Raw body chunks of one upstream attempt, in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// Opens one streaming attempt against an upstream. Each call owns its own
/// connection; dropping the returned stream releases it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, req: &UpstreamRequest, ctx: &RequestCtx<'_>) -> CoreResult<ChunkStream>;
}

/// reqwest-backed connector with explicit connect and overall deadlines.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    inner: Client,
    user_agent: String,
    error_body_limit: usize,
}

impl HttpConnector {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.request_timeout());
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "streamrelay/0.1".to_string(),
            error_body_limit: cfg.error_body_limit,
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn headers(&self, req: &UpstreamRequest, ctx: &RequestCtx<'_>) -> CoreResult<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        h.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| RelayError::Config(format!("user agent: {e}")))?,
        );
        if let Some(sid) = ctx.session_id
            && let Ok(v) = HeaderValue::from_str(sid)
        {
            h.insert("x-request-id", v);
        }

        // caller headers win over the base set
        for (name, value) in req.typed_headers()? {
            h.insert(name, value);
        }
        Ok(h)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&self, req: &UpstreamRequest, ctx: &RequestCtx<'_>) -> CoreResult<ChunkStream> {
        let headers = self.headers(req, ctx)?;
        let resp = self
            .inner
            .post(&req.target_url)
            .headers(headers)
            .json(&req.request_body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = read_error_body(resp, self.error_body_limit).await;
            return Err(RelayError::UpstreamStatus {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_CHARS),
            });
        }

        let chunks = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| RelayError::Stream(e.to_string())));
        Ok(Box::pin(chunks))
    }
}

fn map_send_error(e: reqwest::Error) -> RelayError {
    if e.is_builder() {
        return RelayError::Config(format!("upstream request: {e}"));
    }
    // nothing was received yet, whatever the cause
    let cause = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connect failed"
    } else {
        "request failed"
    };
    RelayError::Connect(format!("{cause}: {e}"))
}

async fn read_error_body(resp: reqwest::Response, limit: usize) -> String {
    let mut body: Vec<u8> = Vec::new();
    let mut chunks = resp.bytes_stream();
    while let Some(Ok(chunk)) = chunks.next().await {
        let room = limit.saturating_sub(body.len());
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= limit {
            break;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut t = s[..cut].to_string();
            t.push_str("...");
            t
        }
        None => s.to_string(),
    }
}
