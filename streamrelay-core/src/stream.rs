//! Events the relay hands to its caller, and their SSE wire form.
//!
//! Contract:
//! - A session yields 0..n non-terminal events followed by exactly one terminal
//!   event, unless the caller cancels first.
//! - After the terminal event, no further events are emitted.
//! - Payloads are already serialized JSON; `to_sse` only adds framing.

use std::convert::Infallible;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderValue, header};
use serde_json::json;

/// How the normalizer classified the frame behind an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Incremental text, or unparsable upstream text wrapped as `{"text": ..}`.
    Text,
    /// Aggregated final answer carried in one frame.
    Complete,
    /// Upstream `finished` signal, or the relay's own clean completion.
    Finished,
    /// Synthetic failure produced by the relay.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEvent {
    pub payload: String,
    pub is_terminal: bool,
    pub kind: EventKind,
}

impl OutgoingEvent {
    pub(crate) fn forward(payload: String, kind: EventKind) -> Self {
        Self {
            payload,
            is_terminal: false,
            kind,
        }
    }

    /// `{"error": true, "text": <message>, "finished": true}`, terminal.
    pub fn error(message: impl AsRef<str>) -> Self {
        Self {
            payload: json!({"error": true, "text": message.as_ref(), "finished": true}).to_string(),
            is_terminal: true,
            kind: EventKind::Error,
        }
    }

    /// `{"text": "", "finished": true}`, terminal.
    pub fn finished() -> Self {
        Self {
            payload: json!({"text": "", "finished": true}).to_string(),
            is_terminal: true,
            kind: EventKind::Finished,
        }
    }

    pub(crate) fn into_terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    /// One SSE frame: `data: <payload>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.payload)
    }
}

/// Boxed stream of relay events, pulled lazily by the caller.
pub type RelayStream = futures::stream::BoxStream<'static, OutgoingEvent>;

/// Headers to put on the downstream response so intermediaries neither cache
/// nor buffer the event stream.
pub fn sse_response_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    h.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("x-accel-buffering", HeaderValue::from_static("no"));
    h
}

/// Adapt a relay stream into body chunks for any hyper-compatible response.
pub fn into_sse_body<S>(events: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send
where
    S: Stream<Item = OutgoingEvent> + Send,
{
    events.map(|ev| Ok(Bytes::from(ev.to_sse())))
}
