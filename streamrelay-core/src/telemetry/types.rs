use serde::{Deserialize, Serialize};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// A terminal finished or complete-response event reached the caller.
    Completed,
    /// The caller received a synthetic error event.
    Failed,
    /// The caller stopped pulling before the terminal event.
    Cancelled,
}

impl SessionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Structured record of one relay session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLog {
    pub session_id: String,
    pub target_url: String,
    pub outcome: SessionOutcome,

    /// Connection attempts made, first one included.
    pub attempts: u32,
    pub retry_count: u32,
    pub chunk_count: u64,
    pub events_emitted: u64,
    pub latency_ms: Option<u64>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl SessionLog {
    pub fn new(session_id: &str, target_url: &str, outcome: SessionOutcome) -> Self {
        Self {
            session_id: session_id.to_string(),
            target_url: target_url.to_string(),
            outcome,
            attempts: 0,
            retry_count: 0,
            chunk_count: 0,
            events_emitted: 0,
            latency_ms: None,
            error_kind: None,
            error_message: None,
        }
    }
    pub fn attempts(mut self, v: u32) -> Self { self.attempts = v; self }
    pub fn retry_count(mut self, v: u32) -> Self { self.retry_count = v; self }
    pub fn chunk_count(mut self, v: u64) -> Self { self.chunk_count = v; self }
    pub fn events_emitted(mut self, v: u64) -> Self { self.events_emitted = v; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn error_opt(mut self, kind: Option<&str>, message: Option<&str>) -> Self {
        self.error_kind = kind.map(|s| s.to_string());
        self.error_message = message.map(|s| s.to_string());
        self
    }
}
