use thiserror::Error;

/// Core error type for the stream relay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
///
/// None of these ever cross the emitter boundary: the relay turns each of
/// them into a synthetic terminal event.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection could not be established (DNS, connect, reset before headers).
    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// No chunk arrived within the read-stall deadline.
    #[error("upstream stalled: no data for {0} ms")]
    ReadStall(u64),

    /// The response body failed while being read.
    #[error("upstream stream interrupted: {0}")]
    Stream(String),

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("invalid relay configuration: {0}")]
    Config(String),

    #[error("internal relay fault: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Whether the failure class may be retried at all. Whether it actually is
    /// retried also depends on how many bytes the attempt already delivered:
    /// a body that breaks before its first byte is as safe to retry as a
    /// refused connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ReadStall(_) | Self::Stream(_))
    }

    /// Short, stable label used for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::ReadStall(_) => "read_stall",
            Self::Stream(_) => "stream",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_level_failures_are_retryable() {
        assert!(RelayError::Connect("refused".into()).is_retryable());
        assert!(RelayError::ReadStall(5_000).is_retryable());
        assert!(RelayError::Stream("reset".into()).is_retryable());
        assert!(!RelayError::Config("bad header".into()).is_retryable());
        assert!(
            !RelayError::UpstreamStatus {
                status: 500,
                body: "boom".into()
            }
            .is_retryable()
        );
        assert!(!RelayError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn status_error_message_carries_body() {
        let err = RelayError::UpstreamStatus {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "upstream returned HTTP 502: bad gateway");
        assert_eq!(err.kind(), "upstream_status");
    }
}
