/// Span and field keys for relay sessions.
/// Keep these stable; log queries and dashboards match on them.
pub const SPAN_SESSION: &str = "relay.session";

pub const KEY_SESSION_ID: &str = "session.id";
pub const KEY_UPSTREAM_URL: &str = "upstream.url";

/// Recorded when the session closes.
pub const KEY_ATTEMPTS: &str = "relay.attempts";
pub const KEY_RETRIES: &str = "relay.retries";
pub const KEY_CHUNKS: &str = "relay.chunks";
pub const KEY_EVENTS: &str = "relay.events";
pub const KEY_OUTCOME: &str = "relay.outcome";
