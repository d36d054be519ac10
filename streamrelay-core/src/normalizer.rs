use serde_json::{Map, Value, json};

use crate::reassembler::Frame;
use crate::session::StreamSession;
use crate::stream::{EventKind, OutgoingEvent};

/// Field that marks a frame as the aggregated final answer.
pub const COMPLETE_RESPONSE_FIELD: &str = "complete_response";

/// Classify one frame and apply de-duplication of termination signals.
///
/// Returns `None` when the frame is a redundant finished signal. Rules, in order:
/// 1. unparsable text is wrapped as `{"text": .., "finished": false}` and forwarded;
/// 2. a frame carrying `complete_response` is forwarded verbatim and recorded;
/// 3. a `finished: true` frame is the terminal signal the first time it is seen,
///    unless a complete response already answered the caller;
/// 4. anything else is forwarded verbatim.
pub fn normalize(session: &mut StreamSession, frame: Frame) -> Option<OutgoingEvent> {
    let parsed = if frame.is_json {
        serde_json::from_str::<Value>(&frame.text).ok()
    } else {
        None
    };
    let Some(Value::Object(map)) = parsed else {
        return Some(wrap_text(&frame.text));
    };

    if map
        .get(COMPLETE_RESPONSE_FIELD)
        .is_some_and(|v| !v.is_null())
    {
        session.complete_response_received = true;
        return Some(OutgoingEvent::forward(frame.text, EventKind::Complete));
    }

    if is_finished(&map) {
        let empty = text_is_empty(&map);
        if session.complete_response_received {
            if empty {
                tracing::debug!(
                    session.id = %session.session_id,
                    "finished signal suppressed after complete response"
                );
                return None;
            }
            // never drop text, even when it arrives after the final answer
            return Some(OutgoingEvent::forward(frame.text, EventKind::Text));
        }

        let first = session.empty_text_terminal_count == 0;
        session.empty_text_terminal_count += 1;
        if first {
            return Some(OutgoingEvent::forward(frame.text, EventKind::Finished).into_terminal());
        }
        if empty {
            tracing::debug!(
                session.id = %session.session_id,
                seen = session.empty_text_terminal_count,
                "duplicate finished signal suppressed"
            );
            return None;
        }
        return Some(OutgoingEvent::forward(frame.text, EventKind::Text));
    }

    Some(OutgoingEvent::forward(frame.text, EventKind::Text))
}

fn wrap_text(text: &str) -> OutgoingEvent {
    OutgoingEvent::forward(
        json!({"text": text, "finished": false}).to_string(),
        EventKind::Text,
    )
}

fn is_finished(map: &Map<String, Value>) -> bool {
    map.get("finished").and_then(Value::as_bool) == Some(true)
}

fn text_is_empty(map: &Map<String, Value>) -> bool {
    map.get("text")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty)
}
