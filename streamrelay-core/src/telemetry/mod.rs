//! Per-session telemetry for the relay.
//!
//! A sink is optional and is handed to the relay explicitly; there is no
//! process-wide registration. The sink sees one [`SessionLog`] per session,
//! recorded when the session closes for any reason (completion, failure,
//! or the caller dropping the stream).

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use types::*;

/// Implement this to receive session records.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record_session` runs on the session's cleanup path; keep it cheap.
///   A panic inside it is contained and logged.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_session(&self, log: SessionLog);
}

/// Deliver a record to a sink without letting a faulty sink unwind into
/// the relay's cleanup.
pub(crate) fn emit_session(sink: &dyn TelemetrySink, log: SessionLog) {
    let delivered =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.record_session(log)));
    if delivered.is_err() {
        tracing::error!("telemetry sink panicked while recording a session");
    }
}
