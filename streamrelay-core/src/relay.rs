//! The streaming relay: connector → reassembler → normalizer → caller.
//!
//! One [`SessionDriver`] runs per inbound request. It is pulled by the caller
//! through a [`RelayStream`]; nothing is read from the upstream until the
//! caller asks for the next event, so a slow consumer throttles the upstream
//! read rate. Dropping the stream drops the driver, which closes the
//! upstream connection.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use tracing::{debug, error, field, info, warn};
use tracing_futures::Instrument;

use crate::config::RelayConfig;
use crate::error::{CoreResult, RelayError};
use crate::http_client::{ChunkStream, Connector, HttpConnector, RequestCtx};
use crate::normalizer::normalize;
use crate::reassembler::{Frame, FrameReassembler};
use crate::retry::{Decision, RetryPolicy, RetrySupervisor};
use crate::session::StreamSession;
use crate::stream::{EventKind, OutgoingEvent, RelayStream};
use crate::telemetry::keys::{
    KEY_ATTEMPTS, KEY_CHUNKS, KEY_EVENTS, KEY_OUTCOME, KEY_RETRIES, KEY_SESSION_ID,
    KEY_UPSTREAM_URL, SPAN_SESSION,
};
use crate::telemetry::{SessionLog, SessionOutcome, TelemetrySink, emit_session};

/// Shared, read-only relay configuration plus the connector used by every
/// session. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    connector: Arc<dyn Connector>,
    config: Arc<RelayConfig>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl Relay {
    pub fn new(connector: Arc<dyn Connector>, config: Arc<RelayConfig>) -> Self {
        Self {
            connector,
            config,
            telemetry: None,
        }
    }

    /// Relay backed by an HTTP connector built from `config.http`.
    pub fn from_config(config: RelayConfig) -> CoreResult<Self> {
        config.validate()?;
        let connector = HttpConnector::new(&config.http)?;
        Ok(Self::new(Arc::new(connector), Arc::new(config)))
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start relaying one session. The returned stream yields exactly one
    /// terminal event unless the caller stops pulling first.
    pub fn stream(&self, session: StreamSession) -> RelayStream {
        let span = tracing::info_span!(
            SPAN_SESSION,
            { KEY_SESSION_ID } = %session.session_id,
            { KEY_UPSTREAM_URL } = %session.request.target_url,
            { KEY_ATTEMPTS } = field::Empty,
            { KEY_RETRIES } = field::Empty,
            { KEY_CHUNKS } = field::Empty,
            { KEY_EVENTS } = field::Empty,
            { KEY_OUTCOME } = field::Empty,
        );
        let driver = SessionDriver::new(self, session, span.clone());

        futures::stream::unfold(Some(driver), |state| async move {
            let mut driver = state?;
            match AssertUnwindSafe(driver.next_event()).catch_unwind().await {
                Ok(Some(ev)) => Some((ev, Some(driver))),
                Ok(None) => None,
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(panic = %msg, "relay session panicked");
                    Some((driver.fault(&msg), None))
                }
            }
        })
        .instrument(span)
        .boxed()
    }
}

enum Phase {
    Connect,
    Backoff(Duration),
    Streaming(ChunkStream),
    Done,
}

enum Wake<T> {
    Ready(T),
    Cancelled,
}

struct SessionDriver {
    connector: Arc<dyn Connector>,
    config: Arc<RelayConfig>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    session: StreamSession,
    reassembler: FrameReassembler,
    supervisor: RetrySupervisor,
    phase: Phase,
    /// Complete-response event waiting to learn whether it ends the stream.
    held: Option<OutgoingEvent>,
    queue: VecDeque<OutgoingEvent>,
    /// Bytes received by the current attempt.
    attempt_bytes: u64,
    events_emitted: u64,
    outcome: Option<SessionOutcome>,
    failure: Option<RelayError>,
    started: Instant,
    span: tracing::Span,
}

impl SessionDriver {
    fn new(relay: &Relay, session: StreamSession, span: tracing::Span) -> Self {
        Self {
            connector: relay.connector.clone(),
            telemetry: relay.telemetry.clone(),
            reassembler: FrameReassembler::new(relay.config.framing.max_buffer_bytes),
            supervisor: RetrySupervisor::new(RetryPolicy::from(&relay.config.retry)),
            config: relay.config.clone(),
            session,
            phase: Phase::Connect,
            held: None,
            queue: VecDeque::new(),
            attempt_bytes: 0,
            events_emitted: 0,
            outcome: None,
            failure: None,
            started: Instant::now(),
            span,
        }
    }

    fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    async fn next_event(&mut self) -> Option<OutgoingEvent> {
        loop {
            if let Some(ev) = self.queue.pop_front() {
                self.events_emitted += 1;
                return Some(ev);
            }
            if self.is_closed() {
                return None;
            }
            if self.session.cancel.is_cancelled() {
                self.cancel();
                return None;
            }

            let token = self.session.cancel.clone();
            match &mut self.phase {
                Phase::Connect => {
                    if self.supervisor.attempts() == 0
                        && let Err(e) = self.session.request.validate()
                    {
                        warn!(error = %e, "rejecting malformed upstream request");
                        self.supervisor.abort();
                        self.fail(e);
                        continue;
                    }
                    let attempt = self.supervisor.begin_attempt();
                    self.attempt_bytes = 0;
                    debug!(attempt, "opening upstream");
                    let stall = self.config.http.read_stall_timeout();
                    let ctx = RequestCtx {
                        session_id: Some(&self.session.session_id),
                        attempt: attempt - 1,
                    };
                    let open = tokio::time::timeout(
                        stall,
                        self.connector.open(&self.session.request, &ctx),
                    );
                    let opened = tokio::select! {
                        biased;
                        _ = token.cancelled() => Wake::Cancelled,
                        r = open => Wake::Ready(r),
                    };
                    match opened {
                        Wake::Cancelled => self.cancel(),
                        Wake::Ready(Ok(Ok(chunks))) => self.phase = Phase::Streaming(chunks),
                        Wake::Ready(Ok(Err(e))) => self.attempt_failed(e),
                        Wake::Ready(Err(_elapsed)) => {
                            self.attempt_failed(RelayError::ReadStall(stall.as_millis() as u64))
                        }
                    }
                }
                Phase::Backoff(delay) => {
                    let sleep = tokio::time::sleep(*delay);
                    let woke = tokio::select! {
                        biased;
                        _ = token.cancelled() => Wake::Cancelled,
                        _ = sleep => Wake::Ready(()),
                    };
                    match woke {
                        Wake::Cancelled => self.cancel(),
                        Wake::Ready(()) => self.phase = Phase::Connect,
                    }
                }
                Phase::Streaming(chunks) => {
                    // frames already buffered go out before more bytes are read
                    if let Some(frame) = self.reassembler.next_frame() {
                        self.accept(frame);
                        continue;
                    }
                    let stall = self.config.http.read_stall_timeout();
                    let next = tokio::time::timeout(stall, chunks.next());
                    let item = tokio::select! {
                        biased;
                        _ = token.cancelled() => Wake::Cancelled,
                        r = next => Wake::Ready(r),
                    };
                    match item {
                        Wake::Cancelled => self.cancel(),
                        Wake::Ready(Ok(Some(Ok(bytes)))) => {
                            self.attempt_bytes += bytes.len() as u64;
                            self.reassembler.push(&bytes);
                            self.session.chunk_count = self.reassembler.chunk_count();
                        }
                        Wake::Ready(Ok(Some(Err(e)))) => self.attempt_failed(e),
                        Wake::Ready(Ok(None)) => self.upstream_ended(),
                        Wake::Ready(Err(_elapsed)) => {
                            self.attempt_failed(RelayError::ReadStall(stall.as_millis() as u64))
                        }
                    }
                }
                Phase::Done => {
                    // closed without an outcome: treat as a fault
                    return Some(self.fault("relay reached end state without a terminal event"));
                }
            }
        }
    }

    /// Route one frame through the normalizer into the outgoing queue.
    fn accept(&mut self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        let Some(ev) = normalize(&mut self.session, frame) else {
            // a suppressed signal still means the upstream is finished
            self.complete();
            return;
        };
        if ev.is_terminal {
            self.release_held();
            self.queue.push_back(ev);
            self.succeed();
            return;
        }
        self.release_held();
        if ev.kind == EventKind::Complete {
            self.held = Some(ev);
        } else {
            self.queue.push_back(ev);
        }
    }

    fn release_held(&mut self) {
        if let Some(ev) = self.held.take() {
            self.queue.push_back(ev);
        }
    }

    /// End cleanly: promote a held complete response, or synthesize `finished`.
    fn complete(&mut self) {
        let terminal = match self.held.take() {
            Some(ev) => ev.into_terminal(),
            None => OutgoingEvent::finished(),
        };
        self.queue.push_back(terminal);
        self.succeed();
    }

    fn upstream_ended(&mut self) {
        self.reassembler.finish();
        while !self.is_closed() {
            match self.reassembler.next_frame() {
                Some(frame) => self.accept(frame),
                None => break,
            }
        }
        if !self.is_closed() {
            debug!("upstream closed without a terminal signal");
            self.complete();
        }
    }

    fn attempt_failed(&mut self, err: RelayError) {
        let attempt = self.supervisor.attempts();
        match self.supervisor.on_failure(&err, self.attempt_bytes) {
            Decision::Retry { delay } => {
                self.session.retry_count = self.supervisor.retry_count();
                warn!(
                    attempt,
                    retry = self.session.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "upstream attempt failed; retrying"
                );
                self.phase = Phase::Backoff(delay);
            }
            Decision::Fail => {
                error!(
                    attempt,
                    bytes = self.attempt_bytes,
                    error.kind = err.kind(),
                    error = %err,
                    "upstream attempt failed"
                );
                self.fail(err);
            }
        }
    }

    /// End the session with a synthetic error, after anything already received.
    fn fail(&mut self, err: RelayError) {
        self.phase = Phase::Done;
        if self.attempt_bytes > 0 {
            self.reassembler.finish();
            while !self.is_closed() {
                match self.reassembler.next_frame() {
                    Some(frame) => self.accept(frame),
                    None => break,
                }
            }
        }
        if self.is_closed() {
            return;
        }
        let message = if self.supervisor.retry_count() > 0 {
            format!("{err} (after {} attempts)", self.supervisor.attempts())
        } else {
            err.to_string()
        };
        self.release_held();
        self.queue.push_back(OutgoingEvent::error(message));
        self.close(SessionOutcome::Failed);
        self.failure = Some(err);
    }

    fn succeed(&mut self) {
        self.supervisor.on_success();
        self.close(SessionOutcome::Completed);
    }

    fn cancel(&mut self) {
        debug!("session cancelled by caller");
        self.supervisor.abort();
        self.queue.clear();
        self.held = None;
        self.close(SessionOutcome::Cancelled);
    }

    /// Degrade an internal fault into the session's terminal error event.
    fn fault(&mut self, msg: &str) -> OutgoingEvent {
        self.supervisor.abort();
        self.queue.clear();
        self.held = None;
        self.failure = Some(RelayError::Internal(msg.to_string()));
        self.close(SessionOutcome::Failed);
        self.events_emitted += 1;
        OutgoingEvent::error(format!("internal relay fault: {msg}"))
    }

    /// Drop the upstream connection and fix the outcome. Idempotent.
    fn close(&mut self, outcome: SessionOutcome) {
        self.phase = Phase::Done;
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    fn report(&mut self) {
        let outcome = *self.outcome.get_or_insert(SessionOutcome::Cancelled);
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let attempts = self.supervisor.attempts();

        self.span.record(KEY_ATTEMPTS, attempts);
        self.span.record(KEY_RETRIES, self.session.retry_count);
        self.span.record(KEY_CHUNKS, self.session.chunk_count);
        self.span.record(KEY_EVENTS, self.events_emitted);
        self.span.record(KEY_OUTCOME, outcome.as_str());
        self.span.in_scope(|| {
            info!(
                outcome = outcome.as_str(),
                attempts,
                events = self.events_emitted,
                latency_ms,
                "relay session closed"
            )
        });

        if let Some(sink) = &self.telemetry {
            let kind = self.failure.as_ref().map(RelayError::kind);
            let message = self.failure.as_ref().map(ToString::to_string);
            let log = SessionLog::new(
                &self.session.session_id,
                &self.session.request.target_url,
                outcome,
            )
            .attempts(attempts)
            .retry_count(self.session.retry_count)
            .chunk_count(self.session.chunk_count)
            .events_emitted(self.events_emitted)
            .latency_ms(latency_ms)
            .error_opt(kind, message.as_deref());
            emit_session(sink.as_ref(), log);
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        // releases the upstream connection on every exit path
        self.phase = Phase::Done;
        self.report();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
