//! Scripted connectors and sinks shared by relay tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{CoreResult, RelayError};
use crate::http_client::{ChunkStream, Connector, RequestCtx};
use crate::session::UpstreamRequest;
use crate::telemetry::{SessionLog, TelemetrySink};

/// One body event of a scripted response.
pub enum Step {
    Chunk(&'static str),
    /// Body read fails with a stream error.
    Fail(&'static str),
    /// Body fails with a connection-level error (retryable class).
    Reset(&'static str),
    /// No further data ever arrives.
    Stall,
}

/// What a single `open` call does.
pub enum Attempt {
    Refuse(&'static str),
    Status(u16, &'static str),
    Hang,
    Respond(Vec<Step>),
}

#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Attempt>>,
    opened: AtomicU32,
    released: Arc<AtomicU32>,
}

impl ScriptedConnector {
    pub fn new(attempts: Vec<Attempt>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(attempts.into()),
            ..Default::default()
        })
    }

    /// Calls to `open`, successful or not.
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Response streams that were dropped.
    pub fn released(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _req: &UpstreamRequest, _ctx: &RequestCtx<'_>) -> CoreResult<ChunkStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let steps = match next {
            None => return Err(RelayError::Connect("script exhausted".into())),
            Some(Attempt::Refuse(msg)) => return Err(RelayError::Connect(msg.into())),
            Some(Attempt::Status(status, body)) => {
                return Err(RelayError::UpstreamStatus {
                    status,
                    body: body.into(),
                });
            }
            Some(Attempt::Hang) => futures::future::pending::<Vec<Step>>().await,
            Some(Attempt::Respond(steps)) => steps,
        };

        let mut items: Vec<CoreResult<Bytes>> = Vec::new();
        let mut stall = false;
        for step in steps {
            match step {
                Step::Chunk(s) => items.push(Ok(Bytes::from_static(s.as_bytes()))),
                Step::Fail(msg) => items.push(Err(RelayError::Stream(msg.into()))),
                Step::Reset(msg) => items.push(Err(RelayError::Connect(msg.into()))),
                Step::Stall => {
                    stall = true;
                    break;
                }
            }
        }
        let body: ChunkStream = if stall {
            Box::pin(futures::stream::iter(items).chain(futures::stream::pending()))
        } else {
            Box::pin(futures::stream::iter(items))
        };
        Ok(Box::pin(ReleaseGuard {
            inner: body,
            released: self.released.clone(),
        }))
    }
}

/// Counts its own drop so tests can check the connection was released.
struct ReleaseGuard {
    inner: ChunkStream,
    released: Arc<AtomicU32>,
}

impl Stream for ReleaseGuard {
    type Item = CoreResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector whose `open` panics, standing in for a bug in the relay path.
pub struct PanickingConnector;

#[async_trait]
impl Connector for PanickingConnector {
    async fn open(&self, _req: &UpstreamRequest, _ctx: &RequestCtx<'_>) -> CoreResult<ChunkStream> {
        panic!("connector exploded");
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub logs: Mutex<Vec<SessionLog>>,
}

impl RecordingSink {
    pub fn last(&self) -> SessionLog {
        self.logs
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a session log")
    }
}

impl TelemetrySink for RecordingSink {
    fn record_session(&self, log: SessionLog) {
        self.logs.lock().unwrap().push(log);
    }
}
