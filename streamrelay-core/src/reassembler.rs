//! Frame reassembly over an arbitrarily fragmented upstream byte stream.
//!
//! Upstream services are not consistent about framing, so two shapes are
//! accepted side by side:
//! - delimited: `data: <payload>` terminated by a blank line;
//! - bare JSON: one or more JSON objects written back to back with no prefix.
//!
//! Anything else is cut at the next blank line. SSE comment lines (`:`) and
//! the `event:`, `id:` and `retry:` fields are dropped; a block left with no
//! content (a keep-alive) produces no frame.
//!
//! Frames are extracted lazily with [`FrameReassembler::next_frame`], one per
//! call, so the consumer decides how far ahead of the caller the relay reads.

use serde_json::Value;

/// Prefix that introduces a delimited frame.
pub const DATA_PREFIX: &str = "data:";

/// SSE fields that carry no payload for the caller.
const SSE_META_FIELDS: [&str; 3] = ["event:", "id:", "retry:"];

/// Default soft cap on pending bytes before a forced flush.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024;

/// A delimiter-complete unit of upstream data, not yet classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub text: String,
    /// True when `text` parsed as a self-contained JSON object.
    pub is_json: bool,
}

impl Frame {
    fn from_payload(text: String) -> Self {
        let is_json = matches!(serde_json::from_str::<Value>(&text), Ok(Value::Object(_)));
        Self { text, is_json }
    }

    fn plain(text: String) -> Self {
        Self {
            text,
            is_json: false,
        }
    }
}

/// Per-session reassembly state. Not reusable across sessions.
#[derive(Debug)]
pub struct FrameReassembler {
    buf: String,
    /// Trailing bytes of a UTF-8 sequence split across chunks.
    carry: Vec<u8>,
    max_buffer_bytes: usize,
    chunk_count: u64,
    bytes_received: u64,
    eos: bool,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl FrameReassembler {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            buf: String::new(),
            carry: Vec::new(),
            max_buffer_bytes: max_buffer_bytes.max(1),
            chunk_count: 0,
            bytes_received: 0,
            eos: false,
        }
    }

    /// Append one raw chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.chunk_count += 1;
        self.bytes_received += chunk.len() as u64;
        self.decode(chunk);
    }

    /// Signal that the upstream has no more chunks. Pending content is
    /// flushed by subsequent `next_frame` calls.
    pub fn finish(&mut self) {
        if self.eos {
            return;
        }
        self.eos = true;
        if !self.carry.is_empty() {
            let tail = std::mem::take(&mut self.carry);
            self.buf.push_str(&String::from_utf8_lossy(&tail));
        }
    }

    /// Extract the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if let Some(frame) = self.extract() {
            return Some(frame);
        }
        if self.buf.len() > self.max_buffer_bytes {
            if self.buf.trim().is_empty() {
                tracing::debug!(pending_bytes = self.buf.len(), "dropping whitespace-only buffer");
                self.buf.clear();
            } else {
                tracing::warn!(
                    pending_bytes = self.buf.len(),
                    limit = self.max_buffer_bytes,
                    "frame buffer over limit; flushing verbatim"
                );
                return Some(Frame::plain(std::mem::take(&mut self.buf)));
            }
        }
        if self.eos {
            return self.flush_tail();
        }
        None
    }

    /// Drain every frame currently extractable.
    pub fn frames(&mut self) -> impl Iterator<Item = Frame> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    pub fn pending(&self) -> &str {
        &self.buf
    }

    pub fn has_pending(&self) -> bool {
        !self.buf.trim().is_empty() || !self.carry.is_empty()
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn decode(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.buf.push_str(s);
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buf.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        // incomplete sequence at the end: wait for the next chunk
                        None => {
                            self.carry = rest[valid..].to_vec();
                            return;
                        }
                        Some(len) => {
                            self.buf.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                    }
                }
            }
        }
    }

    fn extract(&mut self) -> Option<Frame> {
        loop {
            let trimmed = self.buf.trim_start();
            if trimmed.is_empty() {
                return None;
            }
            let lead = self.buf.len() - trimmed.len();

            if !trimmed.starts_with(DATA_PREFIX) {
                match classify_json(trimmed) {
                    JsonPrefix::Object(len) => {
                        let text = trimmed[..len].to_string();
                        self.buf.drain(..lead + len);
                        return Some(Frame {
                            text,
                            is_json: true,
                        });
                    }
                    JsonPrefix::Incomplete => return None,
                    // not JSON: falls back to blank-line framing
                    JsonPrefix::Invalid => {}
                }
            }

            let (at, len) = find_delimiter(trimmed)?;
            let block = trimmed[..at].to_string();
            self.buf.drain(..lead + at + len);
            if let Some(frame) = event_block(&block) {
                return Some(frame);
            }
        }
    }

    fn flush_tail(&mut self) -> Option<Frame> {
        let tail = std::mem::take(&mut self.buf);
        event_block(tail.trim())
    }
}

enum JsonPrefix {
    /// A complete object occupying this many leading bytes.
    Object(usize),
    /// Valid so far; more bytes may complete it.
    Incomplete,
    Invalid,
}

fn classify_json(s: &str) -> JsonPrefix {
    let mut values = serde_json::Deserializer::from_str(s).into_iter::<Value>();
    match values.next() {
        Some(Ok(Value::Object(_))) => JsonPrefix::Object(values.byte_offset()),
        Some(Err(e)) if e.is_eof() => JsonPrefix::Incomplete,
        None => JsonPrefix::Incomplete,
        Some(_) => JsonPrefix::Invalid,
    }
}

/// Turn one blank-line separated block into a frame. Comment and metadata
/// lines are dropped; `None` when nothing else is left.
fn event_block(block: &str) -> Option<Frame> {
    let kept: Vec<&str> = block
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !is_sse_meta(line))
        .collect();
    if kept.iter().all(|line| line.trim().is_empty()) {
        return None;
    }
    let text = kept.join("\n");
    if kept.iter().any(|line| line.starts_with(DATA_PREFIX)) {
        return Some(Frame::from_payload(data_payload(&text)));
    }
    Some(Frame::from_payload(text.trim().to_string()))
}

fn is_sse_meta(line: &str) -> bool {
    line.starts_with(':') || SSE_META_FIELDS.iter().any(|f| line.starts_with(f))
}

/// Earliest blank-line delimiter as `(index, length)`; accepts LF and CRLF.
fn find_delimiter(s: &str) -> Option<(usize, usize)> {
    let lf = s.find("\n\n").map(|i| (i, 2));
    let crlf = s.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Strip the `data:` field name from each line of an event and join the lines.
fn data_payload(event: &str) -> String {
    event
        .lines()
        .map(|line| {
            let line = line.trim_end_matches('\r');
            match line.strip_prefix(DATA_PREFIX) {
                Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
                None => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
