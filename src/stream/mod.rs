//! Decoder for the blank-line-delimited event streams returned by every
//! pipeline endpoint.
//!
//! Each frame looks like:
//!
//! ```text
//! event: issue
//! data: {"number": 12, "url": "...", "title": "..."}
//!
//! ```
//!
//! Frames are decoded into a per-endpoint serde enum (see [`events`]) tagged
//! by the event name. Partial frames stay buffered until their terminating
//! blank line arrives; frames that do not decode are dropped.

pub mod events;

use std::collections::VecDeque;
use std::marker::PhantomData;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::errors::ApiError;
pub use events::StreamEvent;

/// Raw response body as a stream of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ApiError>>;

/// One undecoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

/// Splits a byte stream into frames, buffering across chunk boundaries.
///
/// Buffering is done on bytes, so a multi-byte character split across two
/// chunks is reassembled before it is decoded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, separator)) = find_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + separator).collect();
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw[..end])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        parse_frame(&String::from_utf8_lossy(&raw))
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Position of the first frame boundary and the length of the separator.
fn find_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(text: &str) -> Option<Frame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            data.push(payload.strip_prefix(' ').unwrap_or(payload));
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(Frame {
        event,
        data: data.join("\n"),
    })
}

/// Decode a frame into the endpoint's event enum. Returns `None` (and logs at
/// debug) for frames without an event name, with invalid JSON, or with an
/// event name the enum does not know.
pub fn decode_event<E: DeserializeOwned>(frame: &Frame) -> Option<E> {
    let Some(name) = frame.event.as_deref() else {
        debug!(data = %frame.data, "Dropping frame without event name");
        return None;
    };
    let data: Value = if frame.data.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str(&frame.data) {
            Ok(value) => value,
            Err(err) => {
                debug!(event = name, error = %err, "Dropping frame with malformed data");
                return None;
            }
        }
    };
    match serde_json::from_value(json!({ "event": name, "data": data })) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(event = name, error = %err, "Dropping undecodable frame");
            None
        }
    }
}

/// Typed view over a [`ByteStream`].
pub struct EventStream<E> {
    inner: ByteStream,
    decoder: FrameDecoder,
    pending: VecDeque<E>,
    done: bool,
    _marker: PhantomData<fn() -> E>,
}

impl<E: DeserializeOwned> EventStream<E> {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            done: false,
            _marker: PhantomData,
        }
    }

    /// Next decoded event. A transport error is yielded once, after which the
    /// stream is finished.
    pub async fn next(&mut self) -> Option<Result<E, ApiError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    for frame in self.decoder.push(&chunk) {
                        if let Some(event) = decode_event(&frame) {
                            self.pending.push_back(event);
                        }
                    }
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    if let Some(event) = self.decoder.finish().as_ref().and_then(decode_event::<E>) {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }
}
