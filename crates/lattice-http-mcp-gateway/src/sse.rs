//! Single-pass SSE observation.
//!
//! [`TeeBody`] wraps an upstream `text/event-stream` response body. Every
//! frame is forwarded downstream byte-for-byte and, in the same pass, a copy
//! is fed through a line-oriented parser; completed events are handed off on
//! an unbounded channel so the body never blocks on an observer. No
//! buffering is introduced and delivery timing is untouched.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;

use crate::gateway::GatewayBody;

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `id:` field, the per-stream resumption cursor.
    pub id: Option<String>,
    /// `event:` field.
    pub event: Option<String>,
    /// Concatenated `data:` lines, newline-joined.
    pub data: String,
    /// `retry:` field in milliseconds.
    pub retry: Option<u64>,
}

/// Incremental parser over the `text/event-stream` wire format. Feed it
/// chunks as they arrive; it returns the events completed by each chunk.
#[derive(Debug, Default)]
pub struct SseScanner {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
    retry: Option<u64>,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return any events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut completed = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline].to_string();
            self.buffer.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(frame) = self.flush() {
                    completed.push(frame);
                }
                continue;
            }
            self.field(&line);
        }
        completed
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            // Comment (keepalive).
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "retry" => self.retry = value.parse().ok(),
            _ => {}
        }
    }

    fn flush(&mut self) -> Option<SseFrame> {
        let id = self.id.take();
        let event = self.event.take();
        let retry = self.retry.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        // Per the SSE processing model, a blank line with no accumulated
        // data dispatches nothing.
        if data_lines.is_empty() {
            return None;
        }
        Some(SseFrame {
            id,
            event,
            data: data_lines.join("\n"),
            retry,
        })
    }
}

/// Response body wrapper that forwards frames unchanged while teeing parsed
/// SSE events into a channel.
pub struct TeeBody {
    inner: GatewayBody,
    scanner: SseScanner,
    tx: mpsc::UnboundedSender<SseFrame>,
}

impl TeeBody {
    pub fn new(inner: GatewayBody) -> (Self, mpsc::UnboundedReceiver<SseFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner,
                scanner: SseScanner::new(),
                tx,
            },
            rx,
        )
    }
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    for event in this.scanner.push(data) {
                        // Observer gone means nothing to record; keep serving.
                        let _ = this.tx.send(event);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
