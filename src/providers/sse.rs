//! Server-sent-event stream normalization
//!
//! Backends frame their streams as newline-delimited `data: <payload>`
//! lines. [`SseLineBuffer`] reassembles payloads across arbitrary network
//! read boundaries; [`spawn_normalizer`] drives a byte stream through a
//! backend-specific payload mapper and delivers canonical events over a
//! bounded channel.
//!
//! Guarantees:
//! - exactly one [`StreamEvent::Done`] terminates a well-formed sequence,
//!   whether the backend sent a sentinel, an explicit stop event, or just
//!   closed the connection;
//! - a malformed payload is logged and skipped, never aborting the stream;
//! - dropping the receiver cancels the normalizer task and releases the
//!   network reader.

use crate::error::DispatchError;
use crate::protocol::StreamEvent;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::warn;

/// Canonical event stream handed to callers.
///
/// Finite and non-restartable: re-invoking `stream()` issues a brand-new
/// network call.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, DispatchError>> + Send>>;

/// Sentinel payload closing an OpenAI-style stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Outcome of mapping one `data:` payload to canonical events
pub enum Frame {
    /// Zero or more events; the stream continues
    Events(Vec<StreamEvent>),
    /// Events followed by stream termination
    Final(Vec<StreamEvent>),
    /// Payload carried nothing canonical (unknown event type, keep-alive)
    Ignored,
    /// Backend signalled a terminal error mid-stream
    Fail(DispatchError),
}

/// Reassembles `data:` payloads from arbitrarily-split byte chunks.
///
/// Bytes accumulate until a newline completes a line; the trailing partial
/// line is retained for the next read, so any byte-level chunking of the
/// same input yields the same payload sequence.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network read and return the `data:` payloads completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(payload) = Self::data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn data_payload(line: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(line);
        let rest = text.strip_prefix("data:")?;
        let payload = rest.strip_prefix(' ').unwrap_or(rest);
        if payload.is_empty() {
            return None;
        }
        Some(payload.to_string())
    }
}

/// Drive a raw byte stream through a payload mapper, delivering canonical
/// events over a bounded channel.
///
/// The mapper sees every `data:` payload except the `[DONE]` sentinel,
/// which is handled here for all backends that use it.
pub fn spawn_normalizer<B, F>(byte_stream: B, mut map_payload: F) -> ChatStream
where
    B: Stream<Item = Result<Bytes, DispatchError>> + Send + 'static,
    F: FnMut(&str) -> Frame + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<StreamEvent, DispatchError>>(32);

    tokio::spawn(async move {
        let mut byte_stream = Box::pin(byte_stream);
        let mut lines = SseLineBuffer::new();

        while let Some(read) = byte_stream.next().await {
            let chunk = match read {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };

            for payload in lines.push(&chunk) {
                if payload == DONE_SENTINEL {
                    let _ = tx.send(Ok(StreamEvent::Done)).await;
                    return;
                }
                match map_payload(&payload) {
                    Frame::Events(events) => {
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                // Receiver dropped: caller cancelled
                                return;
                            }
                        }
                    }
                    Frame::Final(events) => {
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Ok(StreamEvent::Done)).await;
                        return;
                    }
                    Frame::Ignored => {}
                    Frame::Fail(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }

            if tx.is_closed() {
                return;
            }
        }

        // Stream closed without a sentinel; still terminate with one Done.
        let _ = tx.send(Ok(StreamEvent::Done)).await;
    });

    Box::pin(EventReceiver { rx })
}

/// Adapts the bounded channel receiver to a `futures::Stream`
struct EventReceiver {
    rx: mpsc::Receiver<Result<StreamEvent, DispatchError>>,
}

impl Stream for EventReceiver {
    type Item = Result<StreamEvent, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Log and skip one malformed payload, keeping the stream alive
pub fn skip_malformed(payload: &str, err: &serde_json::Error) -> Frame {
    warn!(error = %err, payload_len = payload.len(), "skipping malformed stream chunk");
    Frame::Ignored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Usage;
    use futures::stream;

    const PAYLOAD: &str =
        "data: one\n\ndata: two\r\ndata:three\n\nevent: noise\nid: 7\n\ndata: [DONE]\n\n";

    fn payloads_with_chunking(input: &[u8], split_at: usize) -> Vec<String> {
        let mut buf = SseLineBuffer::new();
        let (head, tail) = input.split_at(split_at);
        let mut out = buf.push(head);
        out.extend(buf.push(tail));
        out
    }

    #[test]
    fn chunking_is_invariant_at_every_byte_offset() {
        let whole = payloads_with_chunking(PAYLOAD.as_bytes(), 0);
        assert_eq!(whole, vec!["one", "two", "three", "[DONE]"]);
        for split in 0..=PAYLOAD.len() {
            assert_eq!(
                payloads_with_chunking(PAYLOAD.as_bytes(), split),
                whole,
                "split at byte {split} changed the payload sequence"
            );
        }
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut buf = SseLineBuffer::new();
        let payloads = buf.push(b"event: message_start\nretry: 500\ndata: x\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn partial_line_is_retained_across_reads() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: hel").is_empty());
        assert_eq!(buf.push(b"lo\n"), vec!["hello"]);
    }

    #[tokio::test]
    async fn normalizer_terminates_on_sentinel() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"text\":\"hi\"}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\ndata: {\"text\":\"after\"}\n\n")),
        ];
        let mut events = spawn_normalizer(stream::iter(chunks), |payload| {
            let value: serde_json::Value = serde_json::from_str(payload).unwrap();
            Frame::Events(vec![StreamEvent::Text {
                content: value["text"].as_str().unwrap().to_string(),
            }])
        });

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StreamEvent::Text {
                content: "hi".into()
            }
        );
        assert_eq!(events.next().await.unwrap().unwrap(), StreamEvent::Done);
        // Nothing after the sentinel, even though more data followed it
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn normalizer_emits_done_on_stream_closure() {
        let chunks = vec![Ok(Bytes::from_static(b"data: {}\n\n"))];
        let mut events = spawn_normalizer(stream::iter(chunks), |_| {
            Frame::Events(vec![StreamEvent::Usage(Usage::new(3, 1))])
        });

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StreamEvent::Usage(Usage::new(3, 1))
        );
        assert_eq!(events.next().await.unwrap().unwrap(), StreamEvent::Done);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_chunk_is_skipped_not_fatal() {
        let chunks = vec![Ok(Bytes::from_static(
            b"data: not json\n\ndata: {\"ok\":true}\n\ndata: [DONE]\n\n",
        ))];
        let mut events = spawn_normalizer(stream::iter(chunks), |payload| {
            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(_) => Frame::Events(vec![StreamEvent::Text {
                    content: "ok".into(),
                }]),
                Err(err) => skip_malformed(payload, &err),
            }
        });

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StreamEvent::Text {
                content: "ok".into()
            }
        );
        assert_eq!(events.next().await.unwrap().unwrap(), StreamEvent::Done);
    }

    #[tokio::test]
    async fn read_error_is_terminal() {
        let chunks: Vec<Result<Bytes, DispatchError>> = vec![
            Ok(Bytes::from_static(b"data: {}\n\n")),
            Err(DispatchError::Network("reset".into())),
        ];
        let mut events = spawn_normalizer(stream::iter(chunks), |_| {
            Frame::Events(vec![StreamEvent::Text {
                content: "t".into(),
            }])
        });

        assert!(events.next().await.unwrap().is_ok());
        assert!(matches!(
            events.next().await.unwrap(),
            Err(DispatchError::Network(_))
        ));
        assert!(events.next().await.is_none());
    }
}
