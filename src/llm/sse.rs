//! Incremental decoder for `text/event-stream` completion responses.
//!
//! Events are separated by blank lines and carried on `data: ` lines;
//! the terminal marker is either a literal `[DONE]` payload or a chunk
//! with a populated `finish_reason`. Malformed data lines are logged and
//! skipped without aborting the stream.

use crate::error::CompletionError;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A non-empty content delta.
    Delta(String),
    /// The server signalled completion.
    Finished,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Adapts a byte stream into a stream of [`SseEvent`]s.
pub struct SseDeltas {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, CompletionError>> + Send>>,
    buffer: Vec<u8>,
    queue: VecDeque<Result<SseEvent, CompletionError>>,
    done: bool,
}

impl SseDeltas {
    pub fn new(
        stream: impl Stream<Item = Result<Bytes, CompletionError>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(stream),
            buffer: Vec::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }

    /// Split complete events off the front of the buffer.
    fn drain_events(&mut self) {
        loop {
            let boundary = find_boundary(&self.buffer);
            let Some((index, len)) = boundary else {
                return;
            };
            let event: Vec<u8> = self.buffer.drain(..index + len).collect();
            self.parse_event(&event[..index]);
            if self.done {
                return;
            }
        }
    }

    fn parse_event(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        for line in text.lines() {
            let Some(data) = line.trim_end_matches('\r').strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                self.queue.push_back(Ok(SseEvent::Finished));
                self.done = true;
                return;
            }
            let payload: ChunkPayload = match serde_json::from_str(data) {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed stream chunk");
                    continue;
                }
            };
            for choice in payload.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        self.queue.push_back(Ok(SseEvent::Delta(content)));
                    }
                }
                if choice.finish_reason.is_some() {
                    self.queue.push_back(Ok(SseEvent::Finished));
                    self.done = true;
                    return;
                }
            }
        }
    }
}

/// Earliest event boundary: `\n\n` or `\r\n\r\n`, whichever comes first.
fn find_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|index| (index, 2));
    let crlf = buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| (index, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

impl Stream for SseDeltas {
    type Item = Result<SseEvent, CompletionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.queue.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                    this.drain_events();
                }
                Poll::Ready(Some(Err(error))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    // Trailing bytes without a final blank line still form
                    // one last event.
                    if !this.buffer.is_empty() {
                        let remainder = std::mem::take(&mut this.buffer);
                        this.parse_event(&remainder);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn byte_chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, CompletionError>> + use<> {
        let owned: Vec<Result<Bytes, CompletionError>> = parts
            .iter()
            .map(|part| Ok(Bytes::from(part.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    async fn collect_ok(stream: SseDeltas) -> Vec<SseEvent> {
        stream
            .map(|item| item.expect("stream item should be ok"))
            .collect()
            .await
    }

    fn delta_chunk(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}},\"index\":0}}]}}\n\n",
            serde_json::to_string(content).unwrap()
        )
    }

    #[tokio::test]
    async fn decodes_deltas_and_done_marker() {
        let body = format!(
            "{}{}data: [DONE]\n\n",
            delta_chunk("Hello"),
            delta_chunk(" world")
        );
        let events = collect_ok(SseDeltas::new(byte_chunks(&[&body]))).await;
        assert_eq!(
            events,
            vec![
                SseEvent::Delta("Hello".to_string()),
                SseEvent::Delta(" world".to_string()),
                SseEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn reassembles_events_split_across_chunks() {
        let event = delta_chunk("split across reads");
        let (front, back) = event.split_at(17);
        let events = collect_ok(SseDeltas::new(byte_chunks(&[front, back, "data: [DONE]\n\n"])))
            .await;
        assert_eq!(
            events,
            vec![
                SseEvent::Delta("split across reads".to_string()),
                SseEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_not_fatal() {
        let body = format!(
            "data: {{not json}}\n\n{}data: [DONE]\n\n",
            delta_chunk("still here")
        );
        let events = collect_ok(SseDeltas::new(byte_chunks(&[&body]))).await;
        assert_eq!(
            events,
            vec![
                SseEvent::Delta("still here".to_string()),
                SseEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn populated_finish_reason_ends_the_stream() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"done\"},\"finish_reason\":\"stop\"}]}\n\n";
        let events = collect_ok(SseDeltas::new(byte_chunks(&[body]))).await;
        assert_eq!(
            events,
            vec![SseEvent::Delta("done".to_string()), SseEvent::Finished]
        );
    }

    #[tokio::test]
    async fn crlf_event_boundaries_are_accepted() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"crlf\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        let events = collect_ok(SseDeltas::new(byte_chunks(&[body]))).await;
        assert_eq!(
            events,
            vec![SseEvent::Delta("crlf".to_string()), SseEvent::Finished]
        );
    }

    #[tokio::test]
    async fn empty_deltas_are_not_surfaced() {
        let body = format!("{}data: [DONE]\n\n", delta_chunk(""));
        let events = collect_ok(SseDeltas::new(byte_chunks(&[&body]))).await;
        assert_eq!(events, vec![SseEvent::Finished]);
    }

    #[tokio::test]
    async fn transport_error_is_passed_through_and_terminal() {
        let items: Vec<Result<Bytes, CompletionError>> = vec![
            Ok(Bytes::from(delta_chunk("partial"))),
            Err(CompletionError::Stream("connection reset".to_string())),
        ];
        let mut stream = SseDeltas::new(futures::stream::iter(items));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            SseEvent::Delta("partial".to_string())
        );
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
