use crate::backend::StreamEvent;
use crate::error::{ErrorKind, TEXT_PLAIN_UTF_8, plain_error_response};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

pub const DATA_STREAM_HEADER: HeaderName = HeaderName::from_static("x-vercel-ai-data-stream");

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("response head already sent")]
    AlreadyStarted,
    #[error("response head not sent yet")]
    NotStarted,
    #[error("response receiver closed")]
    Closed,
}

/// Destination of a relayed response. `start` commits status and headers and
/// must precede every `write`.
#[async_trait]
pub trait ResponseSink: Send {
    async fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), SinkError>;
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    /// Failure after the head was committed; the body just ends.
    Truncated,
    /// Failure before anything was committed; a clean error response was sent.
    Rejected(ErrorKind),
    Disconnected,
}

impl RelayOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Truncated => "truncated",
            Self::Rejected(_) => "rejected",
            Self::Disconnected => "disconnected",
        }
    }
}

pub fn stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN_UTF_8));
    headers.insert(DATA_STREAM_HEADER, HeaderValue::from_static("v1"));
    headers
}

/// One data-stream line for `event`. Errors and empty deltas have no frame.
pub fn encode_frame(event: &StreamEvent) -> Option<Bytes> {
    let (code, payload) = match event {
        StreamEvent::ContentDelta(text) if text.is_empty() => return None,
        StreamEvent::ContentDelta(text) => ('0', json!(text)),
        StreamEvent::ToolCallRequested { id, name, args } => (
            '9',
            json!({ "toolCallId": id, "toolName": name, "args": args }),
        ),
        StreamEvent::ToolCallResult { id, result } => {
            ('a', json!({ "toolCallId": id, "result": result }))
        }
        StreamEvent::Done {
            finish_reason,
            usage,
        } => ('d', json!({ "finishReason": finish_reason, "usage": usage })),
        StreamEvent::Error(_) => return None,
    };
    Some(Bytes::from(format!("{code}:{payload}\n")))
}

/// Forwards `events` to `sink`. The first event decides the status: an
/// immediate error becomes a clean error response, anything else commits 200.
/// The sink is closed exactly once on every path.
pub async fn relay<S, K>(mut events: S, sink: &mut K) -> RelayOutcome
where
    S: Stream<Item = StreamEvent> + Unpin,
    K: ResponseSink + ?Sized,
{
    let outcome = forward(&mut events, sink).await;
    sink.close().await;
    outcome
}

async fn forward<S, K>(events: &mut S, sink: &mut K) -> RelayOutcome
where
    S: Stream<Item = StreamEvent> + Unpin,
    K: ResponseSink + ?Sized,
{
    let mut current = match events.next().await {
        Some(StreamEvent::Error(kind)) => return reject(sink, kind).await,
        Some(event) => event,
        None => {
            tracing::error!("event stream ended before producing anything");
            return reject(sink, ErrorKind::UpstreamFailure).await;
        }
    };
    if sink.start(StatusCode::OK, stream_headers()).await.is_err() {
        return RelayOutcome::Disconnected;
    }
    loop {
        if let StreamEvent::Error(kind) = current {
            tracing::warn!(kind = kind.as_str(), "stream failed after commit, truncating");
            return RelayOutcome::Truncated;
        }
        let done = current.is_terminal();
        if let Some(frame) = encode_frame(&current) {
            if sink.write(frame).await.is_err() {
                return RelayOutcome::Disconnected;
            }
        }
        if done {
            return RelayOutcome::Completed;
        }
        current = match events.next().await {
            Some(event) => event,
            None => {
                tracing::warn!("event stream ended without a terminal event");
                return RelayOutcome::Truncated;
            }
        };
    }
}

async fn reject<K: ResponseSink + ?Sized>(sink: &mut K, kind: ErrorKind) -> RelayOutcome {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN_UTF_8));
    if sink.start(kind.status(), headers).await.is_err() {
        return RelayOutcome::Disconnected;
    }
    if sink.write(Bytes::from_static(kind.body().as_bytes())).await.is_err() {
        return RelayOutcome::Disconnected;
    }
    RelayOutcome::Rejected(kind)
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Sink backed by channels: the head travels through a oneshot, body chunks
/// through a bounded queue that becomes the axum response body.
pub struct ChannelSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::Sender<Bytes>>,
}

pub struct ChannelResponse {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<Bytes>,
}

pub fn channel_sink(buffer: usize) -> (ChannelSink, ChannelResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    (
        ChannelSink {
            head: Some(head_tx),
            body: Some(body_tx),
        },
        ChannelResponse {
            head: head_rx,
            body: body_rx,
        },
    )
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), SinkError> {
        let head = self.head.take().ok_or(SinkError::AlreadyStarted)?;
        head.send(ResponseHead { status, headers })
            .map_err(|_| SinkError::Closed)
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.head.is_some() {
            return Err(SinkError::NotStarted);
        }
        let body = self.body.as_ref().ok_or(SinkError::Closed)?;
        body.send(chunk).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self) {
        self.head = None;
        self.body = None;
    }
}

impl ChannelResponse {
    /// Waits for the relay to commit a head. A relay that vanishes without
    /// committing yields a plain 500.
    pub async fn into_response(self) -> Response {
        let Ok(head) = self.head.await else {
            tracing::error!("relay dropped without committing a response");
            return plain_error_response(ErrorKind::UpstreamFailure);
        };
        let stream = ReceiverStream::new(self.body).map(Ok::<_, Infallible>);
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FinishReason, Usage};
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingSink {
        head: Option<(StatusCode, HeaderMap)>,
        body: Vec<u8>,
        closes: usize,
        fail_writes_after: Option<usize>,
        writes: usize,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), SinkError> {
            if self.head.is_some() {
                return Err(SinkError::AlreadyStarted);
            }
            self.head = Some((status, headers));
            Ok(())
        }

        async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
            if self.fail_writes_after.is_some_and(|n| self.writes >= n) {
                return Err(SinkError::Closed);
            }
            self.writes += 1;
            self.body.extend_from_slice(&chunk);
            Ok(())
        }

        async fn close(&mut self) {
            self.closes += 1;
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens: 5,
                completion_tokens: 2,
            },
        }
    }

    async fn run(events: Vec<StreamEvent>, sink: &mut RecordingSink) -> RelayOutcome {
        relay(futures_util::stream::iter(events), sink).await
    }

    #[tokio::test]
    async fn completed_stream_frames_every_event() {
        let mut sink = RecordingSink::default();
        let outcome = run(
            vec![
                StreamEvent::ContentDelta("Hel".to_string()),
                StreamEvent::ContentDelta(String::new()),
                StreamEvent::ContentDelta("lo \"x\"".to_string()),
                done(),
            ],
            &mut sink,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::Completed);
        let (status, headers) = sink.head.clone().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(&DATA_STREAM_HEADER).unwrap(), "v1");
        let body = String::from_utf8(sink.body.clone()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "0:\"Hel\"");
        assert_eq!(lines[1], "0:\"lo \\\"x\\\"\"");
        let finish: Value = serde_json::from_str(lines[2].strip_prefix("d:").unwrap()).unwrap();
        assert_eq!(
            finish,
            json!({ "finishReason": "stop", "usage": { "promptTokens": 5, "completionTokens": 2 } })
        );
        assert_eq!(sink.closes, 1);
    }

    #[tokio::test]
    async fn error_before_commit_is_a_clean_response() {
        for kind in [
            ErrorKind::BadRequest,
            ErrorKind::Unauthorized,
            ErrorKind::UpstreamFailure,
        ] {
            let mut sink = RecordingSink::default();
            let outcome = run(vec![StreamEvent::Error(kind)], &mut sink).await;
            assert_eq!(outcome, RelayOutcome::Rejected(kind));
            let (status, headers) = sink.head.clone().unwrap();
            assert_eq!(status, kind.status());
            assert_eq!(headers.get(CONTENT_TYPE).unwrap(), TEXT_PLAIN_UTF_8);
            assert_eq!(sink.body, kind.body().as_bytes());
            assert_eq!(sink.closes, 1);
        }
    }

    #[tokio::test]
    async fn error_after_commit_truncates_silently() {
        let mut sink = RecordingSink::default();
        let outcome = run(
            vec![
                StreamEvent::ContentDelta("partial".to_string()),
                StreamEvent::Error(ErrorKind::UpstreamFailure),
                StreamEvent::ContentDelta("never".to_string()),
            ],
            &mut sink,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::Truncated);
        assert_eq!(sink.head.as_ref().unwrap().0, StatusCode::OK);
        assert_eq!(String::from_utf8(sink.body.clone()).unwrap(), "0:\"partial\"\n");
        assert_eq!(sink.closes, 1);
    }

    #[tokio::test]
    async fn empty_stream_is_an_upstream_failure() {
        let mut sink = RecordingSink::default();
        let outcome = run(Vec::new(), &mut sink).await;
        assert_eq!(outcome, RelayOutcome::Rejected(ErrorKind::UpstreamFailure));
        assert_eq!(sink.closes, 1);
    }

    #[tokio::test]
    async fn failed_write_reports_disconnect() {
        let mut sink = RecordingSink {
            fail_writes_after: Some(1),
            ..Default::default()
        };
        let outcome = run(
            vec![
                StreamEvent::ContentDelta("a".to_string()),
                StreamEvent::ContentDelta("b".to_string()),
                done(),
            ],
            &mut sink,
        )
        .await;
        assert_eq!(outcome, RelayOutcome::Disconnected);
        assert_eq!(sink.closes, 1);
    }

    #[test]
    fn tool_frames_use_data_stream_codes() {
        let call = encode_frame(&StreamEvent::ToolCallRequested {
            id: "c1".to_string(),
            name: "getLocation".to_string(),
            args: json!({"consent": true}),
        })
        .unwrap();
        assert!(call.starts_with(b"9:"));
        let parsed: Value = serde_json::from_slice(&call[2..]).unwrap();
        assert_eq!(parsed["toolName"], "getLocation");

        let result = encode_frame(&StreamEvent::ToolCallResult {
            id: "c1".to_string(),
            result: json!("sunny"),
        })
        .unwrap();
        assert!(result.starts_with(b"a:") && result.ends_with(b"\n"));
        let parsed: Value = serde_json::from_slice(&result[2..]).unwrap();
        assert_eq!(parsed, json!({ "toolCallId": "c1", "result": "sunny" }));
        assert!(encode_frame(&StreamEvent::Error(ErrorKind::UpstreamFailure)).is_none());
    }

    #[tokio::test]
    async fn channel_sink_builds_a_streaming_response() {
        let (mut sink, response) = channel_sink(4);
        let relay_task = tokio::spawn(async move {
            relay(
                futures_util::stream::iter(vec![
                    StreamEvent::ContentDelta("Hi".to_string()),
                    done(),
                ]),
                &mut sink,
            )
            .await
        });
        let resp = response.into_response().await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"0:\"Hi\"\n"));
        assert_eq!(relay_task.await.unwrap(), RelayOutcome::Completed);
    }

    #[tokio::test]
    async fn channel_sink_rejects_out_of_order_calls() {
        let (mut sink, _response) = channel_sink(1);
        assert_eq!(
            sink.write(Bytes::from_static(b"x")).await,
            Err(SinkError::NotStarted)
        );
        sink.start(StatusCode::OK, HeaderMap::new()).await.unwrap();
        assert_eq!(
            sink.start(StatusCode::OK, HeaderMap::new()).await,
            Err(SinkError::AlreadyStarted)
        );
    }
}
