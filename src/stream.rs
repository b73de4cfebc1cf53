//! Pull-based decoder for streamed completion responses.
//!
//! The service answers a streaming request with an event stream:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! : keep-alive
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! [`CompletionStream`] reads that body line by line, ignores everything that is
//! not a `data:` line, stops at `[DONE]` and decodes every other payload into the
//! mode-specific chunk type. Once a session has finished, failed or been
//! cancelled, the response body is released and every later pull repeats the
//! same outcome.

use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame_reader::FrameReader;
use crate::types::{ChatCompletionStreamResponse, FimCompletionStreamResponse};
use crate::Error;

/// Marker that starts every payload-carrying line.
pub const DATA_PREFIX: &str = "data:";

/// Payload that signals a deliberate end of stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Response body as delivered by `reqwest`.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Streaming chat completion session.
pub type ChatCompletionStream<S = ByteStream> = CompletionStream<ChatCompletionStreamResponse, S>;

/// Streaming fill-in-middle completion session.
pub type FimCompletionStream<S = ByteStream> = CompletionStream<FimCompletionStreamResponse, S>;

/// Decodes the payload of one `data:` frame into a typed chunk.
pub trait StreamPayload: Sized {
    /// Short name of the completion mode, used in log events.
    const MODE: &'static str;

    /// Parse one `data:` payload.
    fn decode(payload: &str) -> Result<Self, serde_json::Error>;
}

/// What to do when the body ends without a `[DONE]` frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndOfStreamPolicy {
    /// Treat the closed connection as a normal end of stream.
    #[default]
    Lenient,
    /// Fail the session with [`Error::IncompleteStream`].
    Strict,
}

#[derive(Debug)]
enum State {
    Open,
    Finished,
    Failed(Error),
    Cancelled,
}

/// A live streaming response.
///
/// Pull chunks with [`recv`](Self::recv) until it returns `Ok(None)`. The body
/// is released exactly once: when `[DONE]` arrives, on the first error, on
/// cancellation, on [`close`](Self::close), or when the session is dropped,
/// whichever comes first.
pub struct CompletionStream<T, S = ByteStream> {
    reader: Option<FrameReader<S>>,
    state: State,
    cancel: CancellationToken,
    status: u16,
    end_of_stream: EndOfStreamPolicy,
    _payload: PhantomData<fn() -> T>,
}

impl<T: StreamPayload, S> CompletionStream<T, S> {
    /// Start a session over an open response body.
    ///
    /// The session listens on a child of `cancel`: cancelling the caller's token
    /// stops the session, while [`close`](Self::close) only affects this session.
    pub fn new(body: S, cancel: &CancellationToken) -> Self {
        Self {
            reader: Some(FrameReader::new(body)),
            state: State::Open,
            cancel: cancel.child_token(),
            status: 200,
            end_of_stream: EndOfStreamPolicy::default(),
            _payload: PhantomData,
        }
    }

    /// Record the HTTP status of the response that opened the session.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Choose how a body that ends without `[DONE]` is reported.
    pub fn with_end_of_stream(mut self, policy: EndOfStreamPolicy) -> Self {
        self.end_of_stream = policy;
        self
    }

    /// HTTP status of the response that opened the session.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Token that cancels this session only.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the session has reached a terminal state.
    pub fn is_closed(&self) -> bool {
        !matches!(self.state, State::Open)
    }

    /// Stop the session early and release the response body.
    ///
    /// Later pulls return [`Error::Cancelled`]. Closing a session that already
    /// finished or failed leaves its outcome unchanged.
    pub fn close(&mut self) {
        if matches!(self.state, State::Open) {
            debug!(mode = T::MODE, "stream session closed by caller");
            self.state = State::Cancelled;
        }
        self.cancel.cancel();
        self.release();
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            trace!(
                mode = T::MODE,
                buffered = reader.buffered_len(),
                "releasing response body"
            );
            drop(reader);
        }
    }

    fn finish(&mut self) {
        debug!(mode = T::MODE, "stream finished");
        self.state = State::Finished;
        self.release();
    }

    fn fail(&mut self, error: Error) -> Error {
        self.state = State::Failed(error.clone());
        self.release();
        error
    }

    fn cancelled(&mut self) -> Error {
        debug!(mode = T::MODE, "stream cancelled");
        self.state = State::Cancelled;
        self.cancel.cancel();
        self.release();
        Error::Cancelled
    }

    fn ended_without_sentinel(&mut self) -> Result<Option<T>, Error> {
        warn!(mode = T::MODE, "stream ended without [DONE] sentinel");
        match self.end_of_stream {
            EndOfStreamPolicy::Lenient => {
                self.finish();
                Ok(None)
            }
            EndOfStreamPolicy::Strict => Err(self.fail(Error::IncompleteStream)),
        }
    }
}

impl<T, S, E> CompletionStream<T, S>
where
    T: StreamPayload,
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Error>,
{
    /// Pull the next chunk.
    ///
    /// Returns `Ok(Some(chunk))` for each decoded frame and `Ok(None)` once the
    /// stream has finished. After an error or cancellation the same error is
    /// returned on every call and the body is not read again.
    pub async fn recv(&mut self) -> Result<Option<T>, Error> {
        match &self.state {
            State::Open => {}
            State::Finished => return Ok(None),
            State::Failed(error) => return Err(error.clone()),
            State::Cancelled => return Err(Error::Cancelled),
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            // `None` means cancellation won the race.
            let next = match self.reader.as_mut() {
                Some(reader) => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    line = reader.next_line() => Some(line),
                },
                None => None,
            };

            let line = match next {
                None => return Err(self.cancelled()),
                Some(Ok(Some(line))) => line,
                Some(Ok(None)) => return self.ended_without_sentinel(),
                Some(Err(error)) => {
                    warn!(mode = T::MODE, %error, "stream read failed");
                    return Err(self.fail(error));
                }
            };

            let Some(payload) = data_payload(&line) else {
                trace!(mode = T::MODE, line = %line, "skipping non-data line");
                continue;
            };

            if payload == DONE_SENTINEL {
                self.finish();
                return Ok(None);
            }

            return match T::decode(payload) {
                Ok(chunk) => Ok(Some(chunk)),
                Err(source) => {
                    warn!(
                        mode = T::MODE,
                        payload = %truncate(payload, 120),
                        error = %source,
                        "failed to decode stream frame"
                    );
                    Err(self.fail(Error::decode(payload, source)))
                }
            };
        }
    }

    /// Adapt the session into a `Stream` of chunks.
    ///
    /// The stream ends after `[DONE]` and after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Error>> {
        futures::stream::unfold(Some(self), |session| async move {
            let mut session = session?;
            match session.recv().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(session))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

/// Payload of a `data:` line, or `None` for blank and non-data lines.
pub fn data_payload(line: &str) -> Option<&str> {
    line.trim().strip_prefix(DATA_PREFIX).map(str::trim)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use crate::types::{FinishReason, Role};
    use tokio_test::assert_err;

    type Chunk = Result<Bytes, std::io::Error>;

    /// Byte source that counts how many times it has been released.
    struct CountingBody<St> {
        inner: St,
        released: Arc<AtomicUsize>,
    }

    impl<St: Stream<Item = Chunk> + Unpin> Stream for CountingBody<St> {
        type Item = Chunk;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
            self.inner.poll_next_unpin(cx)
        }
    }

    impl<St> Drop for CountingBody<St> {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lines(text: &str) -> Vec<Chunk> {
        vec![Ok(Bytes::from(text.to_string()))]
    }

    fn chat_session<St: Stream<Item = Chunk> + Unpin>(
        inner: St,
        cancel: &CancellationToken,
    ) -> (ChatCompletionStream<CountingBody<St>>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let body = CountingBody {
            inner,
            released: released.clone(),
        };
        (CompletionStream::new(body, cancel), released)
    }

    #[tokio::test]
    async fn test_single_delta_then_done() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n";
        let (mut session, released) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        let chunk = session.recv().await.unwrap().unwrap();
        assert_eq!(chunk.content(), Some("Hi"));

        assert!(session.recv().await.unwrap().is_none());
        assert!(session.recv().await.unwrap().is_none());
        assert!(session.is_closed());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_arrive_in_frame_order() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"One\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" two\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" three\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let (mut session, _) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        let mut contents = Vec::new();
        while let Some(chunk) = session.recv().await.unwrap() {
            contents.push(chunk.content().unwrap_or_default().to_string());
        }
        assert_eq!(contents, vec!["", "One", " two", " three"]);
        assert!(session.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let chunks = vec![
            Ok(Bytes::from("data: {\"choices\":[{\"de")),
            Ok(Bytes::from("lta\":{\"content\":\"Hi\"}}]}\n")),
            Ok(Bytes::from("\ndata: [DO")),
            Ok(Bytes::from("NE]\n")),
        ];
        let (mut session, _) = chat_session(stream::iter(chunks), &CancellationToken::new());

        assert_eq!(session.recv().await.unwrap().unwrap().content(), Some("Hi"));
        assert!(session.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_and_non_data_lines_are_ignored() {
        let input = concat!(
            ": keep-alive\n",
            "\n",
            "event: message\n",
            "id: 42\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "\n",
            "\n",
            "retry: 1000\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
            ": keep-alive\n",
            "data: [DONE]\n",
        );
        let (mut session, _) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        assert_eq!(session.recv().await.unwrap().unwrap().content(), Some("a"));
        assert_eq!(session.recv().await.unwrap().unwrap().content(), Some("b"));
        assert!(session.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrecognised_enum_values_still_decode() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"developer\",\"content\":\"x\"},\"finish_reason\":\"max_tokens_reached\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let (mut session, released) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        let chunk = session.recv().await.unwrap().unwrap();
        assert_eq!(chunk.content(), Some("x"));
        assert_eq!(chunk.choices[0].delta.role, Some(Role::Unknown));
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Unknown));

        assert!(session.recv().await.unwrap().is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_terminal() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            "data: {\"choices\": [oops\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let (mut session, released) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        assert_eq!(session.recv().await.unwrap().unwrap().content(), Some("ok"));

        let first = assert_err!(session.recv().await);
        match &first {
            Error::Decode { payload, .. } => assert_eq!(payload, "{\"choices\": [oops"),
            other => panic!("Expected decode error, got {other:?}"),
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let second = assert_err!(session.recv().await);
        assert_eq!(second.to_string(), first.to_string());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let chunks = vec![
            Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out")),
            Ok(Bytes::from("data: [DONE]\n")),
        ];
        let (mut session, released) = chat_session(stream::iter(chunks), &CancellationToken::new());

        assert!(session.recv().await.unwrap().is_some());
        let first = assert_err!(session.recv().await);
        assert!(first.to_string().contains("read timed out"));

        let second = assert_err!(session.recv().await);
        assert_eq!(second.to_string(), first.to_string());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_without_sentinel_is_lenient_by_default() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"cut\"}}]}\n";
        let (mut session, released) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        assert!(session.recv().await.unwrap().is_some());
        assert!(session.recv().await.unwrap().is_none());
        assert!(session.recv().await.unwrap().is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strict_end_of_stream_reports_incomplete() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"cut\"}}]}\n";
        let (session, _) = chat_session(stream::iter(lines(input)), &CancellationToken::new());
        let mut session = session.with_end_of_stream(EndOfStreamPolicy::Strict);

        assert!(session.recv().await.unwrap().is_some());
        assert!(matches!(session.recv().await, Err(Error::IncompleteStream)));
        assert!(matches!(session.recv().await, Err(Error::IncompleteStream)));
    }

    #[tokio::test]
    async fn test_cancel_with_pending_data() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let cancel = CancellationToken::new();
        let (mut session, released) = chat_session(stream::iter(lines(input)), &cancel);

        assert_eq!(session.recv().await.unwrap().unwrap().content(), Some("a"));
        cancel.cancel();

        let error = assert_err!(session.recv().await);
        assert!(error.is_cancelled());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        assert!(matches!(session.recv().await, Err(Error::Cancelled)));
        session.close();
        drop(session);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_read() {
        let inner = stream::iter(lines("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"))
            .chain(stream::pending());
        let cancel = CancellationToken::new();
        let (mut session, released) = chat_session(inner, &cancel);

        assert!(session.recv().await.unwrap().is_some());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), session.recv())
            .await
            .expect("pending read was not interrupted");
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_scoped_to_session() {
        let parent = CancellationToken::new();
        let (mut session, released) =
            chat_session(stream::iter(lines("data: [DONE]\n")), &parent);

        session.close();
        session.close();
        assert!(matches!(session.recv().await, Err(Error::Cancelled)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(session.cancellation_token().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_a_no_op() {
        let cancel = CancellationToken::new();
        let (mut session, released) = chat_session(stream::iter(lines("data: [DONE]\n")), &cancel);

        assert!(session.recv().await.unwrap().is_none());
        cancel.cancel();
        session.close();

        assert!(session.recv().await.unwrap().is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_open_session() {
        let (session, released) = chat_session(
            stream::iter(lines("data: {\"choices\":[]}\n")),
            &CancellationToken::new(),
        );
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(session);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fim_mode_uses_the_same_decoder() {
        let input = concat!(
            "data: {\"id\":\"f1\",\"choices\":[{\"text\":\"    a, b\",\"index\":0}]}\n\n",
            "data: {\"id\":\"f1\",\"choices\":[{\"text\":\" = 0, 1\",\"index\":0,\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let body = stream::iter(lines(input));
        let mut session: FimCompletionStream<_> = CompletionStream::new(body, &CancellationToken::new());

        let mut text = String::new();
        while let Some(chunk) = session.recv().await.unwrap() {
            text.push_str(chunk.text().unwrap_or_default());
        }
        assert_eq!(text, "    a, b = 0, 1");
    }

    #[tokio::test]
    async fn test_into_stream_stops_after_error() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: not-json\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        );
        let (session, released) = chat_session(stream::iter(lines(input)), &CancellationToken::new());

        let items: Vec<_> = session.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Decode { .. })));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("  data:   [DONE]  "), Some("[DONE]"));
        assert_eq!(data_payload(""), None);
        assert_eq!(data_payload(": keep-alive"), None);
        assert_eq!(data_payload("event: message"), None);
    }
}
