use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::Instrument;

use crate::config_parser::RelayConfig;
use crate::error::Error;
use crate::upstream::{ChunkStream, CompletionRequest, UpstreamProvider, UpstreamResponse, DONE_MARKER};

/// SSE event name used for every frame sent to the caller
pub const EVENT_NAME: &str = "message";

/// An item passed from the upstream reader to the caller writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayItem {
    Chunk(String),
    /// Sent once, after the last chunk of a completed session
    Done,
}

/// How a streaming session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    UpstreamFailed,
    CallerDisconnected,
    TimedOut,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::UpstreamFailed => "upstream_failed",
            SessionOutcome::CallerDisconnected => "caller_disconnected",
            SessionOutcome::TimedOut => "timed_out",
        }
    }
}

/// Bridges upstream responses to callers
#[derive(Debug, Clone)]
pub struct StreamRelay {
    upstream: Arc<dyn UpstreamProvider>,
    queue_capacity: usize,
    session_timeout: Option<Duration>,
}

impl StreamRelay {
    pub fn new(upstream: Arc<dyn UpstreamProvider>, config: &RelayConfig) -> Self {
        Self {
            upstream,
            // `mpsc::channel` panics on a zero capacity
            queue_capacity: config.queue_capacity.max(1),
            session_timeout: config.session_timeout(),
        }
    }

    /// One upstream call whose full result goes back as one response
    pub async fn buffered(&self, request: &CompletionRequest) -> Result<UpstreamResponse, Error> {
        self.upstream.complete(request).await
    }

    /// Opens the upstream stream and starts a session reading from it
    ///
    /// Fails without side effects if the upstream does not accept the request.
    pub async fn open_stream(&self, request: &CompletionRequest) -> Result<RelaySession, Error> {
        let chunks = self.upstream.open_stream(request).await?;
        Ok(RelaySession::start(
            chunks,
            self.queue_capacity,
            self.session_timeout,
        ))
    }
}

/// One in-flight streaming request
///
/// A producer task reads the upstream and fills a bounded queue; the owner of
/// the session drains it. Dropping the session (or calling [`cancel`]) tells
/// the producer to stop, which releases the upstream connection.
///
/// [`cancel`]: RelaySession::cancel
#[derive(Debug)]
pub struct RelaySession {
    events: mpsc::Receiver<RelayItem>,
    cancel: Option<oneshot::Sender<()>>,
    producer: Option<JoinHandle<SessionOutcome>>,
}

impl RelaySession {
    pub fn start(chunks: ChunkStream, queue_capacity: usize, timeout: Option<Duration>) -> Self {
        let (tx, events) = mpsc::channel(queue_capacity.max(1));
        let (cancel, cancelled) = oneshot::channel();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let producer = tokio::spawn(
            async move {
                let started = Instant::now();
                let (outcome, chunks_sent) = produce(chunks, tx, cancelled, deadline).await;
                record_outcome(outcome, chunks_sent, started.elapsed());
                outcome
            }
            .instrument(tracing::Span::current()),
        );

        Self {
            events,
            cancel: Some(cancel),
            producer: Some(producer),
        }
    }

    /// Next queued item; `None` once the producer has stopped and the queue is empty
    pub async fn next_item(&mut self) -> Option<RelayItem> {
        self.events.recv().await
    }

    /// Stops the producer; nothing more is delivered after this returns
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.events.close();
        // Discard anything the producer queued before it saw the signal
        while self.events.try_recv().is_ok() {}
    }

    /// Handle to the producer task, resolving to the session outcome
    pub fn take_producer(&mut self) -> Option<JoinHandle<SessionOutcome>> {
        self.producer.take()
    }

    /// Caller-facing event stream: one frame per chunk and a final `[DONE]` frame
    ///
    /// The stream ends without the final frame when the upstream fails or the
    /// session times out.
    pub fn into_event_stream(mut self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
        stream! {
            while let Some(item) = self.next_item().await {
                match item {
                    RelayItem::Chunk(chunk) => {
                        yield Ok(message_event(&chunk));
                    }
                    RelayItem::Done => {
                        yield Ok(message_event(DONE_MARKER));
                        break;
                    }
                }
            }
        }
    }

    pub fn into_sse(self) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
        Sse::new(self.into_event_stream()).keep_alive(KeepAlive::new())
    }
}

fn message_event(data: &str) -> Event {
    // `Event::data` rejects carriage returns
    let event = Event::default().event(EVENT_NAME);
    if data.contains('\r') {
        event.data(data.replace('\r', ""))
    } else {
        event.data(data)
    }
}

async fn produce(
    mut chunks: ChunkStream,
    tx: mpsc::Sender<RelayItem>,
    mut cancelled: oneshot::Receiver<()>,
    deadline: Option<Instant>,
) -> (SessionOutcome, usize) {
    let timeout = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout);
    let mut chunks_sent = 0;

    loop {
        // Either value of `cancelled` means stop: an explicit signal, or the session was dropped
        let item = tokio::select! {
            biased;
            _ = &mut cancelled => return (SessionOutcome::CallerDisconnected, chunks_sent),
            () = &mut timeout => return (SessionOutcome::TimedOut, chunks_sent),
            next = chunks.next() => match next {
                Some(Ok(chunk)) => RelayItem::Chunk(chunk),
                // Already logged when the error was built
                Some(Err(_)) => return (SessionOutcome::UpstreamFailed, chunks_sent),
                None => RelayItem::Done,
            },
        };
        let done = item == RelayItem::Done;

        tokio::select! {
            biased;
            _ = &mut cancelled => return (SessionOutcome::CallerDisconnected, chunks_sent),
            () = &mut timeout => return (SessionOutcome::TimedOut, chunks_sent),
            sent = tx.send(item) => {
                if sent.is_err() {
                    return (SessionOutcome::CallerDisconnected, chunks_sent);
                }
            }
        }

        if done {
            return (SessionOutcome::Completed, chunks_sent);
        }
        chunks_sent += 1;
    }
}

fn record_outcome(outcome: SessionOutcome, chunks: usize, elapsed: Duration) {
    metrics::counter!("paygate_relay_sessions_total", "outcome" => outcome.as_str()).increment(1);
    let elapsed_ms = elapsed.as_millis();
    match outcome {
        SessionOutcome::Completed | SessionOutcome::CallerDisconnected => tracing::info!(
            outcome = outcome.as_str(),
            chunks,
            elapsed_ms,
            "Relay session finished"
        ),
        SessionOutcome::UpstreamFailed | SessionOutcome::TimedOut => tracing::warn!(
            outcome = outcome.as_str(),
            chunks,
            elapsed_ms,
            "Relay session finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockStream, MockUpstream};
    use bytes::Bytes;
    use tracing_test::traced_test;

    fn request() -> CompletionRequest {
        CompletionRequest::from_bytes(Bytes::from_static(br#"{"model":"m","stream":true}"#))
            .unwrap()
    }

    fn chunks(n: usize) -> Vec<String> {
        (0..n).map(|i| format!(r#"{{"i":{i}}}"#)).collect()
    }

    fn relay(upstream: &Arc<MockUpstream>, config: RelayConfig) -> StreamRelay {
        StreamRelay::new(upstream.clone(), &config)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_completed_session_delivers_chunks_then_done() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::Complete(chunks(25))));
        let mut session = relay(&upstream, RelayConfig::default())
            .open_stream(&request())
            .await
            .unwrap();
        let producer = session.take_producer().unwrap();

        let mut items = Vec::new();
        while let Some(item) = session.next_item().await {
            items.push(item);
        }

        let mut expected: Vec<_> = chunks(25).into_iter().map(RelayItem::Chunk).collect();
        expected.push(RelayItem::Done);
        assert_eq!(items, expected);
        assert_eq!(producer.await.unwrap(), SessionOutcome::Completed);
        assert!(upstream.released());
        assert!(logs_contain("Relay session finished"));
        assert!(logs_contain("outcome=\"completed\""));
    }

    #[tokio::test]
    async fn test_upstream_failure_ends_without_done() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::FailAfter(chunks(3))));
        let mut session = relay(&upstream, RelayConfig::default())
            .open_stream(&request())
            .await
            .unwrap();
        let producer = session.take_producer().unwrap();

        let mut items = Vec::new();
        while let Some(item) = session.next_item().await {
            items.push(item);
        }

        assert_eq!(
            items,
            chunks(3).into_iter().map(RelayItem::Chunk).collect::<Vec<_>>()
        );
        assert_eq!(producer.await.unwrap(), SessionOutcome::UpstreamFailed);
        assert!(upstream.released());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_and_releases_upstream() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::Hang(chunks(50))));
        let mut session = relay(
            &upstream,
            RelayConfig {
                queue_capacity: 2,
                session_timeout_ms: None,
            },
        )
        .open_stream(&request())
        .await
        .unwrap();
        let producer = session.take_producer().unwrap();

        for i in 0..3 {
            assert_eq!(
                session.next_item().await,
                Some(RelayItem::Chunk(format!(r#"{{"i":{i}}}"#)))
            );
        }
        session.cancel();
        assert_eq!(session.next_item().await, None);

        let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::CallerDisconnected);
        assert!(upstream.released());
    }

    #[tokio::test]
    async fn test_dropping_session_releases_upstream() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::Hang(chunks(1))));
        let mut session = relay(&upstream, RelayConfig::default())
            .open_stream(&request())
            .await
            .unwrap();
        let producer = session.take_producer().unwrap();

        assert!(session.next_item().await.is_some());
        drop(session);

        let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::CallerDisconnected);
        assert!(upstream.released());
    }

    #[tokio::test]
    async fn test_session_timeout() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::Hang(chunks(2))));
        let mut session = relay(
            &upstream,
            RelayConfig {
                queue_capacity: 10,
                session_timeout_ms: Some(50),
            },
        )
        .open_stream(&request())
        .await
        .unwrap();
        let producer = session.take_producer().unwrap();

        let mut items = Vec::new();
        while let Some(item) = session.next_item().await {
            items.push(item);
        }

        assert_eq!(items.len(), 2);
        assert!(!items.contains(&RelayItem::Done));
        assert_eq!(producer.await.unwrap(), SessionOutcome::TimedOut);
        assert!(upstream.released());
    }

    #[tokio::test]
    async fn test_open_failure_starts_no_session() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::RefuseOpen));
        let error = relay(&upstream, RelayConfig::default())
            .open_stream(&request())
            .await
            .unwrap_err();
        assert!(error.status_code().is_server_error());
    }

    #[tokio::test]
    async fn test_event_stream_frames() {
        let upstream = Arc::new(MockUpstream::streaming(MockStream::Complete(vec![
            "{\"a\":1}".to_string(),
            "line\r\nbreak".to_string(),
        ])));
        let session = relay(&upstream, RelayConfig::default())
            .open_stream(&request())
            .await
            .unwrap();

        let events: Vec<_> = session.into_event_stream().collect().await;
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(SessionOutcome::Completed.as_str(), "completed");
        assert_eq!(SessionOutcome::UpstreamFailed.as_str(), "upstream_failed");
        assert_eq!(
            SessionOutcome::CallerDisconnected.as_str(),
            "caller_disconnected"
        );
        assert_eq!(SessionOutcome::TimedOut.as_str(), "timed_out");
    }
}
