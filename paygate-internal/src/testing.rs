#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode};
use bytes::Bytes;

use crate::auth::{AccountToken, Identity};
use crate::config_parser::Config;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::store::{AccountStore, MemoryAccountStore, NewAccount};
use crate::upstream::{ChunkStream, CompletionRequest, UpstreamProvider, UpstreamResponse};

/// Scripted behavior of a [`MockUpstream`] streaming session
#[derive(Debug, Clone)]
pub enum MockStream {
    /// Sends the chunks, then the end marker
    Complete(Vec<String>),
    /// Sends the chunks, then drops the connection
    FailAfter(Vec<String>),
    /// Sends the chunks, then waits forever
    Hang(Vec<String>),
    /// Rejects the request before opening
    RefuseOpen,
}

#[derive(Debug, Clone)]
pub enum MockBuffered {
    Reply(String),
    Fail,
}

/// Sets a flag when dropped, standing in for an upstream connection
struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockUpstream {
    buffered: MockBuffered,
    stream: MockStream,
    released: Arc<AtomicBool>,
    calls: AtomicUsize,
}

impl MockUpstream {
    pub fn new(buffered: MockBuffered, stream: MockStream) -> Self {
        Self {
            buffered,
            stream,
            released: Arc::new(AtomicBool::new(false)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn streaming(stream: MockStream) -> Self {
        Self::new(MockBuffered::Fail, stream)
    }

    pub fn buffered(buffered: MockBuffered) -> Self {
        Self::new(buffered, MockStream::RefuseOpen)
    }

    /// Whether the last opened stream has been dropped
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for MockUpstream {
    async fn complete(&self, _request: &CompletionRequest) -> Result<UpstreamResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.buffered {
            MockBuffered::Reply(body) => Ok(UpstreamResponse {
                status: StatusCode::OK,
                content_type: Some(HeaderValue::from_static("application/json")),
                body: Bytes::from(body.clone()),
            }),
            MockBuffered::Fail => Err(Error::new(ErrorDetails::UpstreamUnreachable {
                message: "mock upstream is down".to_string(),
            })),
        }
    }

    async fn open_stream(&self, _request: &CompletionRequest) -> Result<ChunkStream, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        let guard = ReleaseGuard(self.released.clone());
        let (chunks, ending) = match self.stream.clone() {
            MockStream::RefuseOpen => {
                return Err(Error::new(ErrorDetails::UpstreamProtocol {
                    message: "request was not accepted".to_string(),
                    status_code: Some(StatusCode::SERVICE_UNAVAILABLE),
                    raw_response: None,
                }))
            }
            MockStream::Complete(chunks) => (chunks, MockEnding::Done),
            MockStream::FailAfter(chunks) => (chunks, MockEnding::Fail),
            MockStream::Hang(chunks) => (chunks, MockEnding::Hang),
        };

        Ok(Box::pin(stream! {
            let _guard = guard;
            for chunk in chunks {
                yield Ok(chunk);
            }
            match ending {
                MockEnding::Done => {}
                MockEnding::Fail => {
                    yield Err(Error::new(ErrorDetails::UpstreamMidStream {
                        message: "mock connection reset".to_string(),
                    }));
                }
                MockEnding::Hang => std::future::pending::<()>().await,
            }
        }))
    }
}

enum MockEnding {
    Done,
    Fail,
    Hang,
}

pub fn get_unit_test_app_state_data(
    config: Config,
    upstream: Arc<dyn UpstreamProvider>,
) -> (AppStateData, Arc<MemoryAccountStore>) {
    let store = Arc::new(MemoryAccountStore::default());
    let account_store: Arc<dyn AccountStore> = store.clone();
    let state = AppStateData::from_parts(Arc::new(config), account_store, upstream).unwrap();
    (state, store)
}

pub async fn insert_account(store: &MemoryAccountStore, free_credits: u64, credits: u64) -> Identity {
    let token = AccountToken::generate();
    let account = store
        .insert(
            &token,
            NewAccount {
                origin: "192.0.2.10".to_string(),
                credits,
                free_credits,
            },
        )
        .await;
    Identity { token, account }
}
