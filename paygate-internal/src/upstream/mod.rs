use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode};
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;

use crate::error::{Error, ErrorDetails};

pub mod openai;

pub use openai::OpenAICompatibleUpstream;

/// Marker the provider sends after its last chunk
pub const DONE_MARKER: &str = "[DONE]";

/// Chunks of one upstream streaming session, in upstream order
///
/// The stream ends (`None`) only after the provider's end marker was seen; a
/// connection that drops earlier yields one `Err` instead. Dropping the stream
/// releases the upstream connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

/// A caller's completion request, kept as the exact bytes it arrived with
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    body: Bytes,
    model: String,
    stream: bool,
}

impl CompletionRequest {
    /// Validates the fields the gateway relies on and nothing else
    pub fn from_bytes(body: Bytes) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(&body).map_err(|e| {
            Error::new(ErrorDetails::MalformedRequest {
                message: e.to_string(),
            })
        })?;
        let Value::Object(object) = value else {
            return Err(Error::new(ErrorDetails::MalformedRequest {
                message: "request body must be a JSON object".to_string(),
            }));
        };
        let model = match object.get("model") {
            Some(Value::String(model)) if !model.is_empty() => model.clone(),
            _ => {
                return Err(Error::new(ErrorDetails::MalformedRequest {
                    message: "`model` must be a non-empty string".to_string(),
                }))
            }
        };
        let stream = match object.get("stream") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(stream)) => *stream,
            Some(_) => {
                return Err(Error::new(ErrorDetails::MalformedRequest {
                    message: "`stream` must be a boolean".to_string(),
                }))
            }
        };
        Ok(Self {
            body,
            model,
            stream,
        })
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }
}

/// A complete, successful upstream reply
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// A language-model completion provider
#[async_trait]
pub trait UpstreamProvider: Debug + Send + Sync {
    /// One request, one response. Non-success statuses are errors.
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamResponse, Error>;

    /// Resolves once the provider has accepted the request, before any chunk is read
    async fn open_stream(&self, request: &CompletionRequest) -> Result<ChunkStream, Error>;
}
