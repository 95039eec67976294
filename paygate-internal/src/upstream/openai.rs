use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource, RequestBuilderExt};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use super::{ChunkStream, CompletionRequest, UpstreamProvider, UpstreamResponse, DONE_MARKER};
use crate::config_parser::UpstreamConfig;
use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};

/// Any provider speaking the OpenAI chat completions protocol
#[derive(Debug, Clone)]
pub struct OpenAICompatibleUpstream {
    client: Client,
    url: Url,
    api_key: Option<SecretString>,
    request_timeout: Duration,
}

impl OpenAICompatibleUpstream {
    pub fn new(client: Client, config: &UpstreamConfig) -> Result<Self, Error> {
        Ok(Self {
            client,
            url: config.chat_completions_url()?,
            api_key: config.api_key(),
            request_timeout: config.request_timeout(),
        })
    }

    fn request(&self, request: &CompletionRequest) -> RequestBuilder {
        let mut builder = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(request.body().clone());
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        builder
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::new(ErrorDetails::UpstreamTimeout {
                timeout: self.request_timeout,
            })
        } else {
            Error::new(ErrorDetails::UpstreamUnreachable {
                message: DisplayOrDebugGateway::new(e).to_string(),
            })
        }
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> Error {
    let raw_response = response.text().await.ok();
    Error::new(ErrorDetails::UpstreamProtocol {
        message: "request was not accepted".to_string(),
        status_code: Some(status),
        raw_response,
    })
}

#[async_trait]
impl UpstreamProvider for OpenAICompatibleUpstream {
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamResponse, Error> {
        let response = self
            .request(request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        tracing::debug!(
            model = request.model(),
            bytes = body.len(),
            "Received buffered upstream response"
        );
        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<ChunkStream, Error> {
        let mut event_source = self.request(request).eventsource().map_err(|e| {
            Error::new(ErrorDetails::UpstreamUnreachable {
                message: format!("Failed to build streaming request: {e}"),
            })
        })?;

        // Wait for the provider to accept the request so open failures surface as
        // a plain error response instead of an empty event stream.
        match event_source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) => {
                return Err(Error::new(ErrorDetails::UpstreamProtocol {
                    message: "stream sent data before opening".to_string(),
                    status_code: None,
                    raw_response: None,
                }))
            }
            Some(Err(e)) => {
                event_source.close();
                return Err(self.open_error(e).await);
            }
            None => {
                return Err(Error::new(ErrorDetails::UpstreamProtocol {
                    message: "stream closed before opening".to_string(),
                    status_code: None,
                    raw_response: None,
                }))
            }
        }
        tracing::debug!(model = request.model(), "Upstream stream opened");

        Ok(Box::pin(read_chunks(event_source)))
    }
}

impl OpenAICompatibleUpstream {
    async fn open_error(&self, e: reqwest_eventsource::Error) -> Error {
        match e {
            reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
                status_error(status, response).await
            }
            reqwest_eventsource::Error::InvalidContentType(content_type, response) => {
                Error::new(ErrorDetails::UpstreamProtocol {
                    message: format!("unexpected content type {content_type:?} for a stream"),
                    status_code: Some(response.status()),
                    raw_response: response.text().await.ok(),
                })
            }
            reqwest_eventsource::Error::Transport(e) => self.transport_error(e),
            e => Error::new(ErrorDetails::UpstreamUnreachable {
                message: DisplayOrDebugGateway::new(e).to_string(),
            }),
        }
    }
}

/// Forwards each `data` payload verbatim until the end marker
///
/// Any error ends the stream after one `Err`; the event source is never
/// allowed to reconnect.
fn read_chunks(mut event_source: EventSource) -> impl futures::Stream<Item = Result<String, Error>> {
    stream! {
        loop {
            match event_source.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => {
                    if message.data == DONE_MARKER {
                        break;
                    }
                    yield Ok(message.data);
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    yield Err(Error::new(ErrorDetails::UpstreamMidStream {
                        message: "stream closed before the end marker".to_string(),
                    }));
                    break;
                }
                Some(Err(e)) => {
                    yield Err(Error::new(ErrorDetails::UpstreamMidStream {
                        message: DisplayOrDebugGateway::new(e).to_string(),
                    }));
                    break;
                }
            }
        }
        event_source.close();
    }
}
