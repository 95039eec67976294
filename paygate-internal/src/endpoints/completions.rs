use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tracing::instrument;

use crate::auth::Identity;
use crate::credits::Receipt;
use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData};
use crate::upstream::CompletionRequest;

/// A handler for `POST /completions` and `POST /v1/chat/completions`
///
/// The body is validated only as far as the `model` and `stream` fields and
/// is otherwise forwarded untouched. The fee is charged before the upstream
/// is contacted; a failure that happens before any output reaches the caller
/// is refunded when `credits.refund_policy` allows it.
#[instrument(
    name = "completion",
    skip_all,
    fields(
        token = tracing::field::Empty,
        model = tracing::field::Empty,
        stream = tracing::field::Empty,
    )
)]
pub async fn completion_handler(
    State(app_state): AppState,
    Extension(identity): Extension<Identity>,
    body: Bytes,
) -> Result<Response, Error> {
    let request = CompletionRequest::from_bytes(body)?;
    let span = tracing::Span::current();
    span.record("token", identity.token.fingerprint());
    span.record("model", request.model());
    span.record("stream", request.is_stream());

    let receipt = app_state
        .credit_gate
        .charge(&identity, app_state.config.credits.completion_fee)
        .await?;

    let result = if request.is_stream() {
        stream_completion(&app_state, &request, &receipt).await
    } else {
        buffered_completion(&app_state, &request, &receipt).await
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            refund(&app_state, &identity, &receipt).await;
            Err(e)
        }
    }
}

async fn buffered_completion(
    app_state: &AppStateData,
    request: &CompletionRequest,
    receipt: &Receipt,
) -> Result<Response, Error> {
    let upstream = app_state.relay.buffered(request).await?;
    let mut response = (upstream.status, upstream.body).into_response();
    let headers = response.headers_mut();
    match upstream.content_type {
        Some(content_type) => {
            headers.insert(CONTENT_TYPE, content_type);
        }
        None => {
            headers.remove(CONTENT_TYPE);
        }
    }
    headers.extend(receipt.to_header_map());
    Ok(response)
}

/// Returns once the upstream has accepted the request; chunks follow as events
async fn stream_completion(
    app_state: &AppStateData,
    request: &CompletionRequest,
    receipt: &Receipt,
) -> Result<Response, Error> {
    let session = app_state.relay.open_stream(request).await?;
    let mut response = session.into_sse().into_response();
    response.headers_mut().extend(receipt.to_header_map());
    Ok(response)
}

async fn refund(app_state: &AppStateData, identity: &Identity, receipt: &Receipt) {
    if let Err(e) = app_state
        .credit_gate
        .refund_upstream_failure(identity, receipt)
        .await
    {
        tracing::warn!("Failed to refund charge: {e}");
    }
}
