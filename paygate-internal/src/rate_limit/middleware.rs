use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::rate_limit::{KeyContext, KeySource, RateLimitDecision, RateLimitHeaders, RateLimiter};

/// Bucket shared by every request for which no key source yields a value
pub const ANONYMOUS_KEY: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub key_sources: Arc<[KeySource]>,
}

/// Admits or rejects a request against its caller's bucket
///
/// Runs after identity resolution on authenticated routes, so a `bearer`
/// key source sees the resolved token.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitError> {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = KeyContext {
        headers: request.headers(),
        remote_addr,
        identity: request.extensions().get::<Identity>(),
    }
    .first_key(&state.key_sources)
    .unwrap_or_else(|| ANONYMOUS_KEY.to_string());

    match state.limiter.admit(&key) {
        RateLimitDecision::Allow(headers) => {
            debug!(key, remaining = headers.remaining, "Rate limit check passed");

            let mut response = next.run(request).await;
            response.headers_mut().extend(headers.to_header_map());
            Ok(response)
        }
        RateLimitDecision::Deny(headers) => {
            warn!(
                key,
                retry_after = ?headers.retry_after,
                "Rate limit exceeded"
            );
            Err(RateLimitError::Exceeded(headers))
        }
    }
}

/// Rate limiting specific errors
#[derive(Debug)]
pub enum RateLimitError {
    Exceeded(RateLimitHeaders),
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            RateLimitError::Exceeded(headers) => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": {
                            "message": "Rate limit exceeded",
                            "type": "rate_limit_error",
                            "code": "rate_limit_exceeded"
                        }
                    })),
                )
                    .into_response();

                response.headers_mut().extend(headers.to_header_map());
                response
            }
        }
    }
}
