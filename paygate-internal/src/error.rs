use std::fmt::{Debug, Display};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

/// Controls whether to include upstream response details in error output
///
/// When true, raw upstream error bodies are included in log lines and in the
/// error bodies returned to callers. Only enable this for local debugging.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn debug_enabled() -> bool {
    *DEBUG.get().unwrap_or(&false)
}

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if debug_enabled() {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    InsufficientCredit {
        required: u64,
        available: u64,
    },
    InvalidCredential {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    MalformedRequest {
        message: String,
    },
    Observability {
        message: String,
    },
    OriginCapReached {
        limit: u64,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Storage {
        message: String,
    },
    UnknownCredential,
    UpstreamMidStream {
        message: String,
    },
    UpstreamProtocol {
        message: String,
        status_code: Option<StatusCode>,
        raw_response: Option<String>,
    },
    UpstreamTimeout {
        timeout: Duration,
    },
    UpstreamUnreachable {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InsufficientCredit { .. } => tracing::Level::INFO,
            ErrorDetails::InvalidCredential { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::MalformedRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::OriginCapReached { .. } => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Storage { .. } => tracing::Level::ERROR,
            ErrorDetails::UnknownCredential => tracing::Level::WARN,
            ErrorDetails::UpstreamMidStream { .. } => tracing::Level::WARN,
            ErrorDetails::UpstreamProtocol { .. } => tracing::Level::ERROR,
            ErrorDetails::UpstreamTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::UpstreamUnreachable { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            ErrorDetails::InvalidCredential { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::OriginCapReached { .. } => StatusCode::CONFLICT,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UnknownCredential => StatusCode::UNAUTHORIZED,
            ErrorDetails::UpstreamMidStream { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::UpstreamProtocol { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// The OpenAI-style `type` field for the error body
    fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::InvalidCredential { .. } | ErrorDetails::UnknownCredential => {
                "authentication_error"
            }
            ErrorDetails::InsufficientCredit { .. } => "insufficient_quota",
            ErrorDetails::InvalidRequest { .. }
            | ErrorDetails::MalformedRequest { .. }
            | ErrorDetails::OriginCapReached { .. }
            | ErrorDetails::RouteNotFound { .. } => "invalid_request_error",
            ErrorDetails::UpstreamMidStream { .. }
            | ErrorDetails::UpstreamProtocol { .. }
            | ErrorDetails::UpstreamTimeout { .. }
            | ErrorDetails::UpstreamUnreachable { .. } => "upstream_error",
            _ => "internal_error",
        }
    }

    /// The OpenAI-style `code` field for the error body
    fn error_code(&self) -> &'static str {
        match self {
            ErrorDetails::AppState { .. } => "app_state",
            ErrorDetails::Config { .. } => "config",
            ErrorDetails::InsufficientCredit { .. } => "insufficient_credit",
            ErrorDetails::InvalidCredential { .. } => "invalid_credential",
            ErrorDetails::InvalidRequest { .. } => "invalid_request",
            ErrorDetails::MalformedRequest { .. } => "malformed_request",
            ErrorDetails::Observability { .. } => "observability",
            ErrorDetails::OriginCapReached { .. } => "origin_cap_reached",
            ErrorDetails::RouteNotFound { .. } => "route_not_found",
            ErrorDetails::Storage { .. } => "storage",
            ErrorDetails::UnknownCredential => "unknown_credential",
            ErrorDetails::UpstreamMidStream { .. } => "upstream_mid_stream_failure",
            ErrorDetails::UpstreamProtocol { .. } => "upstream_protocol_error",
            ErrorDetails::UpstreamTimeout { .. } => "upstream_timeout",
            ErrorDetails::UpstreamUnreachable { .. } => "upstream_unreachable",
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InsufficientCredit {
                required,
                available,
            } => write!(
                f,
                "Insufficient credit: {required} required, {available} available"
            ),
            ErrorDetails::InvalidCredential { message } => {
                write!(f, "Invalid credential: {message}")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::MalformedRequest { message } => {
                write!(f, "Malformed request body: {message}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::OriginCapReached { limit } => {
                write!(f, "Too many accounts from this origin (limit: {limit})")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Storage { message } => write!(f, "Storage error: {message}"),
            ErrorDetails::UnknownCredential => write!(f, "Unknown credential"),
            ErrorDetails::UpstreamMidStream { message } => {
                write!(f, "Upstream stream failed: {message}")
            }
            ErrorDetails::UpstreamProtocol {
                message,
                status_code,
                raw_response,
            } => {
                match status_code {
                    Some(status) => write!(f, "Upstream returned {status}: {message}")?,
                    None => write!(f, "Upstream protocol error: {message}")?,
                }
                if debug_enabled() {
                    if let Some(raw_response) = raw_response {
                        write!(f, "\nRaw response: {raw_response}")?;
                    }
                }
                Ok(())
            }
            ErrorDetails::UpstreamTimeout { timeout } => {
                write!(f, "Upstream did not finish within {}ms", timeout.as_millis())
            }
            ErrorDetails::UpstreamUnreachable { message } => {
                write!(f, "Upstream unreachable: {message}")
            }
        }
    }
}

impl Error {
    /// Get the JSON response body that would be sent to clients
    /// Returns (StatusCode, JSON Value) tuple matching what into_response() creates
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let details = self.get_details();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": details.error_type(),
                "code": details.error_code(),
            }
        });
        (self.status_code(), body)
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credit_error() {
        let error = Error::new(ErrorDetails::InsufficientCredit {
            required: 7,
            available: 3,
        });

        assert_eq!(
            error.to_string(),
            "Insufficient credit: 7 required, 3 available"
        );
        assert_eq!(error.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(error.get_details().level(), tracing::Level::INFO);
    }

    #[test]
    fn test_credential_errors_are_unauthorized() {
        let invalid = Error::new(ErrorDetails::InvalidCredential {
            message: "wrong length".to_string(),
        });
        let unknown = Error::new(ErrorDetails::UnknownCredential);

        assert_eq!(invalid.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_upstream_errors_are_5xx() {
        let errors = [
            ErrorDetails::UpstreamUnreachable {
                message: "connection refused".to_string(),
            },
            ErrorDetails::UpstreamProtocol {
                message: "bad json".to_string(),
                status_code: Some(StatusCode::BAD_REQUEST),
                raw_response: None,
            },
            ErrorDetails::UpstreamMidStream {
                message: "reset".to_string(),
            },
            ErrorDetails::UpstreamTimeout {
                timeout: Duration::from_secs(1),
            },
        ];
        for details in errors {
            assert!(Error::new(details).status_code().is_server_error());
        }
    }

    #[test]
    fn test_response_json_shape() {
        let error = Error::new(ErrorDetails::OriginCapReached { limit: 10 });
        let (status, body) = error.to_response_json();

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "origin_cap_reached");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(
            body["error"]["message"],
            "Too many accounts from this origin (limit: 10)"
        );
    }

    #[test]
    fn test_error_into_response() {
        let error = Error::new(ErrorDetails::MalformedRequest {
            message: "expected object".to_string(),
        });

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
