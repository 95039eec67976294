use axum::Json;
use serde_json::{json, Value};

pub const PAYGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler() -> Json<Value> {
    Json(json!({"status": "ok", "version": PAYGATE_VERSION}))
}

/// A handler for a health check that load balancers can poll
pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_handler() {
        let Json(body) = status_handler().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], PAYGATE_VERSION);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body, json!({"status": "ok"}));
    }
}
