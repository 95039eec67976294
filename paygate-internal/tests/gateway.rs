use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

use paygate_internal::config_parser::Config;
use paygate_internal::gateway_util::{start_gateway, AppStateData, ShutdownHandle};

const BUFFERED_REPLY: &str =
    r#"{"id":"chatcmpl-e2e","object":"chat.completion",  "choices":[{"index":0,"message":{"role":"assistant","content":"hello"}}]}"#;
const STREAM_CHUNKS: [&str; 3] = [
    r#"{"id":"c","choices":[{"delta":{"content":"he"}}]}"#,
    r#"{"id":"c","choices":[{"delta":{"content":"ll"}}]}"#,
    r#"{"id":"c","choices":[{"delta":{"content":"o"}}]}"#,
];

#[derive(Clone, Default)]
struct MockState {
    /// Last request body the mock provider received
    received: Arc<Mutex<Option<Bytes>>>,
    /// `endless` streams whose response body has not been dropped yet
    open_streams: Arc<AtomicUsize>,
}

/// Decrements the open stream count when the response body is dropped
struct OpenStream(Arc<AtomicUsize>);

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An OpenAI-compatible provider whose behavior is picked by the request's `model`
async fn mock_provider(State(state): State<MockState>, body: Bytes) -> Response {
    *state.received.lock().unwrap() = Some(body.clone());
    let request: Value = serde_json::from_slice(&body).unwrap();
    let stream = request["stream"].as_bool().unwrap_or(false);
    match (request["model"].as_str().unwrap(), stream) {
        ("endless", true) => {
            state.open_streams.fetch_add(1, Ordering::SeqCst);
            let open_stream = OpenStream(state.open_streams.clone());
            let body = async_stream::stream! {
                let _open_stream = open_stream;
                yield Ok::<_, Infallible>(Bytes::from(format!("data: {}\n\n", STREAM_CHUNKS[0])));
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    yield Ok(Bytes::from_static(b": keep-alive\n\n"));
                }
            };
            Response::builder()
                .header(CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(body))
                .unwrap()
        }
        ("down", _) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("provider exploded"))
            .unwrap(),
        ("truncated", true) => event_stream(format!("data: {}\n\n", STREAM_CHUNKS[0])),
        (_, true) => {
            let mut body: String = STREAM_CHUNKS
                .iter()
                .map(|chunk| format!("data: {chunk}\n\n"))
                .collect();
            body.push_str("data: [DONE]\n\n");
            event_stream(body)
        }
        (_, false) => Response::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(BUFFERED_REPLY))
            .unwrap(),
    }
}

fn event_stream(body: String) -> Response {
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

struct TestGateway {
    addr: SocketAddr,
    client: Client,
    mock: MockState,
    _shutdown: ShutdownHandle,
}

impl TestGateway {
    async fn start(mut config: Config) -> Self {
        let mock = MockState::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let provider_addr = listener.local_addr().unwrap();
        let provider = Router::new()
            .route("/v1/chat/completions", post(mock_provider))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, provider).await.unwrap();
        });

        config.upstream.api_base = Url::parse(&format!("http://{provider_addr}/v1/")).unwrap();
        config.upstream.api_key_env = None;
        config.verify().unwrap();
        let app_state = AppStateData::new(Arc::new(config)).await.unwrap();
        let (addr, shutdown) = start_gateway(app_state).await.unwrap();

        Self {
            addr,
            client: Client::new(),
            mock,
            _shutdown: shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn provision(&self, origin: &str) -> reqwest::Response {
        self.client
            .put(self.url("/account"))
            .header("x-forwarded-for", origin)
            .send()
            .await
            .unwrap()
    }

    /// Creates an account and returns its bearer credential
    async fn bearer(&self, origin: &str) -> String {
        let response = self.provision(origin).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        format!("Bearer {}", body["token"].as_str().unwrap())
    }

    async fn complete(&self, bearer: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url("/v1/chat/completions"))
            .header(AUTHORIZATION, bearer)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }
}

fn unlimited_config() -> Config {
    let mut config = Config::default();
    config.rate_limits.enabled = false;
    config
}

/// `data` payloads of every `event: message` frame, in order
fn message_data(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|frame| frame.contains("event: message"))
        .filter_map(|frame| {
            frame
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .map(str::to_string)
        })
        .collect()
}

#[tokio::test]
async fn test_provision_then_read_account() {
    let gateway = TestGateway::start(unlimited_config()).await;

    let response = gateway.provision("198.51.100.1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["credits"], 0);
    assert_eq!(created["free_credits"], 50);
    let token = created["token"].as_str().unwrap();
    assert_eq!(token.len(), 64);

    let response = gateway
        .client
        .get(gateway.url("/account"))
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let account: Value = response.json().await.unwrap();
    assert_eq!(account["balance"], 50);
    assert!(account.get("token").is_none());
    assert!(account["created_at"].is_string());
}

#[tokio::test]
async fn test_buffered_completion_is_byte_identical() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let bearer = gateway.bearer("198.51.100.2").await;

    let raw = r#"{"model":"gpt-4o-mini",  "messages":[{"role":"user","content":"hi"}],"temperature":0.2}"#;
    let response = gateway
        .client
        .post(gateway.url("/completions"))
        .header(AUTHORIZATION, &bearer)
        .body(raw)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-paygate-credits-charged"], "1");
    assert_eq!(response.headers()["x-paygate-credits-remaining"], "49");
    assert_eq!(response.text().await.unwrap(), BUFFERED_REPLY);
    let forwarded = gateway.mock.received.lock().unwrap().clone().unwrap();
    assert_eq!(&forwarded[..], raw.as_bytes());
}

#[tokio::test]
async fn test_streaming_completion_relays_chunks_then_done() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let bearer = gateway.bearer("198.51.100.3").await;

    let response = gateway
        .complete(&bearer, &json!({"model": "gpt-4o-mini", "messages": [], "stream": true}))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let data = message_data(&response.text().await.unwrap());
    let mut expected: Vec<String> = STREAM_CHUNKS.iter().map(|c| c.to_string()).collect();
    expected.push("[DONE]".to_string());
    assert_eq!(data, expected);
}

#[tokio::test]
async fn test_mid_stream_failure_ends_without_done() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let bearer = gateway.bearer("198.51.100.4").await;

    let response = gateway
        .complete(&bearer, &json!({"model": "truncated", "messages": [], "stream": true}))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let data = message_data(&response.text().await.unwrap());
    assert_eq!(data, vec![STREAM_CHUNKS[0].to_string()]);
}

#[tokio::test]
async fn test_caller_disconnect_releases_upstream_stream() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let bearer = gateway.bearer("198.51.100.12").await;

    let mut response = gateway
        .complete(&bearer, &json!({"model": "endless", "messages": [], "stream": true}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let first = response.chunk().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains(STREAM_CHUNKS[0]));
    assert_eq!(gateway.mock.open_streams.load(Ordering::SeqCst), 1);

    drop(response);

    tokio::time::timeout(Duration::from_secs(30), async {
        while gateway.mock.open_streams.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("upstream stream was still open after the caller disconnected");
}

#[tokio::test]
async fn test_unauthenticated_account_reads_leave_rate_limit_alone() {
    let gateway = TestGateway::start(Config::default()).await;
    let bearer = gateway.bearer("198.51.100.13").await;

    let response = gateway
        .client
        .get(gateway.url("/account"))
        .header("x-forwarded-for", "198.51.100.14")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The single token for this address is still there for the paying caller
    let response = gateway
        .client
        .post(gateway.url("/completions"))
        .header(AUTHORIZATION, &bearer)
        .header("x-forwarded-for", "198.51.100.14")
        .body(json!({"model": "gpt-4o-mini", "messages": []}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_insufficient_credit() {
    let mut config = unlimited_config();
    config.credits.signup_free_credits = 1;
    let gateway = TestGateway::start(config).await;
    let bearer = gateway.bearer("198.51.100.5").await;
    let body = json!({"model": "gpt-4o-mini", "messages": []});

    assert_eq!(gateway.complete(&bearer, &body).await.status(), StatusCode::OK);

    let response = gateway.complete(&bearer, &body).await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["error"]["type"], "insufficient_quota");
}

#[tokio::test]
async fn test_malformed_credentials_are_rejected() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let body = json!({"model": "gpt-4o-mini", "messages": []});

    for bearer in ["", "Bearer short", "Basic dXNlcjpwYXNz"] {
        let response = gateway.complete(bearer, &body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{bearer:?}");
    }

    let unknown = format!("Bearer {}", "0".repeat(64));
    let response = gateway.complete(&unknown, &body).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(gateway.mock.received.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_rate_limit_rejects_excess_requests() {
    let mut config = Config::default();
    config.rate_limits.requests_per_second = 1.0;
    config.rate_limits.burst_size = 2;
    let gateway = TestGateway::start(config).await;
    // Provisioning is limited under a different address than the completions below
    let bearer = gateway.bearer("198.51.100.6").await;
    let body = json!({"model": "gpt-4o-mini", "messages": []});

    let mut statuses = Vec::new();
    let mut retry_after = None;
    for _ in 0..3 {
        let response = gateway
            .client
            .post(gateway.url("/v1/chat/completions"))
            .header(AUTHORIZATION, &bearer)
            .header("x-forwarded-for", "198.51.100.7")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        if let Some(value) = response.headers().get("retry-after") {
            retry_after = Some(value.to_str().unwrap().parse::<u64>().unwrap());
        }
    }

    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
    assert_eq!(retry_after, Some(1));
}

#[tokio::test]
async fn test_origin_cap() {
    let mut config = unlimited_config();
    config.credits.max_accounts_per_origin = 2;
    let gateway = TestGateway::start(config).await;

    assert_eq!(gateway.provision("198.51.100.8").await.status(), StatusCode::OK);
    assert_eq!(gateway.provision("198.51.100.8").await.status(), StatusCode::OK);
    assert_eq!(
        gateway.provision("198.51.100.8").await.status(),
        StatusCode::CONFLICT
    );
    assert_eq!(gateway.provision("198.51.100.9").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let bearer = gateway.bearer("198.51.100.10").await;

    let response = gateway
        .complete(&bearer, &json!({"model": "down", "messages": []}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = gateway
        .complete(&bearer, &json!({"model": "down", "messages": [], "stream": true}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let gateway = TestGateway::start(unlimited_config()).await;
    let bearer = gateway.bearer("198.51.100.11").await;

    let response = gateway.complete(&bearer, &json!({"messages": []})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_operational_routes() {
    let gateway = TestGateway::start(unlimited_config()).await;

    let health: Value = gateway
        .client
        .get(gateway.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"status": "ok"}));

    let response = gateway
        .client
        .get(gateway.url("/no/such/route"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: Value = response.json().await.unwrap();
    assert!(error["error"]["message"].is_string());
}
