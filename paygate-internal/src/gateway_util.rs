use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use tokio::sync::oneshot::Sender;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::auth::{require_bearer, IdentityResolver};
use crate::config_parser::Config;
use crate::credits::CreditGate;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitState, RateLimiter};
use crate::relay::StreamRelay;
use crate::store::{setup_account_store, AccountStore};
use crate::upstream::{OpenAICompatibleUpstream, UpstreamProvider};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub account_store: Arc<dyn AccountStore>,
    pub identity_resolver: IdentityResolver,
    /// `None` when `rate_limits.enabled = false`
    pub rate_limit: Option<RateLimitState>,
    pub credit_gate: CreditGate,
    pub relay: StreamRelay,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = setup_http_client()?;
        let upstream: Arc<dyn UpstreamProvider> = Arc::new(OpenAICompatibleUpstream::new(
            http_client,
            &config.upstream,
        )?);
        let account_store = setup_account_store(&config.storage).await?;
        Self::from_parts(config, account_store, upstream)
    }

    /// Wires the components around an already constructed store and upstream
    pub fn from_parts(
        config: Arc<Config>,
        account_store: Arc<dyn AccountStore>,
        upstream: Arc<dyn UpstreamProvider>,
    ) -> Result<Self, Error> {
        let rate_limit = setup_rate_limiter(&config.rate_limits)?;
        Ok(Self {
            identity_resolver: IdentityResolver::new(account_store.clone()),
            credit_gate: CreditGate::new(account_store.clone(), config.credits.refund_policy),
            relay: StreamRelay::new(upstream, &config.relay),
            rate_limit,
            account_store,
            config,
        })
    }

    pub fn is_rate_limiting_enabled(&self) -> bool {
        self.rate_limit.is_some()
    }
}

/// Builds the limiter and starts its sweeper when a runtime is available
pub fn setup_rate_limiter(config: &RateLimitConfig) -> Result<Option<RateLimitState>, Error> {
    if !config.enabled {
        tracing::info!("Rate limiting is disabled");
        return Ok(None);
    }
    let limiter = Arc::new(RateLimiter::new(config)?);
    if tokio::runtime::Handle::try_current().is_ok() {
        limiter.start_sweeper(config.sweep_interval());
    } else {
        tracing::warn!("No async runtime; idle rate limit buckets are only reset lazily");
    }
    tracing::info!(
        requests_per_second = config.requests_per_second,
        burst_size = config.burst_size,
        "Rate limiting enabled"
    );
    Ok(Some(RateLimitState {
        limiter,
        key_sources: config.key_sources.clone().into(),
    }))
}

// This is set high enough that it should never be hit for a normal streaming session.
// Buffered requests carry their own `upstream.request_timeout_ms`.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20 * 60);

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

/// Assembles every route of the gateway
///
/// Layers run in reverse order of application: on completion routes and
/// `GET /account` the bearer check runs first, then the rate limiter, then
/// the handler.
pub fn build_router(app_state: AppStateData, metrics_handle: Option<PrometheusHandle>) -> Router {
    let mut completion_routes = Router::new()
        .route(
            "/completions",
            post(endpoints::completions::completion_handler),
        )
        .route(
            "/v1/chat/completions",
            post(endpoints::completions::completion_handler),
        );
    // `PUT /account` is how callers get a credential, so only `GET` requires one
    let mut get_account = get(endpoints::account::get_account_handler);
    let mut put_account = put(endpoints::account::put_account_handler);
    if let Some(rate_limit) = &app_state.rate_limit {
        let rate_limit_layer =
            axum::middleware::from_fn_with_state(rate_limit.clone(), rate_limit_middleware);
        completion_routes = completion_routes.layer(rate_limit_layer.clone());
        get_account = get_account.route_layer(rate_limit_layer.clone());
        put_account = put_account.route_layer(rate_limit_layer);
    }
    let bearer_layer =
        axum::middleware::from_fn_with_state(app_state.identity_resolver.clone(), require_bearer);
    let completion_routes = completion_routes.layer(bearer_layer.clone());
    let get_account = get_account.route_layer(bearer_layer);
    let account_routes = Router::new().route("/account", get_account.merge(put_account));

    let mut public_routes = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler));
    if let Some(metrics_handle) = metrics_handle {
        public_routes = public_routes.route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        );
    }

    Router::new()
        .merge(completion_routes)
        .merge(account_routes)
        .merge(public_routes)
        .fallback(endpoints::fallback::handle_404)
        // Failed requests are logged at DEBUG since `Error::new` already logs them
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}

pub struct ShutdownHandle {
    #[expect(dead_code)]
    sender: Sender<()>,
}

/// Starts a gateway on an unused local port
///
/// Returns the address the gateway is listening on and a `ShutdownHandle`
/// which shuts the gateway down when dropped.
pub async fn start_gateway(app_state: AppStateData) -> Result<(SocketAddr, ShutdownHandle), Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to bind to a port: {e}"),
            })
        })?;
    let bind_addr = listener.local_addr().map_err(|e| {
        Error::new(ErrorDetails::AppState {
            message: format!("Failed to get local address: {e}"),
        })
    })?;

    let router = build_router(app_state, None);

    let (sender, recv) = tokio::sync::oneshot::channel::<()>();
    let shutdown_fut = async move {
        let _ = recv.await;
    };

    tokio::spawn(
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_fut)
        .into_future(),
    );
    Ok((bind_addr, ShutdownHandle { sender }))
}
