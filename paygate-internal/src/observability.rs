use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "warn,gateway=info,paygate_internal=info";
const DEBUG_LOG_FILTER: &str = "warn,gateway=debug,paygate_internal=debug";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Lets `gateway.debug` raise the log level once the config file has been read
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

impl DelayedDebugLogs {
    /// Switches to debug logs for our own crates, unless `RUST_LOG` was set explicitly
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.env_override {
            tracing::info!("`RUST_LOG` is set, so `gateway.debug` does not change the log filter");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// Installs the global `tracing` subscriber
///
/// The filter comes from `RUST_LOG` when set, and `DEFAULT_LOG_FILTER` otherwise.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let (filter, env_override) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    let pretty = (log_format == LogFormat::Pretty).then(fmt::layer);
    let json = (log_format == LogFormat::Json).then(|| fmt::layer().json());

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing: {e}"),
            })
        })?;

    Ok(DelayedDebugLogs {
        handle,
        env_override,
    })
}

/// Installs the global Prometheus recorder behind `GET /metrics`
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    metrics::describe_counter!(
        "paygate_rate_limit_decisions_total",
        "Rate limiter decisions by outcome"
    );
    metrics::describe_counter!(
        "paygate_credits_charged_total",
        "Credits debited from accounts"
    );
    metrics::describe_counter!(
        "paygate_credits_refunded_total",
        "Credits returned after upstream failures"
    );
    metrics::describe_counter!(
        "paygate_relay_sessions_total",
        "Finished streaming sessions by outcome"
    );
    metrics::describe_counter!("paygate_accounts_created_total", "Accounts provisioned");
    Ok(handle)
}
