use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    /// If `true`, upstream error bodies are included in logs and error responses
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundPolicy {
    /// Charges are final once taken
    #[default]
    Never,
    /// Return the charge when the upstream fails before any output reached the caller
    OnUpstreamFailure,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditsConfig {
    #[serde(default = "default_completion_fee")]
    pub completion_fee: u64,
    #[serde(default = "default_signup_free_credits")]
    pub signup_free_credits: u64,
    #[serde(default = "default_max_accounts_per_origin")]
    pub max_accounts_per_origin: u64,
    #[serde(default)]
    pub refund_policy: RefundPolicy,
}

fn default_completion_fee() -> u64 {
    1
}

fn default_signup_free_credits() -> u64 {
    50
}

fn default_max_accounts_per_origin() -> u64 {
    10
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            completion_fee: default_completion_fee(),
            signup_free_credits: default_signup_free_credits(),
            max_accounts_per_origin: default_max_accounts_per_origin(),
            refund_policy: RefundPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base")]
    pub api_base: Url,
    /// Name of the environment variable holding the upstream API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[expect(clippy::unwrap_used)]
fn default_api_base() -> Url {
    // Constant and known to parse
    Url::parse("https://api.openai.com/v1/").unwrap()
}

fn default_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}

fn default_request_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl UpstreamConfig {
    /// `{api_base}/chat/completions`, tolerating a missing trailing slash on the base
    pub fn chat_completions_url(&self) -> Result<Url, Error> {
        let mut base = self.api_base.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join("chat/completions").map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid `upstream.api_base` `{}`: {e}", self.api_base),
            })
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reads the API key from the configured environment variable
    ///
    /// A missing variable is not an error: some upstreams accept anonymous calls.
    pub fn api_key(&self) -> Option<SecretString> {
        let name = self.api_key_env.as_deref()?;
        match std::env::var(name) {
            Ok(key) if !key.is_empty() => Some(SecretString::from(key)),
            _ => {
                tracing::warn!(
                    "Environment variable `{name}` is not set; upstream requests will be sent without credentials"
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Capacity of the queue between the upstream reader and the caller writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound on the lifetime of one streaming session
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
}

fn default_queue_capacity() -> usize {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            session_timeout_ms: None,
        }
    }
}

impl RelayConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum StorageConfig {
    #[default]
    Memory,
    /// Connection string is read from `PAYGATE_REDIS_URL`
    Redis,
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::load_from_toml_str(&contents)?;
        config.verify()?;
        Ok(config)
    }

    pub fn load_from_toml_str(contents: &str) -> Result<Config, Error> {
        let deserializer = toml::Deserializer::new(contents);
        serde_path_to_error::deserialize(deserializer).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config at `{}`: {}", e.path(), e.inner()),
            })
        })
    }

    /// Rejects values that parse but cannot run
    pub fn verify(&self) -> Result<(), Error> {
        self.rate_limits.verify()?;
        if self.relay.queue_capacity == 0 {
            return Err(config_error(
                "`relay.queue_capacity` must be at least 1".to_string(),
            ));
        }
        if self.relay.session_timeout_ms == Some(0) {
            return Err(config_error(
                "`relay.session_timeout_ms` must be greater than 0 when set".to_string(),
            ));
        }
        if self.credits.max_accounts_per_origin == 0 {
            return Err(config_error(
                "`credits.max_accounts_per_origin` must be at least 1".to_string(),
            ));
        }
        if self.upstream.request_timeout_ms == 0 {
            return Err(config_error(
                "`upstream.request_timeout_ms` must be greater than 0".to_string(),
            ));
        }
        self.upstream.chat_completions_url()?;
        Ok(())
    }
}

fn config_error(message: String) -> Error {
    Error::new(ErrorDetails::Config { message })
}
