pub mod auth; // bearer credentials and identity resolution
pub mod config_parser; // paygate config file
pub mod credits; // credit gate: atomic charges and refunds
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod rate_limit; // rate limiting
pub mod relay; // upstream to caller stream bridge
pub mod store; // account storage backends
mod testing;
pub mod upstream; // completion providers
