use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::auth::Identity;

/// Where a rate limit key may be taken from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySource {
    /// A request header. `x-forwarded-for` is reduced to its leftmost hop.
    Header(String),
    /// The peer address of the TCP connection
    RemoteAddr,
    /// The token of the already-resolved identity
    Bearer,
}

impl TryFrom<String> for KeySource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "" => Err("rate limit key source cannot be empty".to_string()),
            "remote_addr" => Ok(KeySource::RemoteAddr),
            "bearer" => Ok(KeySource::Bearer),
            _ => Ok(KeySource::Header(value)),
        }
    }
}

impl From<KeySource> for String {
    fn from(source: KeySource) -> Self {
        match source {
            KeySource::Header(name) => name,
            KeySource::RemoteAddr => "remote_addr".to_string(),
            KeySource::Bearer => "bearer".to_string(),
        }
    }
}

impl KeySource {
    /// Address-type sources identify where a request came from, not who sent it
    pub fn is_address(&self) -> bool {
        !matches!(self, KeySource::Bearer)
    }
}

fn is_address_header(name: &str) -> bool {
    matches!(
        name,
        "x-forwarded-for" | "x-real-ip" | "cf-connecting-ip" | "true-client-ip"
    )
}

/// Everything a key can be derived from, borrowed from one request
pub struct KeyContext<'a> {
    pub headers: &'a HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub identity: Option<&'a Identity>,
}

impl KeyContext<'_> {
    fn resolve(&self, source: &KeySource) -> Option<String> {
        match source {
            KeySource::Header(name) => {
                let value = self.headers.get(name.as_str())?.to_str().ok()?;
                let value = if name == "x-forwarded-for" {
                    value.split(',').next().unwrap_or_default()
                } else {
                    value
                };
                let value = value.trim();
                if value.is_empty() {
                    None
                } else if is_address_header(name) {
                    Some(format!("ip:{value}"))
                } else {
                    Some(format!("header:{name}:{value}"))
                }
            }
            KeySource::RemoteAddr => self.remote_addr.map(|addr| format!("ip:{}", addr.ip())),
            KeySource::Bearer => self
                .identity
                .map(|identity| format!("token:{}", identity.token.fingerprint())),
        }
    }

    /// Returns the key from the first source that yields a non-empty value
    pub fn first_key(&self, sources: &[KeySource]) -> Option<String> {
        sources.iter().find_map(|source| self.resolve(source))
    }

    /// Returns the caller's origin address, skipping identity-based sources
    pub fn origin(&self, sources: &[KeySource]) -> Option<String> {
        sources
            .iter()
            .filter(|source| source.is_address())
            .find_map(|source| self.resolve(source))
            .map(|key| key.trim_start_matches("ip:").to_string())
    }
}
