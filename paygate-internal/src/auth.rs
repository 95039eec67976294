use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorDetails};
use crate::store::{Account, AccountStore};

pub const BEARER_PREFIX: &str = "Bearer ";
/// Length of an issued token: 32 random bytes, hex encoded
pub const TOKEN_LEN: usize = 64;
pub const CREDENTIAL_LEN: usize = BEARER_PREFIX.len() + TOKEN_LEN;

/// Opaque caller credential
///
/// `Debug` only prints a short fingerprint so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccountToken(String);

impl AccountToken {
    pub fn generate() -> Self {
        let bytes: [u8; TOKEN_LEN / 2] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 of the token, hex encoded; storage keys accounts by this
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    /// Short, non-reversible identifier that is safe to log
    pub fn fingerprint(&self) -> String {
        let mut hash = self.hash();
        hash.truncate(16);
        hash
    }
}

impl fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountToken({})", self.fingerprint())
    }
}

/// Checks the shape of a raw `Authorization` value and returns the token part
///
/// Lengths are checked before anything is sliced, so arbitrary input never panics.
fn split_bearer(raw: &str) -> Result<&str, String> {
    if raw.is_empty() {
        return Err("credential is empty".to_string());
    }
    if raw.len() != CREDENTIAL_LEN {
        return Err(format!(
            "credential must be {CREDENTIAL_LEN} characters, got {}",
            raw.len()
        ));
    }
    raw.strip_prefix(BEARER_PREFIX)
        .ok_or_else(|| format!("credential must start with `{}`", BEARER_PREFIX.trim_end()))
}

pub fn parse_bearer_credential(raw: &str) -> Result<AccountToken, Error> {
    split_bearer(raw)
        .map(|token| AccountToken(token.to_string()))
        .map_err(|message| Error::new(ErrorDetails::InvalidCredential { message }))
}

/// Whether the headers carry a credential of the right shape, registered or not
pub fn has_well_formed_credential(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|raw| split_bearer(raw).is_ok())
}

/// A caller whose token maps to a stored account
#[derive(Debug, Clone)]
pub struct Identity {
    pub token: AccountToken,
    pub account: Account,
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    store: Arc<dyn AccountStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, raw: &str) -> Result<Identity, Error> {
        let token = parse_bearer_credential(raw)?;
        match self.store.find_by_token(&token).await? {
            Some(account) => Ok(Identity { token, account }),
            None => Err(Error::new(ErrorDetails::UnknownCredential)),
        }
    }

    pub async fn resolve_headers(&self, headers: &HeaderMap) -> Result<Identity, Error> {
        let raw = headers
            .get(AUTHORIZATION)
            .ok_or_else(|| {
                Error::new(ErrorDetails::InvalidCredential {
                    message: "missing authorization header".to_string(),
                })
            })?
            .to_str()
            .map_err(|_| {
                Error::new(ErrorDetails::InvalidCredential {
                    message: "authorization header is not valid ASCII".to_string(),
                })
            })?;
        self.resolve(raw).await
    }
}

/// Rejects requests without a registered bearer credential and stores the
/// resolved [`Identity`] in the request extensions
pub async fn require_bearer(
    State(resolver): State<IdentityResolver>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let identity = resolver.resolve_headers(request.headers()).await?;
    tracing::debug!(token = %identity.token.fingerprint(), "Resolved caller identity");
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
