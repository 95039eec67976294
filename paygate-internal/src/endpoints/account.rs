use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::{has_well_formed_credential, AccountToken, Identity};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::rate_limit::{KeyContext, ANONYMOUS_KEY};
use crate::store::{Account, CreateOutcome, NewAccount};

/// Fresh tokens that collide with a stored one are drawn again this many times
const CREATE_ATTEMPTS: usize = 3;

/// Balance snapshot returned by `GET /account`; never echoes the token or origin
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub credits: u64,
    pub free_credits: u64,
    pub balance: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            balance: account.balance(),
            credits: account.credits,
            free_credits: account.free_credits,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Body of a successful `PUT /account`; the only time the token is ever returned
#[derive(Debug, Serialize)]
pub struct CreatedAccount {
    pub token: String,
    pub credits: u64,
    pub free_credits: u64,
}

/// A handler for `GET /account`; the identity was resolved by `require_bearer`
pub async fn get_account_handler(Extension(identity): Extension<Identity>) -> Json<AccountView> {
    Json(identity.account.into())
}

/// A handler for `PUT /account`: provisions a new identity for the caller's origin
pub async fn put_account_handler(
    State(app_state): AppState,
    request: Request,
) -> Result<Json<CreatedAccount>, Error> {
    if has_well_formed_credential(request.headers()) {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "requests carrying an account token cannot create another account"
                .to_string(),
        }));
    }

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let origin = KeyContext {
        headers: request.headers(),
        remote_addr,
        identity: None,
    }
    .origin(&app_state.config.rate_limits.key_sources)
    .unwrap_or_else(|| ANONYMOUS_KEY.to_string());

    create_account(&app_state, origin).await
}

async fn create_account(
    app_state: &AppStateData,
    origin: String,
) -> Result<Json<CreatedAccount>, Error> {
    let credits = &app_state.config.credits;
    for _ in 0..CREATE_ATTEMPTS {
        let token = AccountToken::generate();
        let new_account = NewAccount {
            origin: origin.clone(),
            credits: 0,
            free_credits: credits.signup_free_credits,
        };
        match app_state
            .account_store
            .create(&token, new_account, credits.max_accounts_per_origin)
            .await?
        {
            CreateOutcome::Created(account) => {
                tracing::info!(
                    token = %token.fingerprint(),
                    origin,
                    "Created account"
                );
                metrics::counter!("paygate_accounts_created_total").increment(1);
                return Ok(Json(CreatedAccount {
                    token: token.as_str().to_string(),
                    credits: account.credits,
                    free_credits: account.free_credits,
                }));
            }
            CreateOutcome::OriginCapReached { limit } => {
                return Err(Error::new(ErrorDetails::OriginCapReached { limit }));
            }
            CreateOutcome::DuplicateToken => {
                tracing::warn!("Generated token collided with an existing account; retrying");
            }
        }
    }
    Err(Error::new(ErrorDetails::Storage {
        message: format!("Failed to generate a unique token after {CREATE_ATTEMPTS} attempts"),
    }))
}
