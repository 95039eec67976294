use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AccountToken;
use crate::config_parser::StorageConfig;
use crate::error::{Error, ErrorDetails};

pub mod memory;
pub mod redis;

pub use memory::MemoryAccountStore;
pub use self::redis::RedisAccountStore;

/// Environment variable holding the Redis connection string
pub const REDIS_URL_ENV: &str = "PAYGATE_REDIS_URL";

/// Balance snapshot of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub credits: u64,
    pub free_credits: u64,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Spendable balance: free credits plus paid credits
    pub fn balance(&self) -> u64 {
        self.credits.saturating_add(self.free_credits)
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub origin: String,
    pub credits: u64,
    pub free_credits: u64,
}

impl NewAccount {
    pub(crate) fn into_account(self, now: DateTime<Utc>) -> Account {
        Account {
            credits: self.credits,
            free_credits: self.free_credits,
            origin: self.origin,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Account),
    /// The origin already owns `limit` or more accounts; nothing was written
    OriginCapReached { limit: u64 },
    /// The token is already registered; nothing was written
    DuplicateToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited {
        account: Account,
        from_free: u64,
        from_paid: u64,
    },
    /// The balance did not cover the amount; nothing was written
    Insufficient { available: u64 },
    NotFound,
}

/// Persistence for accounts
///
/// Implementations must make `create` (cap check plus insert) and
/// `conditional_debit` (balance check plus decrement) single atomic steps.
#[async_trait]
pub trait AccountStore: Debug + Send + Sync {
    async fn find_by_token(&self, token: &AccountToken) -> Result<Option<Account>, Error>;

    /// Accounts owned by `origin`. The cap itself is enforced inside `create`,
    /// so the request path never calls this; it exists for operators and tests.
    async fn count_by_origin(&self, origin: &str) -> Result<u64, Error>;

    async fn create(
        &self,
        token: &AccountToken,
        account: NewAccount,
        origin_cap: u64,
    ) -> Result<CreateOutcome, Error>;

    /// Debit `amount`, free credits first, or change nothing
    async fn conditional_debit(
        &self,
        token: &AccountToken,
        amount: u64,
    ) -> Result<DebitOutcome, Error>;

    /// Give back an earlier debit split exactly as it was taken
    async fn refund(
        &self,
        token: &AccountToken,
        to_free: u64,
        to_paid: u64,
    ) -> Result<Option<Account>, Error>;
}

/// Splits a debit between free and paid credits, free first
pub(crate) fn split_debit(account: &Account, amount: u64) -> Option<(u64, u64)> {
    if account.balance() < amount {
        return None;
    }
    let from_free = account.free_credits.min(amount);
    Some((from_free, amount - from_free))
}

pub async fn setup_account_store(config: &StorageConfig) -> Result<Arc<dyn AccountStore>, Error> {
    match config {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory account storage; accounts are lost on restart");
            Ok(Arc::new(MemoryAccountStore::default()))
        }
        StorageConfig::Redis => {
            let url = std::env::var(REDIS_URL_ENV).map_err(|_| {
                Error::new(ErrorDetails::Config {
                    message: format!(
                        "`storage.type = \"redis\"` requires the `{REDIS_URL_ENV}` environment variable"
                    ),
                })
            })?;
            let store = RedisAccountStore::connect(&url).await?;
            tracing::info!("Connected to Redis account storage");
            Ok(Arc::new(store))
        }
    }
}
