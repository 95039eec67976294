use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{split_debit, Account, AccountStore, CreateOutcome, DebitOutcome, NewAccount};
use crate::auth::AccountToken;
use crate::error::Error;

#[derive(Debug, Default)]
struct State {
    // Keyed by token hash
    accounts: HashMap<String, Account>,
    origins: HashMap<String, u64>,
}

/// Process-local account store
///
/// Every mutating operation holds the write lock across its check and its
/// write, which makes it atomic with respect to every other operation.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    state: RwLock<State>,
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_token(&self, token: &AccountToken) -> Result<Option<Account>, Error> {
        Ok(self.state.read().await.accounts.get(&token.hash()).cloned())
    }

    async fn count_by_origin(&self, origin: &str) -> Result<u64, Error> {
        Ok(self
            .state
            .read()
            .await
            .origins
            .get(origin)
            .copied()
            .unwrap_or(0))
    }

    async fn create(
        &self,
        token: &AccountToken,
        account: NewAccount,
        origin_cap: u64,
    ) -> Result<CreateOutcome, Error> {
        let key = token.hash();
        let mut state = self.state.write().await;

        let existing = state.origins.get(&account.origin).copied().unwrap_or(0);
        if existing >= origin_cap {
            return Ok(CreateOutcome::OriginCapReached { limit: origin_cap });
        }
        if state.accounts.contains_key(&key) {
            return Ok(CreateOutcome::DuplicateToken);
        }

        let origin = account.origin.clone();
        let account = account.into_account(Utc::now());
        state.accounts.insert(key, account.clone());
        *state.origins.entry(origin).or_insert(0) += 1;
        Ok(CreateOutcome::Created(account))
    }

    async fn conditional_debit(
        &self,
        token: &AccountToken,
        amount: u64,
    ) -> Result<DebitOutcome, Error> {
        let mut state = self.state.write().await;
        let Some(account) = state.accounts.get_mut(&token.hash()) else {
            return Ok(DebitOutcome::NotFound);
        };
        let Some((from_free, from_paid)) = split_debit(account, amount) else {
            return Ok(DebitOutcome::Insufficient {
                available: account.balance(),
            });
        };

        account.free_credits -= from_free;
        account.credits -= from_paid;
        account.updated_at = Utc::now();
        Ok(DebitOutcome::Debited {
            account: account.clone(),
            from_free,
            from_paid,
        })
    }

    async fn refund(
        &self,
        token: &AccountToken,
        to_free: u64,
        to_paid: u64,
    ) -> Result<Option<Account>, Error> {
        let mut state = self.state.write().await;
        let Some(account) = state.accounts.get_mut(&token.hash()) else {
            return Ok(None);
        };
        account.free_credits = account.free_credits.saturating_add(to_free);
        account.credits = account.credits.saturating_add(to_paid);
        account.updated_at = Utc::now();
        Ok(Some(account.clone()))
    }
}

impl MemoryAccountStore {
    /// Insert an account directly, bypassing the origin cap
    pub async fn insert(&self, token: &AccountToken, account: NewAccount) -> Account {
        let mut state = self.state.write().await;
        let origin = account.origin.clone();
        let account = account.into_account(Utc::now());
        if state.accounts.insert(token.hash(), account.clone()).is_none() {
            *state.origins.entry(origin).or_insert(0) += 1;
        }
        account
    }
}
