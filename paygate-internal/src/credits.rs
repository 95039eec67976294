use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::{debug, info};

use crate::auth::Identity;
use crate::config_parser::RefundPolicy;
use crate::error::{Error, ErrorDetails};
use crate::store::{AccountStore, DebitOutcome};

pub const CREDITS_CHARGED_HEADER: &str = "x-paygate-credits-charged";
pub const CREDITS_REMAINING_HEADER: &str = "x-paygate-credits-remaining";

/// Proof of a successful charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub charged: u64,
    pub from_free: u64,
    pub from_paid: u64,
    /// Spendable balance after the charge
    pub balance: u64,
}

impl Receipt {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CREDITS_CHARGED_HEADER, HeaderValue::from(self.charged));
        headers.insert(CREDITS_REMAINING_HEADER, HeaderValue::from(self.balance));
        headers
    }
}

/// Checks and debits account balances ahead of upstream calls
#[derive(Debug, Clone)]
pub struct CreditGate {
    store: Arc<dyn AccountStore>,
    refund_policy: RefundPolicy,
}

impl CreditGate {
    pub fn new(store: Arc<dyn AccountStore>, refund_policy: RefundPolicy) -> Self {
        Self {
            store,
            refund_policy,
        }
    }

    /// Debit `fee` from the caller, or reject without touching the balance
    ///
    /// A zero fee never reaches storage and reports the balance seen when the
    /// identity was resolved.
    pub async fn charge(&self, identity: &Identity, fee: u64) -> Result<Receipt, Error> {
        if fee == 0 {
            return Ok(Receipt {
                charged: 0,
                from_free: 0,
                from_paid: 0,
                balance: identity.account.balance(),
            });
        }

        match self.store.conditional_debit(&identity.token, fee).await? {
            DebitOutcome::Debited {
                account,
                from_free,
                from_paid,
            } => {
                let receipt = Receipt {
                    charged: fee,
                    from_free,
                    from_paid,
                    balance: account.balance(),
                };
                debug!(
                    token = %identity.token.fingerprint(),
                    charged = fee,
                    from_free,
                    from_paid,
                    balance = receipt.balance,
                    "Charged account"
                );
                metrics::counter!("paygate_credits_charged_total").increment(fee);
                Ok(receipt)
            }
            DebitOutcome::Insufficient { available } => {
                Err(Error::new(ErrorDetails::InsufficientCredit {
                    required: fee,
                    available,
                }))
            }
            // The account vanished between identity resolution and the debit
            DebitOutcome::NotFound => Err(Error::new(ErrorDetails::UnknownCredential)),
        }
    }

    /// Give back a charge after an upstream failure, if the policy allows it
    ///
    /// Returns the updated receipt when a refund happened.
    pub async fn refund_upstream_failure(
        &self,
        identity: &Identity,
        receipt: &Receipt,
    ) -> Result<Option<Receipt>, Error> {
        if self.refund_policy != RefundPolicy::OnUpstreamFailure || receipt.charged == 0 {
            return Ok(None);
        }

        let Some(account) = self
            .store
            .refund(&identity.token, receipt.from_free, receipt.from_paid)
            .await?
        else {
            return Ok(None);
        };
        info!(
            token = %identity.token.fingerprint(),
            refunded = receipt.charged,
            "Refunded charge after upstream failure"
        );
        metrics::counter!("paygate_credits_refunded_total").increment(receipt.charged);
        Ok(Some(Receipt {
            charged: 0,
            from_free: 0,
            from_paid: 0,
            balance: account.balance(),
        }))
    }
}
