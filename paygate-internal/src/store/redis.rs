use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};

use super::{Account, AccountStore, CreateOutcome, DebitOutcome, NewAccount};
use crate::auth::AccountToken;
use crate::error::{Error, ErrorDetails};

const ACCOUNT_PREFIX: &str = "paygate:account:";
const ORIGIN_PREFIX: &str = "paygate:origin:";

const CREATE_SCRIPT: &str = r#"
local account_key = KEYS[1]
local origin_key = KEYS[2]
local cap = tonumber(ARGV[1])

if redis.call('SCARD', origin_key) >= cap then
    return {0}
end
if redis.call('EXISTS', account_key) == 1 then
    return {2}
end

redis.call('HSET', account_key,
    'credits', ARGV[2],
    'free_credits', ARGV[3],
    'origin', ARGV[4],
    'created_at', ARGV[5],
    'updated_at', ARGV[5])
redis.call('SADD', origin_key, ARGV[6])
return {1}
"#;

// Balances only change through integer commands and are returned as stored,
// so they never pass through Lua's double formatting. `string2ll` rejects
// "-0", hence the guards around zero amounts.
const DEBIT_SCRIPT: &str = r#"
local account_key = KEYS[1]
if redis.call('EXISTS', account_key) == 0 then
    return {'-1'}
end

local amount = ARGV[1]
local free = redis.call('HGET', account_key, 'free_credits') or '0'
local paid = redis.call('HGET', account_key, 'credits') or '0'
if tonumber(free) + tonumber(paid) < tonumber(amount) then
    return {'0', free, paid}
end

local from_free = amount
if tonumber(free) < tonumber(amount) then
    from_free = free
end
if from_free ~= '0' then
    redis.call('HINCRBY', account_key, 'free_credits', '-' .. from_free)
end
if from_free ~= amount then
    redis.call('HINCRBY', account_key, 'credits', '-' .. amount)
    if from_free ~= '0' then
        redis.call('HINCRBY', account_key, 'credits', from_free)
    end
end
redis.call('HSET', account_key, 'updated_at', ARGV[2])

local reply = {'1', from_free}
for _, value in ipairs(redis.call('HGETALL', account_key)) do
    table.insert(reply, value)
end
return reply
"#;

const REFUND_SCRIPT: &str = r#"
local account_key = KEYS[1]
if redis.call('EXISTS', account_key) == 0 then
    return {}
end
redis.call('HINCRBY', account_key, 'free_credits', ARGV[1])
redis.call('HINCRBY', account_key, 'credits', ARGV[2])
redis.call('HSET', account_key, 'updated_at', ARGV[3])
return redis.call('HGETALL', account_key)
"#;

/// Account store backed by Redis hashes
///
/// Each account lives in a hash under `paygate:account:<sha256(token)>`; each
/// origin keeps a set of the token hashes it owns. The multi-step operations
/// run as Lua scripts so Redis executes them atomically.
#[derive(Debug, Clone)]
pub struct RedisAccountStore {
    conn: MultiplexedConnection,
    create_script: Script,
    debit_script: Script,
    refund_script: Script,
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::new(ErrorDetails::Storage {
        message: format!("{context}: {e}"),
    })
}

fn account_key(token: &AccountToken) -> String {
    format!("{ACCOUNT_PREFIX}{}", token.hash())
}

fn origin_key(origin: &str) -> String {
    format!("{ORIGIN_PREFIX}{origin}")
}

impl RedisAccountStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = ::redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        Ok(Self {
            conn,
            create_script: Script::new(CREATE_SCRIPT),
            debit_script: Script::new(DEBIT_SCRIPT),
            refund_script: Script::new(REFUND_SCRIPT),
        })
    }

    async fn load(&self, key: &str) -> Result<Option<Account>, Error> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| storage_error("Failed to read account", e))?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_account(&fields).map(Some)
    }
}

fn parse_account(fields: &HashMap<String, String>) -> Result<Account, Error> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, Error> {
        fields.get(name).map(String::as_str).ok_or_else(|| {
            Error::new(ErrorDetails::Storage {
                message: format!("Stored account is missing field `{name}`"),
            })
        })
    }
    fn number(fields: &HashMap<String, String>, name: &str) -> Result<u64, Error> {
        field(fields, name)?
            .parse()
            .map_err(|e| storage_error(&format!("Stored account has invalid `{name}`"), e))
    }
    fn timestamp(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>, Error> {
        DateTime::parse_from_rfc3339(field(fields, name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| storage_error(&format!("Stored account has invalid `{name}`"), e))
    }

    Ok(Account {
        credits: number(fields, "credits")?,
        free_credits: number(fields, "free_credits")?,
        origin: field(fields, "origin")?.to_string(),
        created_at: timestamp(fields, "created_at")?,
        updated_at: timestamp(fields, "updated_at")?,
    })
}

/// Turns a flat `HGETALL` reply into field/value pairs
fn hash_fields(values: &[String]) -> HashMap<String, String> {
    values
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn parse_credit_amount(value: &str) -> Result<u64, Error> {
    value
        .parse()
        .map_err(|e| storage_error(&format!("Debit script returned invalid amount `{value}`"), e))
}

/// Decodes the reply of `DEBIT_SCRIPT`; the account snapshot is taken inside the script
fn parse_debit_reply(amount: u64, reply: &[String]) -> Result<DebitOutcome, Error> {
    match reply {
        [status] if status == "-1" => Ok(DebitOutcome::NotFound),
        [status, free, paid] if status == "0" => Ok(DebitOutcome::Insufficient {
            available: parse_credit_amount(free)?.saturating_add(parse_credit_amount(paid)?),
        }),
        [status, from_free, fields @ ..] if status == "1" => {
            let from_free = parse_credit_amount(from_free)?;
            let from_paid = amount.checked_sub(from_free).ok_or_else(|| {
                Error::new(ErrorDetails::Storage {
                    message: format!(
                        "Debit script took {from_free} free credits for a debit of {amount}"
                    ),
                })
            })?;
            Ok(DebitOutcome::Debited {
                account: parse_account(&hash_fields(fields))?,
                from_free,
                from_paid,
            })
        }
        _ => Err(Error::new(ErrorDetails::Storage {
            message: format!("Unexpected reply from debit script: {reply:?}"),
        })),
    }
}

#[async_trait]
impl AccountStore for RedisAccountStore {
    async fn find_by_token(&self, token: &AccountToken) -> Result<Option<Account>, Error> {
        self.load(&account_key(token)).await
    }

    async fn count_by_origin(&self, origin: &str) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        conn.scard(origin_key(origin))
            .await
            .map_err(|e| storage_error("Failed to count accounts for origin", e))
    }

    async fn create(
        &self,
        token: &AccountToken,
        account: NewAccount,
        origin_cap: u64,
    ) -> Result<CreateOutcome, Error> {
        let mut conn = self.conn.clone();
        let account = account.into_account(Utc::now());
        let created_at = account.created_at.to_rfc3339();

        let result: Vec<i64> = self
            .create_script
            .key(account_key(token))
            .key(origin_key(&account.origin))
            .arg(origin_cap)
            .arg(account.credits)
            .arg(account.free_credits)
            .arg(&account.origin)
            .arg(&created_at)
            .arg(token.hash())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| storage_error("Failed to create account", e))?;

        match result.first() {
            Some(1) => Ok(CreateOutcome::Created(account)),
            Some(0) => Ok(CreateOutcome::OriginCapReached { limit: origin_cap }),
            Some(2) => Ok(CreateOutcome::DuplicateToken),
            _ => Err(Error::new(ErrorDetails::Storage {
                message: format!("Unexpected reply from account creation script: {result:?}"),
            })),
        }
    }

    async fn conditional_debit(
        &self,
        token: &AccountToken,
        amount: u64,
    ) -> Result<DebitOutcome, Error> {
        let mut conn = self.conn.clone();

        let reply: Vec<String> = self
            .debit_script
            .key(account_key(token))
            .arg(amount)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| storage_error("Failed to debit account", e))?;

        parse_debit_reply(amount, &reply)
    }

    async fn refund(
        &self,
        token: &AccountToken,
        to_free: u64,
        to_paid: u64,
    ) -> Result<Option<Account>, Error> {
        let mut conn = self.conn.clone();

        let reply: Vec<String> = self
            .refund_script
            .key(account_key(token))
            .arg(to_free)
            .arg(to_paid)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| storage_error("Failed to refund account", e))?;

        if reply.is_empty() {
            return Ok(None);
        }
        parse_account(&hash_fields(&reply)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_account() {
        let account = parse_account(&fields(&[
            ("credits", "12"),
            ("free_credits", "50"),
            ("origin", "198.51.100.4"),
            ("created_at", "2026-01-02T03:04:05+00:00"),
            ("updated_at", "2026-01-02T03:04:06+00:00"),
        ]))
        .unwrap();

        assert_eq!(account.credits, 12);
        assert_eq!(account.free_credits, 50);
        assert_eq!(account.origin, "198.51.100.4");
        assert!(account.updated_at > account.created_at);
    }

    #[test]
    fn test_parse_account_rejects_missing_and_invalid_fields() {
        let missing = parse_account(&fields(&[("credits", "1")])).unwrap_err();
        assert!(matches!(
            missing.get_details(),
            ErrorDetails::Storage { .. }
        ));

        let invalid = parse_account(&fields(&[
            ("credits", "-3"),
            ("free_credits", "0"),
            ("origin", "x"),
            ("created_at", "2026-01-02T03:04:05+00:00"),
            ("updated_at", "2026-01-02T03:04:05+00:00"),
        ]))
        .unwrap_err();
        assert!(invalid.to_string().contains("credits"));
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_debit_reply_carries_post_debit_snapshot() {
        let reply = strings(&[
            "1",
            "2",
            "credits",
            "100000000000000",
            "free_credits",
            "0",
            "origin",
            "198.51.100.4",
            "created_at",
            "2026-01-02T03:04:05+00:00",
            "updated_at",
            "2026-01-02T03:04:06+00:00",
        ]);

        let DebitOutcome::Debited {
            account,
            from_free,
            from_paid,
        } = parse_debit_reply(5, &reply).unwrap()
        else {
            panic!("expected a debit");
        };
        assert_eq!(from_free, 2);
        assert_eq!(from_paid, 3);
        assert_eq!(account.credits, 100_000_000_000_000);
        assert_eq!(account.free_credits, 0);
    }

    #[test]
    fn test_debit_reply_insufficient_and_missing() {
        assert_eq!(
            parse_debit_reply(10, &strings(&["0", "4", "3"])).unwrap(),
            DebitOutcome::Insufficient { available: 7 }
        );
        assert_eq!(
            parse_debit_reply(10, &strings(&["-1"])).unwrap(),
            DebitOutcome::NotFound
        );
    }

    #[test]
    fn test_debit_reply_rejects_inconsistent_replies() {
        // More free credits taken than the debit itself
        assert!(parse_debit_reply(1, &strings(&["1", "2"])).is_err());
        assert!(parse_debit_reply(1, &strings(&["0", "1e+14", "0"])).is_err());
        assert!(parse_debit_reply(1, &[]).is_err());
    }

    #[test]
    fn test_keys_never_contain_raw_token() {
        let token = AccountToken::generate();
        let key = account_key(&token);
        assert!(key.starts_with(ACCOUNT_PREFIX));
        assert!(!key.contains(token.as_str()));
        assert_eq!(origin_key("192.0.2.1"), "paygate:origin:192.0.2.1");
    }
}
