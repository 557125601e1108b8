//! Redis-backed window store.
//!
//! Every key maps to a Redis sorted set whose scores are admission
//! timestamps. Both operations run as Lua scripts, which Redis executes
//! without interleaving any other command, so concurrent instances sharing
//! one Redis never observe a half-applied batch.
//!
//! ## Scripts
//!
//! - evaluation: `KEYS` = keys, `ARGV` = `window1, limit1, ..., nonce, now`,
//!   returns one `0`/`1` per key
//! - cleanup: `KEYS` = keys, `ARGV` = `expiration, now`
//!
//! Scripts are sent with `EVALSHA` and fall back to `EVAL` when the server
//! has not cached them yet.

use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script, Value};
use tracing::{info, trace};
use uuid::Uuid;

use super::WindowStore;
use crate::error::{Result, SlidegateError};
use crate::ratelimit::Strategy;

const EVALUATE_SCRIPT: &str = r#"
local now = tonumber(ARGV[#ARGV])
local nonce = ARGV[#ARGV - 1]
local last_pair = #ARGV - 2

local results = {}
for i = 1, #KEYS do
    local key = KEYS[i]
    local pass = 1
    for j = 1, last_pair, 2 do
        local window = tonumber(ARGV[j])
        local limit = tonumber(ARGV[j + 1])
        if redis.call('ZCOUNT', key, now - window, '+inf') >= limit then
            pass = 0
            break
        end
    end
    if pass == 1 then
        redis.call('ZADD', key, now, now .. ':' .. nonce .. ':' .. (i - 1))
    end
    results[i] = pass
end
return results
"#;

const CLEANUP_SCRIPT: &str = r#"
local expiration = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
for i = 1, #KEYS do
    redis.call('EXPIRE', KEYS[i], expiration)
    redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', '(' .. (now - expiration - 1))
end
return #KEYS
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key (default: "slidegate:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "slidegate:".to_string(),
        }
    }
}

/// A [`WindowStore`] shared between instances through Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    evaluate_script: Script,
    cleanup_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %config.key_prefix, "Connected to Redis window store");
        Ok(Self::from_connection(connection, config))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager, config: RedisStoreConfig) -> Self {
        Self {
            connection,
            config,
            evaluate_script: Script::new(EVALUATE_SCRIPT),
            cleanup_script: Script::new(CLEANUP_SCRIPT),
        }
    }

    /// The store configuration.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Get the Redis key for a caller key.
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn evaluate(
        &self,
        keys: &[String],
        strategies: &[Strategy],
        now: i64,
    ) -> Result<Vec<bool>> {
        let mut invocation = self.evaluate_script.prepare_invoke();
        for key in keys {
            invocation.key(self.key(key));
        }
        for strategy in strategies {
            invocation.arg(strategy.window_secs()).arg(strategy.limit());
        }
        invocation
            .arg(Uuid::new_v4().simple().to_string())
            .arg(now);

        trace!(
            keys = keys.len(),
            strategies = strategies.len(),
            now = now,
            "Running evaluation script"
        );

        let mut connection = self.connection.clone();
        let reply: Value = invocation.invoke_async(&mut connection).await?;
        decode_admissions(reply, keys.len())
    }

    async fn cleanup(&self, keys: &[String], expiration: u64, now: i64) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut invocation = self.cleanup_script.prepare_invoke();
        for key in keys {
            invocation.key(self.key(key));
        }
        invocation.arg(expiration).arg(now);

        let mut connection = self.connection.clone();
        let _: Value = invocation.invoke_async(&mut connection).await?;
        Ok(())
    }
}

/// Interpret the evaluation script reply as one flag per key.
fn decode_admissions(reply: Value, expected: usize) -> Result<Vec<bool>> {
    let items = match reply {
        Value::Array(items) => items,
        other => {
            return Err(SlidegateError::Decode(format!(
                "expected an array reply, got {:?}",
                other
            )))
        }
    };

    if items.len() != expected {
        return Err(SlidegateError::Decode(format!(
            "expected {} results, got {}",
            expected,
            items.len()
        )));
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Int(1) => Ok(true),
            Value::Int(0) => Ok(false),
            other => Err(SlidegateError::Decode(format!(
                "result {} is not 0 or 1: {:?}",
                index, other
            ))),
        })
        .collect()
}
