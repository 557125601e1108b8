//! Immutable limiter configuration and its builder.

use super::strategy::{max_window, Strategy, MAX_WINDOW_SECS};
use crate::error::{Result, SlidegateError};

/// The keys a limiter governs together with the strategies applied to each.
///
/// A `Limiter` is built once through [`LimiterBuilder`] and is read-only
/// afterwards, so it can be shared freely between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limiter {
    /// Keys evaluated together in one batch
    keys: Vec<String>,
    /// Strategies in evaluation order
    strategies: Vec<Strategy>,
    /// Retention horizon override in seconds
    fixed_expiration: Option<u64>,
}

impl Limiter {
    /// Start building a limiter for a single key.
    pub fn builder(key: impl Into<String>) -> LimiterBuilder {
        LimiterBuilder::default().key(key)
    }

    /// Start building a limiter for several keys.
    pub fn builder_multi<I, K>(keys: I) -> LimiterBuilder
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        LimiterBuilder::default().keys(keys)
    }

    /// Keys governed by this limiter, in batch order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The first key, used by single-key checks.
    pub fn primary_key(&self) -> &str {
        // build() guarantees at least one key
        &self.keys[0]
    }

    /// Strategies in evaluation order.
    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// The caller supplied expiration override, if any.
    pub fn fixed_expiration(&self) -> Option<u64> {
        self.fixed_expiration
    }

    /// Retention horizon in seconds.
    ///
    /// This is the fixed expiration when set, otherwise the largest window.
    /// Returns 0 for a limiter without strategies (nothing is ever stored).
    pub fn expiration(&self) -> u64 {
        self.fixed_expiration
            .or_else(|| max_window(&self.strategies))
            .unwrap_or(0)
    }

    /// Whether this limiter admits everything without consulting the store.
    pub fn is_unbounded(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Builder for [`Limiter`].
#[derive(Debug, Clone, Default)]
pub struct LimiterBuilder {
    keys: Vec<String>,
    strategies: Vec<Strategy>,
    fixed_expiration: Option<u64>,
}

impl LimiterBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind one more key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Bind several keys.
    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Append an already validated strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Append several strategies.
    pub fn strategies<I>(mut self, strategies: I) -> Self
    where
        I: IntoIterator<Item = Strategy>,
    {
        self.strategies.extend(strategies);
        self
    }

    /// Append a strategy allowing `limit` admissions per `window_secs` seconds.
    pub fn limit(self, window_secs: u64, limit: u64) -> Result<Self> {
        Ok(self.strategy(Strategy::new(window_secs, limit)?))
    }

    /// Override the retention horizon.
    pub fn expiration(mut self, secs: u64) -> Self {
        self.fixed_expiration = Some(secs);
        self
    }

    /// Finish the limiter.
    ///
    /// Fails when no key is bound, when the expiration override exceeds
    /// [`MAX_WINDOW_SECS`], or when it is shorter than the largest window,
    /// since cleanup would then trim markers that are still being counted.
    pub fn build(self) -> Result<Limiter> {
        if self.keys.is_empty() {
            return Err(SlidegateError::Config(
                "a limiter needs at least one key".to_string(),
            ));
        }

        if let Some(expiration) = self.fixed_expiration {
            if expiration > MAX_WINDOW_SECS {
                return Err(SlidegateError::Config(format!(
                    "expiration of {}s exceeds the maximum of {}s",
                    expiration, MAX_WINDOW_SECS
                )));
            }
        }

        if let (Some(expiration), Some(widest)) =
            (self.fixed_expiration, max_window(&self.strategies))
        {
            if expiration < widest {
                return Err(SlidegateError::Config(format!(
                    "expiration of {}s is shorter than the largest window of {}s",
                    expiration, widest
                )));
            }
        }

        Ok(Limiter {
            keys: self.keys,
            strategies: self.strategies,
            fixed_expiration: self.fixed_expiration,
        })
    }
}
