//! Sliding window strategy definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SlidegateError};

/// Longest accepted window or expiration: one hundred years in seconds.
///
/// Keeps `now - window` well inside `i64` and inside the exact integer range
/// of the doubles Redis Lua scripts compute with.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// A single sliding window rule: at most `limit` admissions within the
/// trailing `window_secs` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawStrategy")]
pub struct Strategy {
    /// Length of the trailing window in seconds
    window_secs: u64,
    /// Maximum admissions allowed inside the window
    limit: u64,
}

impl Strategy {
    /// Create a new strategy.
    ///
    /// Both the window and the limit must be positive, and the window may
    /// not exceed [`MAX_WINDOW_SECS`].
    pub fn new(window_secs: u64, limit: u64) -> Result<Self> {
        if window_secs == 0 {
            return Err(SlidegateError::Config(
                "strategy window must be at least one second".to_string(),
            ));
        }
        if window_secs > MAX_WINDOW_SECS {
            return Err(SlidegateError::Config(format!(
                "strategy window of {}s exceeds the maximum of {}s",
                window_secs, MAX_WINDOW_SECS
            )));
        }
        if limit == 0 {
            return Err(SlidegateError::Config(
                "strategy limit must be at least one".to_string(),
            ));
        }
        Ok(Self { window_secs, limit })
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Maximum admissions inside the window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Lower score bound (inclusive) of the window ending at `now`.
    pub fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(secs_as_i64(self.window_secs))
    }
}

/// Unvalidated form read from configuration files.
#[derive(Deserialize)]
struct RawStrategy {
    window_secs: u64,
    limit: u64,
}

impl TryFrom<RawStrategy> for Strategy {
    type Error = SlidegateError;

    fn try_from(raw: RawStrategy) -> Result<Self> {
        Strategy::new(raw.window_secs, raw.limit)
    }
}

/// Convert a span in seconds to a score offset, saturating at `i64::MAX`.
pub(crate) fn secs_as_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Largest window across `strategies`, or `None` when there are none.
pub fn max_window(strategies: &[Strategy]) -> Option<u64> {
    strategies.iter().map(Strategy::window_secs).max()
}
