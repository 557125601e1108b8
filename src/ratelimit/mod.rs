//! Sliding window admission control.

mod cleanup;
mod engine;
mod limiter;
mod rules;
mod strategy;

pub use cleanup::{CleanupJob, CleanupScheduler, CleanupStats, DEFAULT_QUEUE_CAPACITY};
pub use engine::RateLimiter;
pub use limiter::{Limiter, LimiterBuilder};
pub use rules::{Policy, PolicySet};
pub use strategy::{max_window, Strategy, MAX_WINDOW_SECS};

pub(crate) use strategy::secs_as_i64;
