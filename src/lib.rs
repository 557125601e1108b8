//! Slidegate - Distributed Sliding Window Rate Limiting
//!
//! This crate lets many service instances share request budgets through one
//! backing store. A [`Limiter`] names one or more keys and the sliding window
//! strategies they must all satisfy; a [`RateLimiter`] checks the whole batch
//! in a single atomic store call and records admissions. A background
//! [`CleanupScheduler`] later trims old history and sets key expiry.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slidegate::{CleanupScheduler, Limiter, RateLimiter, RedisStore, DEFAULT_QUEUE_CAPACITY};
//!
//! # async fn run() -> slidegate::Result<()> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1/").await?);
//! let limiter = Limiter::builder("user:42")
//!     .limit(10, 2)?
//!     .limit(60, 5)?
//!     .build()?;
//!
//! let cleanup = CleanupScheduler::spawn(store.clone(), DEFAULT_QUEUE_CAPACITY);
//! let rate_limiter = RateLimiter::new(store, limiter, cleanup);
//! if rate_limiter.allow().await? {
//!     // handle the request
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SlidegateConfig;
pub use error::{Result, SlidegateError};
pub use ratelimit::{
    CleanupScheduler, Limiter, LimiterBuilder, Policy, PolicySet, RateLimiter, Strategy,
    DEFAULT_QUEUE_CAPACITY,
};
pub use store::{MemoryStore, RedisStore, RedisStoreConfig, WindowStore};
