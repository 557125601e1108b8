//! Batch admission checks against a shared window store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::cleanup::{CleanupJob, CleanupScheduler};
use super::limiter::Limiter;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SlidegateError};
use crate::store::WindowStore;

/// Evaluates a [`Limiter`] against a [`WindowStore`].
///
/// Every call performs at most one store round-trip covering all keys of the
/// limiter. Admitted keys are then handed to the cleanup scheduler together
/// with the evaluation timestamp. This struct is read-only after construction and can be shared
/// across tasks behind an `Arc`.
pub struct RateLimiter<S: WindowStore + ?Sized> {
    /// The backing store
    store: Arc<S>,
    /// Keys and strategies being enforced
    limiter: Limiter,
    /// Time source for calls without an explicit timestamp
    clock: Arc<dyn Clock>,
    /// Receives admitted keys for reclamation
    cleanup: Option<CleanupScheduler>,
    /// Upper bound on a single store round-trip
    call_timeout: Option<Duration>,
}

impl<S: WindowStore + ?Sized> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limiter", &self.limiter)
            .field("clock", &self.clock)
            .field("cleanup", &self.cleanup)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: WindowStore + ?Sized> RateLimiter<S> {
    /// Create a rate limiter using the system clock that sends admitted keys
    /// to `cleanup` after each evaluation.
    pub fn new(store: Arc<S>, limiter: Limiter, cleanup: CleanupScheduler) -> Self {
        Self {
            cleanup: Some(cleanup),
            ..Self::without_cleanup(store, limiter)
        }
    }

    /// Create a rate limiter that never reclaims history.
    ///
    /// Stored keys then never expire and markers are never trimmed, so this
    /// only suits stores whose keys are reclaimed some other way.
    pub fn without_cleanup(store: Arc<S>, limiter: Limiter) -> Self {
        Self {
            store,
            limiter,
            clock: Arc::new(SystemClock::new()),
            cleanup: None,
            call_timeout: None,
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fail evaluations whose store call takes longer than `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// The limiter configuration being enforced.
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Check the primary key at the current time.
    pub async fn allow(&self) -> Result<bool> {
        self.allow_at(self.clock.now()).await
    }

    /// Check the primary key at `now` (unix seconds).
    pub async fn allow_at(&self, now: i64) -> Result<bool> {
        let results = self.allow_multi_at(now).await?;
        results
            .get(self.limiter.primary_key())
            .copied()
            .ok_or_else(|| {
                SlidegateError::Decode(format!(
                    "no result for key {}",
                    self.limiter.primary_key()
                ))
            })
    }

    /// Check every key at the current time.
    pub async fn allow_multi(&self) -> Result<HashMap<String, bool>> {
        self.allow_multi_at(self.clock.now()).await
    }

    /// Check every key at `now` (unix seconds).
    ///
    /// All keys observe the same timestamp. Either every key gets a result or
    /// the whole call fails.
    pub async fn allow_multi_at(&self, now: i64) -> Result<HashMap<String, bool>> {
        let keys = self.limiter.keys();

        if self.limiter.is_unbounded() {
            trace!(keys = keys.len(), "No strategies configured, admitting all keys");
            return Ok(keys.iter().map(|key| (key.clone(), true)).collect());
        }

        trace!(
            keys = keys.len(),
            strategies = self.limiter.strategies().len(),
            now = now,
            "Checking rate limit"
        );

        let admissions = self.evaluate(keys, now).await?;
        if admissions.len() != keys.len() {
            return Err(SlidegateError::Decode(format!(
                "expected {} results, got {}",
                keys.len(),
                admissions.len()
            )));
        }

        let mut results = HashMap::with_capacity(keys.len());
        let mut admitted = Vec::with_capacity(keys.len());
        for (key, allowed) in keys.iter().zip(admissions) {
            if allowed {
                admitted.push(key.clone());
            } else {
                debug!(key = %key, now = now, "Rate limit exceeded");
            }
            results.insert(key.clone(), allowed);
        }

        if let Some(scheduler) = &self.cleanup {
            scheduler.schedule(CleanupJob {
                keys: admitted,
                expiration: self.limiter.expiration(),
                now,
            });
        }

        Ok(results)
    }

    /// One store round-trip, bounded by the call timeout when set.
    async fn evaluate(&self, keys: &[String], now: i64) -> Result<Vec<bool>> {
        let call = self.store.evaluate(keys, self.limiter.strategies(), now);
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| SlidegateError::Timeout(limit))?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Strategy, DEFAULT_QUEUE_CAPACITY};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn single(strategies: &[(u64, u64)]) -> Limiter {
        let mut builder = Limiter::builder("k");
        for (window, limit) in strategies {
            builder = builder.limit(*window, *limit).unwrap();
        }
        builder.build().unwrap()
    }

    async fn outcomes(limiter: &RateLimiter<MemoryStore>, times: &[i64]) -> Vec<bool> {
        let mut results = Vec::new();
        for now in times {
            results.push(limiter.allow_at(*now).await.unwrap());
        }
        results
    }

    /// A store returning a fixed reply.
    struct ScriptedStore(Vec<bool>);

    #[async_trait]
    impl WindowStore for ScriptedStore {
        async fn evaluate(
            &self,
            _keys: &[String],
            _strategies: &[Strategy],
            _now: i64,
        ) -> Result<Vec<bool>> {
            Ok(self.0.clone())
        }

        async fn cleanup(&self, _keys: &[String], _expiration: u64, _now: i64) -> Result<()> {
            Ok(())
        }
    }

    /// A store that never answers.
    struct StalledStore;

    #[async_trait]
    impl WindowStore for StalledStore {
        async fn evaluate(
            &self,
            _keys: &[String],
            _strategies: &[Strategy],
            _now: i64,
        ) -> Result<Vec<bool>> {
            std::future::pending().await
        }

        async fn cleanup(&self, _keys: &[String], _expiration: u64, _now: i64) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_no_strategies_admits_without_store() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Limiter::builder_multi(["a", "b"]).build().unwrap();
        let rate_limiter = RateLimiter::without_cleanup(store.clone(), limiter);

        for now in 0..5 {
            let results = rate_limiter.allow_multi_at(now).await.unwrap();
            assert_eq!(results.len(), 2);
            assert!(results.values().all(|allowed| *allowed));
        }
        assert_eq!(store.evaluate_calls(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_single_strategy_window() {
        let rate_limiter =
            RateLimiter::without_cleanup(Arc::new(MemoryStore::new()), single(&[(10, 2)]));
        assert_eq!(
            outcomes(&rate_limiter, &[0, 1, 2, 11]).await,
            vec![true, true, false, true]
        );
    }

    #[tokio::test]
    async fn test_strategies_are_conjunctive() {
        let rate_limiter =
            RateLimiter::without_cleanup(Arc::new(MemoryStore::new()), single(&[(10, 2), (5, 1)]));
        assert_eq!(outcomes(&rate_limiter, &[0, 1]).await, vec![true, false]);
    }

    #[tokio::test]
    async fn test_rejections_do_not_record() {
        let once =
            RateLimiter::without_cleanup(Arc::new(MemoryStore::new()), single(&[(10, 2)]));
        let many =
            RateLimiter::without_cleanup(Arc::new(MemoryStore::new()), single(&[(10, 2)]));

        let expected = outcomes(&once, &[0, 1, 2, 11, 12]).await;
        let repeated = outcomes(&many, &[0, 1, 2, 2, 2, 3, 5, 9, 11, 12]).await;

        assert_eq!(expected, vec![true, true, false, true, true]);
        assert_eq!(&repeated[repeated.len() - 2..], &expected[3..]);
        assert_eq!(many.store().marker_scores("k"), vec![0, 1, 11, 12]);
        assert_eq!(once.store().marker_scores("k"), vec![0, 1, 11, 12]);
    }

    #[tokio::test]
    async fn test_batch_keys_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let strategies = [Strategy::new(10, 1).unwrap()];

        let a_only = RateLimiter::without_cleanup(
            store.clone(),
            Limiter::builder("a").strategies(strategies).build().unwrap(),
        );
        assert!(a_only.allow_at(0).await.unwrap());

        let both = RateLimiter::without_cleanup(
            store.clone(),
            Limiter::builder_multi(["a", "b"])
                .strategies(strategies)
                .build()
                .unwrap(),
        );
        let results = both.allow_multi_at(1).await.unwrap();
        assert!(!results["a"]);
        assert!(results["b"]);
        assert_eq!(store.marker_scores("a"), vec![0]);
        assert_eq!(store.marker_scores("b"), vec![1]);
    }

    #[tokio::test]
    async fn test_same_second_admissions_all_count() {
        let rate_limiter =
            RateLimiter::without_cleanup(Arc::new(MemoryStore::new()), single(&[(10, 3)]));
        assert_eq!(
            outcomes(&rate_limiter, &[4, 4, 4, 4]).await,
            vec![true, true, true, false]
        );
    }

    #[tokio::test]
    async fn test_allow_uses_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let rate_limiter =
            RateLimiter::without_cleanup(Arc::new(MemoryStore::new()), single(&[(10, 2)]))
                .with_clock(clock.clone());

        let mut results = Vec::new();
        for now in [0, 1, 2, 11] {
            clock.set(now);
            results.push(rate_limiter.allow().await.unwrap());
        }
        assert_eq!(results, vec![true, true, false, true]);
    }

    #[tokio::test]
    async fn test_cleanup_only_for_admitted_keys() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1));
        let scheduler = CleanupScheduler::spawn(store.clone(), 16);
        let strategies = [Strategy::new(10, 1).unwrap()];

        store
            .evaluate(&["a".to_string()], &strategies, 0)
            .await
            .unwrap();

        let rate_limiter = RateLimiter::new(
            store.clone(),
            Limiter::builder_multi(["a", "b"])
                .strategies(strategies)
                .build()
                .unwrap(),
            scheduler.clone(),
        )
        .with_clock(clock);

        let results = rate_limiter.allow_multi().await.unwrap();
        assert!(!results["a"]);
        assert!(results["b"]);

        scheduler.flush().await;
        assert_eq!(store.expires_at("a"), None);
        assert_eq!(store.expires_at("b"), Some(11));
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_counted_markers() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = CleanupScheduler::spawn(store.clone(), 16);
        let rate_limiter = RateLimiter::new(
            store.clone(),
            single(&[(10, 100), (3, 100)]),
            scheduler.clone(),
        )
        .with_clock(clock.clone());

        for now in 0..40 {
            clock.set(now);
            assert!(rate_limiter.allow().await.unwrap());
            scheduler.flush().await;

            let oldest = store.marker_scores("k")[0];
            assert!(oldest >= (now - 10 - 1).max(0));
            assert!(oldest <= now);
        }
    }

    #[tokio::test]
    async fn test_default_constructor_reclaims_history() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = CleanupScheduler::spawn(store.clone(), DEFAULT_QUEUE_CAPACITY);
        let rate_limiter = RateLimiter::new(store.clone(), single(&[(10, 5)]), scheduler.clone());

        for now in [0, 5, 20] {
            assert!(rate_limiter.allow_at(now).await.unwrap());
        }
        scheduler.flush().await;

        // bound = 20 - 10 - 1 = 9
        assert_eq!(store.marker_scores("k"), vec![20]);
        assert_eq!(store.expires_at("k"), Some(30));
        assert_eq!(scheduler.stats().completed, 3);
    }

    #[tokio::test]
    async fn test_without_cleanup_keeps_history() {
        let store = Arc::new(MemoryStore::new());
        let rate_limiter = RateLimiter::without_cleanup(store.clone(), single(&[(10, 5)]));

        for now in [0, 5, 20] {
            assert!(rate_limiter.allow_at(now).await.unwrap());
        }
        assert_eq!(store.marker_scores("k"), vec![0, 5, 20]);
        assert_eq!(store.expires_at("k"), None);
        assert_eq!(store.cleanup_calls(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_uses_evaluation_time() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = CleanupScheduler::spawn(store.clone(), 16);
        let rate_limiter = RateLimiter::new(store.clone(), single(&[(10, 5)]), scheduler.clone())
            .with_clock(Arc::new(ManualClock::new(1_000)));

        for now in [0, 5] {
            assert!(rate_limiter.allow_at(now).await.unwrap());
        }
        scheduler.flush().await;

        // A trim at the clock's time would have removed both markers.
        assert_eq!(store.marker_scores("k"), vec![0, 5]);
        assert_eq!(store.expires_at("k"), Some(15));
    }

    #[tokio::test]
    async fn test_wrong_result_length_is_decode_error() {
        let limiter = Limiter::builder_multi(["a", "b"])
            .limit(10, 1)
            .unwrap()
            .build()
            .unwrap();
        let rate_limiter =
            RateLimiter::without_cleanup(Arc::new(ScriptedStore(vec![true])), limiter);

        let result = rate_limiter.allow_multi_at(0).await;
        assert!(matches!(result, Err(SlidegateError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let rate_limiter =
            RateLimiter::without_cleanup(Arc::new(StalledStore), single(&[(10, 1)]))
                .with_call_timeout(Duration::from_millis(50));

        let result = rate_limiter.allow_at(0).await;
        assert!(matches!(result, Err(SlidegateError::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_overshoot() {
        let store = Arc::new(MemoryStore::new());
        let rate_limiter = Arc::new(RateLimiter::without_cleanup(
            store.clone(),
            single(&[(60, 5)]),
        ));

        let checks = (0..32).map(|_| {
            let rate_limiter = rate_limiter.clone();
            tokio::spawn(async move { rate_limiter.allow_at(100).await.unwrap() })
        });
        let results = futures::future::join_all(checks).await;

        let admitted = results
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(store.marker_scores("k").len(), 5);
    }
}
