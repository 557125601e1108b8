//! In-process window store.
//!
//! Holds every key's history behind a single mutex, which gives each call the
//! same all-or-nothing visibility a Redis script has. Time only advances
//! through the `now` arguments, so expiry is evaluated against the caller's
//! timestamps rather than the wall clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{expiry_deadline, marker_member, trim_bound, WindowStore};
use crate::error::Result;
use crate::ratelimit::Strategy;

/// History of a single key.
#[derive(Debug, Default)]
struct KeyHistory {
    /// Markers ordered by (score, member)
    markers: BTreeSet<(i64, String)>,
    /// Timestamp at which the whole key disappears
    expires_at: Option<i64>,
}

impl KeyHistory {
    fn count_since(&self, start: i64) -> u64 {
        self.markers
            .range((start, String::new())..)
            .count() as u64
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A [`WindowStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, KeyHistory>>,
    evaluate_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores of the markers currently held for `key`, ascending.
    pub fn marker_scores(&self, key: &str) -> Vec<i64> {
        let keys = self.keys.lock();
        keys.get(key)
            .map(|history| history.markers.iter().map(|(score, _)| *score).collect())
            .unwrap_or_default()
    }

    /// The timestamp at which `key` expires, if one was set.
    pub fn expires_at(&self, key: &str) -> Option<i64> {
        let keys = self.keys.lock();
        keys.get(key).and_then(|history| history.expires_at)
    }

    /// Whether the store holds any history for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.lock().contains_key(key)
    }

    /// Number of keys with history.
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Check if the store holds no history at all.
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Number of evaluation calls served so far.
    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    /// Number of cleanup calls served so far.
    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    /// Drop all history.
    pub fn clear(&self) {
        self.keys.lock().clear();
    }

    /// Remove `key` if its expiry has passed at `now`.
    fn purge_expired(keys: &mut HashMap<String, KeyHistory>, key: &str, now: i64) {
        if keys.get(key).is_some_and(|history| history.is_expired(now)) {
            keys.remove(key);
        }
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn evaluate(
        &self,
        keys: &[String],
        strategies: &[Strategy],
        now: i64,
    ) -> Result<Vec<bool>> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        let nonce = Uuid::new_v4().simple().to_string();

        let mut histories = self.keys.lock();
        let mut results = Vec::with_capacity(keys.len());

        for (index, key) in keys.iter().enumerate() {
            Self::purge_expired(&mut histories, key, now);

            let pass = match histories.get(key) {
                Some(history) => strategies
                    .iter()
                    .all(|s| history.count_since(s.window_start(now)) < s.limit()),
                None => true,
            };

            if pass {
                histories
                    .entry(key.clone())
                    .or_default()
                    .markers
                    .insert((now, marker_member(now, &nonce, index)));
            }

            trace!(key = %key, now = now, admitted = pass, "Evaluated key in memory store");
            results.push(pass);
        }

        Ok(results)
    }

    async fn cleanup(&self, keys: &[String], expiration: u64, now: i64) -> Result<()> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        let bound = trim_bound(now, expiration);

        let mut histories = self.keys.lock();
        for key in keys {
            Self::purge_expired(&mut histories, key, now);

            // EXPIRE on a missing key is a no-op
            if let Some(history) = histories.get_mut(key) {
                history.expires_at = Some(expiry_deadline(now, expiration));
                history.markers.retain(|(score, _)| *score >= bound);
                if history.markers.is_empty() {
                    histories.remove(key);
                }
            }
        }

        Ok(())
    }
}
