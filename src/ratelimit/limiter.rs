//! Core fixed-window rate limiter.

use std::sync::Arc;
use tracing::{debug, trace};

use super::signature::Signature;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::Store;

/// Fixed-window counter over a shared [`Store`].
///
/// Each signature owns two keys: the attempt counter under the bare signature
/// and the window timer under `signature:timer`, holding the epoch second the
/// window closes. Both carry a TTL equal to the window length. A counter whose
/// timer is gone is stale and treated as reset.
///
/// This struct holds no per-signature state and can be shared freely.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter reading time from the system clock.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Determine whether the signature has used up its attempts.
    ///
    /// A counter at the limit whose window timer has lapsed is reset here, so
    /// storage is reclaimed without waiting for its own TTL.
    pub async fn too_many_attempts(&self, signature: &Signature, max_attempts: u64) -> Result<bool> {
        if self.attempts(signature).await? >= max_attempts {
            if self.store.get(&signature.timer_key()).await?.is_some() {
                return Ok(true);
            }

            debug!(signature = %signature, "Window lapsed with counter at limit, resetting");
            self.reset_attempts(signature).await?;
        }

        Ok(false)
    }

    /// Record one attempt and return the count within the current window.
    ///
    /// The timer and the counter are only initialised if absent, so hits inside
    /// an open window never push its end further out.
    pub async fn hit(&self, signature: &Signature, window_seconds: u64) -> Result<u64> {
        let available_at = self.clock.now() + window_seconds as i64;

        self.store
            .add(&signature.timer_key(), available_at, window_seconds)
            .await?;

        let added = self
            .store
            .add(signature.counter_key(), 0, window_seconds)
            .await?;

        let hits = self.store.increment(signature.counter_key()).await?;

        // The counter existed for `add` but had expired by `increment`, which
        // recreated it without a TTL. Put it back with one.
        if !added && hits == 1 {
            debug!(signature = %signature, "Counter expired mid-hit, restoring TTL");
            self.store
                .put(signature.counter_key(), 1, window_seconds)
                .await?;
        }

        trace!(signature = %signature, hits, window_seconds, "Recorded hit");
        Ok(hits.max(0) as u64)
    }

    /// Number of attempts in the current window.
    pub async fn attempts(&self, signature: &Signature) -> Result<u64> {
        let count = self.store.get(signature.counter_key()).await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    /// Delete the attempt counter.
    pub async fn reset_attempts(&self, signature: &Signature) -> Result<()> {
        self.store.forget(signature.counter_key()).await
    }

    /// Attempts left before the limit; negative once the limit is overshot.
    pub async fn retries_left(&self, signature: &Signature, max_attempts: u64) -> Result<i64> {
        let attempts = self.attempts(signature).await?;
        Ok(max_attempts as i64 - attempts as i64)
    }

    /// Delete both the counter and the window timer.
    pub async fn clear(&self, signature: &Signature) -> Result<()> {
        self.reset_attempts(signature).await?;
        self.store.forget(&signature.timer_key()).await
    }

    /// Seconds until the current window closes, 0 when none is open.
    pub async fn available_in(&self, signature: &Signature) -> Result<u64> {
        let available_at = self.store.get(&signature.timer_key()).await?;
        let remaining = available_at.map_or(0, |at| at - self.clock.now());
        Ok(remaining.max(0) as u64)
    }
}
