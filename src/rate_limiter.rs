//! Per-caller admission control.
//!
//! Each caller owns a token bucket in the [`FastStore`], so every process sharing the
//! store enforces one limit per caller.

use std::sync::Arc;

use crate::{
    BucketCapacity, RateLimitDecision, RefillPeriodMs, StorePrefix, TallymanError,
    store::{FastStore, KeyGenerator},
};

/// Configuration for [`RateLimiter`].
///
/// # Examples
///
/// ```
/// use tallyman::{BucketCapacity, RateLimiterOptions, RefillPeriodMs};
///
/// // 20 requests per caller per second.
/// let options = RateLimiterOptions {
///     capacity: BucketCapacity::try_from(20).unwrap(),
///     refill_period_ms: RefillPeriodMs::try_from(1_000).unwrap(),
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct RateLimiterOptions {
    /// Tokens a full bucket holds.
    pub capacity: BucketCapacity,

    /// Time for an empty bucket to refill completely.
    ///
    /// Tokens come back continuously at `capacity / refill_period_ms`.
    pub refill_period_ms: RefillPeriodMs,

    /// Request paths that skip the limiter.
    ///
    /// A path is bypassed when it contains any of these entries. Empty entries are ignored.
    pub bypass_paths: Vec<String>,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            capacity: BucketCapacity::default(),
            refill_period_ms: RefillPeriodMs::default(),
            bypass_paths: ["/health", "/info", "/metrics", "/prometheus"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Token bucket rate limiter keyed by caller identity.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn FastStore>,
    key_generator: KeyGenerator,
    capacity: BucketCapacity,
    refill_period_ms: RefillPeriodMs,
    bypass_paths: Arc<[String]>,
}

impl RateLimiter {
    /// Create a limiter whose buckets live under `prefix` in `store`.
    pub fn new(store: Arc<dyn FastStore>, prefix: StorePrefix, options: RateLimiterOptions) -> Self {
        Self::with_key_generator(store, KeyGenerator::new(prefix), options)
    }

    pub(crate) fn with_key_generator(
        store: Arc<dyn FastStore>,
        key_generator: KeyGenerator,
        options: RateLimiterOptions,
    ) -> Self {
        let bypass_paths = options
            .bypass_paths
            .into_iter()
            .filter(|path| !path.is_empty())
            .collect::<Vec<_>>();

        Self {
            store,
            key_generator,
            capacity: options.capacity,
            refill_period_ms: options.refill_period_ms,
            bypass_paths: Arc::from(bypass_paths),
        }
    }

    /// Whether requests to `path` skip the limiter.
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths
            .iter()
            .any(|bypass| path.contains(bypass.as_str()))
    }

    /// Admit one request from `caller_id` to `path`.
    ///
    /// Bypassed paths return [`RateLimitDecision::Bypassed`] without touching the bucket.
    pub async fn admit(
        &self,
        caller_id: &str,
        path: &str,
    ) -> Result<RateLimitDecision, TallymanError> {
        if self.is_bypassed(path) {
            tracing::debug!(caller_id, path, "Rate limiter bypassed");
            return Ok(RateLimitDecision::Bypassed);
        }

        self.try_consume(caller_id, 1).await
    }

    /// Take `cost` tokens from the bucket of `caller_id`.
    ///
    /// A rejected call takes nothing. A caller seen for the first time, or idle for a
    /// full refill period, starts with a full bucket.
    pub async fn try_consume(
        &self,
        caller_id: &str,
        cost: u64,
    ) -> Result<RateLimitDecision, TallymanError> {
        if caller_id.trim().is_empty() {
            return Err(TallymanError::ValidationError(
                "Caller id is mandatory".to_string(),
            ));
        }

        if cost == 0 {
            return Err(TallymanError::ValidationError(
                "Cost must be greater than 0".to_string(),
            ));
        }

        let state = self
            .store
            .take_tokens(
                &self.key_generator.bucket_key(caller_id),
                *self.capacity,
                self.refill_period_ms.as_duration(),
                cost,
            )
            .await?;

        if state.admitted {
            tracing::debug!(caller_id, remaining = state.remaining, "Request admitted");

            Ok(RateLimitDecision::Allowed {
                remaining_tokens: state.remaining,
            })
        } else {
            tracing::debug!(
                caller_id,
                remaining = state.remaining,
                retry_after_ms = state.retry_after_ms,
                "Request rate limited"
            );

            Ok(RateLimitDecision::Rejected {
                remaining_tokens: state.remaining,
                retry_after_ms: state.retry_after_ms,
            })
        }
    } // end method try_consume

    /// Bucket capacity.
    pub fn capacity(&self) -> BucketCapacity {
        self.capacity
    }

    /// Bucket refill period.
    pub fn refill_period_ms(&self) -> RefillPeriodMs {
        self.refill_period_ms
    }
}
