//! Store contracts the write-behind pipeline is built on.
//!
//! The [`FastStore`] holds the live window state (buffer entries, shadow entries, claim
//! markers, token buckets) and publishes the names of keys that expire. The
//! [`DurableStore`] holds the all-time [`SumRecord`] per key.
//!
//! Both are shared as `Arc<dyn ...>` and passed to each component's constructor.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{TallyKey, TallymanError};

mod key_generator;
pub(crate) use key_generator::*;

/// The fast store keys that make up one counter window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKeys {
    /// TTL-bearing running sum for the open window.
    pub buffer: Arc<str>,
    /// TTL-less mirror read by the flush handler after the buffer expires.
    pub shadow: Arc<str>,
    /// Claim marker held by the flush in progress.
    pub claim: Arc<str>,
}

/// Outcome of [`FastStore::open_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenWindow {
    /// The buffer entry was created with the window TTL and the shadow entry reset.
    Opened {
        /// A shadow value left over from a previous window that was overwritten.
        displaced: Option<i64>,
    },
    /// A buffer entry already existed; nothing was written.
    AlreadyOpen,
}

/// Outcome of [`FastStore::claim_shadow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowClaim {
    /// The caller now owns the flush for this key until the claim TTL lapses.
    Claimed,
    /// The shadow entry is gone, changed, or already claimed by someone else.
    Lost,
    /// A new window is open for the key; its shadow entry is live data.
    WindowOpen,
}

/// Outcome of [`FastStore::restore_shadow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowRestore {
    /// The claim was still held; the shadow entry lost its claim TTL and stays.
    Retained,
    /// The shadow entry had lapsed or been replaced; the value was added back into it.
    Merged,
    /// Another flush owns the current shadow entry; nothing was written.
    Conflict,
}

/// State of a token bucket after one [`FastStore::take_tokens`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketState {
    /// Whether `cost` tokens were taken.
    pub admitted: bool,
    /// Whole tokens left in the bucket.
    pub remaining: u64,
    /// Milliseconds until `cost` tokens are available; `0` when admitted.
    pub retry_after_ms: u64,
}

/// A stream of expired key names.
///
/// Clones share one queue, so several workers can drain the same subscription.
/// Closing any clone closes the subscription for all of them; events already queued
/// can still be received.
#[derive(Debug, Clone)]
pub struct ExpirationSubscription {
    receiver: async_channel::Receiver<String>,
}

impl ExpirationSubscription {
    pub(crate) fn new(receiver: async_channel::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// Wait for the next expired key. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<String> {
        self.receiver.recv().await.ok()
    }

    /// Stop accepting new events.
    pub fn close(&self) -> bool {
        self.receiver.close()
    }

    /// Whether the subscription has been closed.
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Number of events waiting to be received.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Primitive operations on the fast key-value store.
///
/// Single-key primitives are atomic per call. The window primitives touch the buffer,
/// shadow and claim keys of one counter and are atomic across all three.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, TallymanError>;

    /// Read an integer value.
    async fn get(&self, key: &str) -> Result<Option<i64>, TallymanError>;

    /// Create `key = value` with `ttl` only if `key` is absent. Returns whether it was created.
    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, TallymanError>;

    /// Add `delta` to an existing integer, keeping its TTL.
    ///
    /// Fails with [`TallymanError::NotFound`] when `key` is absent; never creates it.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, TallymanError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, TallymanError>;

    /// List live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, TallymanError>;

    /// Subscribe to the names of keys removed by TTL expiry.
    ///
    /// Delivery is best effort: events can be duplicated or, under overload or
    /// disconnection, dropped.
    async fn subscribe_expirations(&self) -> Result<ExpirationSubscription, TallymanError>;

    /// Open a window: create the buffer entry with `ttl` if absent and, only then,
    /// overwrite the shadow entry with `delta` and drop any claim marker.
    async fn open_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
        ttl: Duration,
    ) -> Result<OpenWindow, TallymanError>;

    /// Add `delta` to the buffer and shadow entries if the buffer entry exists.
    ///
    /// Returns the new shadow value, or `None` when no window is open.
    async fn add_to_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
    ) -> Result<Option<i64>, TallymanError>;

    /// Claim the flush of a closed window whose shadow entry still holds `expected`.
    ///
    /// A successful claim records the claim marker and puts the same `ttl` on the shadow
    /// entry, so a claim that is never released takes the shadow entry with it.
    async fn claim_shadow(
        &self,
        keys: &WindowKeys,
        expected: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<ShadowClaim, TallymanError>;

    /// Delete the shadow entry and claim marker if the claim is still held by `token`.
    async fn release_shadow(&self, keys: &WindowKeys, token: &str) -> Result<bool, TallymanError>;

    /// Put back `value` after its durable write failed under the claim `token`.
    ///
    /// While `token` still holds the claim, the shadow entry's TTL is cleared and the
    /// claim marker is left to lapse. Otherwise `value` is added to the shadow entry
    /// (creating it) unless another flush holds the claim.
    async fn restore_shadow(
        &self,
        keys: &WindowKeys,
        token: &str,
        value: i64,
    ) -> Result<ShadowRestore, TallymanError>;

    /// Take `cost` tokens from the bucket at `key`, refilling continuously at
    /// `capacity / refill_period`. A missing bucket starts full.
    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_period: Duration,
        cost: u64,
    ) -> Result<TokenBucketState, TallymanError>;
}

/// All-time accumulated total for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumRecord {
    /// Counter key.
    pub key: String,
    /// Sum of every flushed window.
    pub sum: i64,
}

/// The durable store flushed windows are committed to.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Add `delta` to the record for `key`, creating it with `sum = delta` if absent.
    ///
    /// Returns the new sum.
    async fn upsert_add(&self, key: &TallyKey, delta: i64) -> Result<i64, TallymanError>;

    /// Read the record for `key`.
    async fn get(&self, key: &TallyKey) -> Result<Option<SumRecord>, TallymanError>;
}
