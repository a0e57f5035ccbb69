use std::sync::Arc;

use crate::{
    ClaimTtlMs, StorePrefix, TallyKey, TallymanError,
    store::{DurableStore, FastStore, KeyGenerator, ShadowClaim, ShadowRestore, WindowKeys},
};

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The window's sum was committed and its shadow entry removed.
    Flushed {
        /// Counter key.
        key: TallyKey,
        /// Sum of the flushed window.
        value: i64,
        /// Durable sum after the commit.
        new_sum: i64,
    },
    /// No shadow entry exists; the window was already flushed.
    NothingToFlush,
    /// Another flush owns the key, or the shadow changed after it was read.
    ClaimLost,
    /// A new window is open for the key, so there is nothing closed to flush.
    WindowOpen,
    /// The expired key is not a buffer entry or claim marker of this prefix.
    Ignored,
}

/// Commits closed windows to the durable store.
///
/// Safe to run concurrently and to call repeatedly for the same key: at most one caller
/// wins the claim, and a flushed window leaves nothing behind to flush again.
#[derive(Clone)]
pub struct FlushHandler {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    key_generator: KeyGenerator,
    claim_ttl_ms: ClaimTtlMs,
}

impl FlushHandler {
    /// Create a handler for windows under `prefix`.
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        prefix: StorePrefix,
        claim_ttl_ms: ClaimTtlMs,
    ) -> Self {
        Self::with_key_generator(fast, durable, KeyGenerator::new(prefix), claim_ttl_ms)
    }

    pub(crate) fn with_key_generator(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        key_generator: KeyGenerator,
        claim_ttl_ms: ClaimTtlMs,
    ) -> Self {
        Self {
            fast,
            durable,
            key_generator,
            claim_ttl_ms,
        }
    }

    /// React to an expiration event.
    ///
    /// An expired buffer entry closes its window; an expired claim marker means an
    /// earlier attempt did not finish. Both flush the key. Anything else is ignored.
    pub async fn handle_expired(&self, expired_key: &str) -> Result<FlushOutcome, TallymanError> {
        if let Some(key) = self.key_generator.parse_buffer_key(expired_key) {
            return self.flush(&key).await;
        }

        if let Some(key) = self.key_generator.parse_claim_key(expired_key) {
            tracing::info!(key = %key, "Flush claim lapsed, retrying");
            return self.flush(&key).await;
        }

        Ok(FlushOutcome::Ignored)
    }

    /// Flush the closed window of `key`, if any.
    ///
    /// The claim puts the claim TTL on the shadow entry. A flush whose release never
    /// lands therefore cannot be committed a second time once the claim lapses.
    ///
    /// Fails with [`TallymanError::FlushCommitFailed`] when the durable write fails; the
    /// value is put back into the shadow entry for a later attempt.
    pub async fn flush(&self, key: &TallyKey) -> Result<FlushOutcome, TallymanError> {
        let keys = self.key_generator.window_keys(key);

        let Some(value) = self.fast.get(&keys.shadow).await? else {
            tracing::debug!(key = %key, "Nothing to flush");
            return Ok(FlushOutcome::NothingToFlush);
        };

        let token = format!("{:016x}", rand::random::<u64>());

        match self
            .fast
            .claim_shadow(&keys, value, &token, self.claim_ttl_ms.as_duration())
            .await?
        {
            ShadowClaim::Claimed => {}
            ShadowClaim::Lost => {
                tracing::debug!(key = %key, value, "Flush claim lost");
                return Ok(FlushOutcome::ClaimLost);
            }
            ShadowClaim::WindowOpen => {
                tracing::debug!(key = %key, "Window reopened, skipping flush");
                return Ok(FlushOutcome::WindowOpen);
            }
        }

        let new_sum = match self.durable.upsert_add(key, value).await {
            Ok(new_sum) => new_sum,
            Err(err) => {
                self.restore(key, &keys, &token, value).await;

                return Err(TallymanError::FlushCommitFailed {
                    key: key.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        match self.fast.release_shadow(&keys, &token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    key = %key,
                    value,
                    claim_ttl_ms = *self.claim_ttl_ms,
                    "Flush claim lapsed before release"
                );
            }
            Err(err) => {
                tracing::error!(
                    error = ?err,
                    key = %key,
                    value,
                    "Committed window but failed to release its shadow entry, it lapses with the claim"
                );
            }
        }

        tracing::info!(key = %key, value, new_sum, "Window flushed");

        Ok(FlushOutcome::Flushed {
            key: key.clone(),
            value,
            new_sum,
        })
    } // end method flush

    /// Put `value` back after a failed durable write.
    async fn restore(&self, key: &TallyKey, keys: &WindowKeys, token: &str, value: i64) {
        match self.fast.restore_shadow(keys, token, value).await {
            Ok(ShadowRestore::Retained) => {
                tracing::debug!(key = %key, value, "Shadow entry kept until the claim lapses");
            }
            Ok(ShadowRestore::Merged) => {
                tracing::warn!(
                    key = %key,
                    value,
                    "Claim lapsed during the durable write, value merged back"
                );
            }
            Ok(ShadowRestore::Conflict) => {
                tracing::error!(
                    key = %key,
                    value,
                    "Claim lapsed during the durable write and another flush owns the key, value lost"
                );
            }
            Err(err) => {
                tracing::error!(
                    error = ?err,
                    key = %key,
                    value,
                    "Failed to restore the shadow entry, value lost when the claim lapses"
                );
            }
        }
    }

    pub(crate) fn key_generator(&self) -> &KeyGenerator {
        &self.key_generator
    }
}
