use std::sync::Arc;

use crate::{
    IncrementDelta, StorePrefix, TallyKey, TallymanError, WindowSizeSeconds,
    store::{FastStore, KeyGenerator, OpenWindow},
};

/// Attempts at the add/open pair before giving up on a key whose window keeps flipping.
const MAX_WINDOW_ATTEMPTS: usize = 3;

/// What an accepted increment did to its key's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The increment opened a new window.
    Opened,
    /// The increment was added to the open window.
    Extended {
        /// Sum buffered in the window so far, including this increment.
        running_sum: i64,
    },
}

/// Buffers increments into per-key windows in the [`FastStore`].
///
/// The first increment for a key opens a window whose TTL is fixed at that moment.
/// Later increments add to it without touching the TTL. When the window expires, the
/// flush pipeline moves its sum to the durable store.
///
/// Holds no locks of its own; per-key exclusivity comes from the store's atomic window
/// primitives.
#[derive(Clone)]
pub struct IncrementCoordinator {
    store: Arc<dyn FastStore>,
    key_generator: KeyGenerator,
    window_size_seconds: WindowSizeSeconds,
}

impl IncrementCoordinator {
    /// Create a coordinator writing windows under `prefix`.
    pub fn new(
        store: Arc<dyn FastStore>,
        prefix: StorePrefix,
        window_size_seconds: WindowSizeSeconds,
    ) -> Self {
        Self::with_key_generator(store, KeyGenerator::new(prefix), window_size_seconds)
    }

    pub(crate) fn with_key_generator(
        store: Arc<dyn FastStore>,
        key_generator: KeyGenerator,
        window_size_seconds: WindowSizeSeconds,
    ) -> Self {
        Self {
            store,
            key_generator,
            window_size_seconds,
        }
    }

    /// Buffer `delta` for `key`.
    ///
    /// Fails fast when the store is unreachable; nothing is buffered locally.
    pub async fn apply(
        &self,
        key: &TallyKey,
        delta: IncrementDelta,
    ) -> Result<ApplyOutcome, TallymanError> {
        let keys = self.key_generator.window_keys(key);
        let ttl = self.window_size_seconds.as_duration();

        for _ in 0..MAX_WINDOW_ATTEMPTS {
            if let Some(running_sum) = self.store.add_to_window(&keys, *delta).await? {
                tracing::debug!(key = %key, delta = *delta, running_sum, "Increment buffered");
                return Ok(ApplyOutcome::Extended { running_sum });
            }

            match self.store.open_window(&keys, *delta, ttl).await? {
                OpenWindow::Opened { displaced } => {
                    if let Some(displaced) = displaced {
                        tracing::warn!(
                            key = %key,
                            displaced,
                            "Opened window over an unreleased shadow entry, its sum is lost unless a flush holds it"
                        );
                    }

                    tracing::info!(
                        key = %key,
                        delta = *delta,
                        window_size_seconds = *self.window_size_seconds,
                        "Window opened"
                    );
                    return Ok(ApplyOutcome::Opened);
                }
                // Another writer opened the window between our two calls.
                OpenWindow::AlreadyOpen => continue,
            }
        }

        tracing::warn!(key = %key, "Window kept changing, increment not buffered");

        Err(TallymanError::WindowContention(key.to_string()))
    } // end method apply

    /// The window length new windows are opened with.
    pub fn window_size_seconds(&self) -> WindowSizeSeconds {
        self.window_size_seconds
    }
}
