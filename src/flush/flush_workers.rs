use tokio::task::JoinHandle;

use crate::{
    TallymanError,
    flush::{FlushHandler, FlushOutcome},
    store::ExpirationSubscription,
};

/// A pool of tasks flushing windows as their buffer entries expire.
///
/// All workers receive from one shared [`ExpirationSubscription`], so each event is
/// handled by exactly one of them.
pub struct FlushWorkers {
    subscription: ExpirationSubscription,
    handles: Vec<JoinHandle<()>>,
}

impl FlushWorkers {
    /// Start `count` workers draining `subscription` through `handler`.
    pub fn spawn(
        handler: FlushHandler,
        subscription: ExpirationSubscription,
        count: usize,
    ) -> Result<Self, TallymanError> {
        if count == 0 {
            return Err(TallymanError::InvalidConfig(
                "Flush worker count must be greater than 0".to_string(),
            ));
        }

        let handles = (0..count)
            .map(|worker| {
                let handler = handler.clone();
                let subscription = subscription.clone();

                tokio::spawn(async move {
                    while let Some(expired_key) = subscription.recv().await {
                        handle_event(&handler, worker, &expired_key).await;
                    }

                    tracing::debug!(worker, "Flush worker stopped");
                })
            })
            .collect();

        tracing::info!(count, "Flush workers started");

        Ok(Self {
            subscription,
            handles,
        })
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop accepting expiration events and wait for the workers to finish.
    ///
    /// Events already queued and flushes in progress complete first.
    pub async fn shutdown(self) {
        self.subscription.close();

        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "Flush worker panicked");
            }
        }

        tracing::info!("Flush workers stopped");
    }
}

async fn handle_event(handler: &FlushHandler, worker: usize, expired_key: &str) {
    match handler.handle_expired(expired_key).await {
        Ok(FlushOutcome::Ignored) => {}
        Ok(outcome) => {
            tracing::debug!(worker, expired_key, outcome = ?outcome, "Expiration handled");
        }
        Err(err @ TallymanError::FlushCommitFailed { .. }) => {
            tracing::error!(
                error = ?err,
                worker,
                expired_key,
                "Durable write failed, shadow entry kept for retry"
            );
        }
        Err(err) => {
            tracing::error!(error = ?err, worker, expired_key, "Flush failed");
        }
    }
}
