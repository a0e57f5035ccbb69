//! Top-level entrypoint that wires the pipeline together.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::{
    ApplyOutcome, ClaimTtlMs, FlushHandler, FlushWorkers, IncrementCoordinator, IncrementRequest,
    RateLimitDecision, RateLimiter, RateLimiterOptions, ShadowSweeper, StorePrefix,
    SweepIntervalMs, TallyKey, TallymanError, WindowSizeSeconds,
    store::{DurableStore, FastStore, KeyGenerator},
};

/// Configuration for [`Tallyman`].
///
/// Every instance sharing a fast store must use the same prefix, window and claim TTL.
#[derive(Clone, Debug, Default)]
pub struct TallymanOptions {
    /// Namespace for every fast store key.
    ///
    /// If `None`, defaults to `"tallyman"`.
    pub prefix: Option<StorePrefix>,

    /// Buffering window length. See [`WindowSizeSeconds`].
    pub window_size_seconds: WindowSizeSeconds,

    /// Flush claim lifetime. See [`ClaimTtlMs`].
    pub claim_ttl_ms: ClaimTtlMs,

    /// Per-caller admission control.
    pub rate_limit: RateLimiterOptions,

    /// Period of the reconciliation sweep started by [`Tallyman::run_sweep_loop`].
    pub sweep_interval_ms: SweepIntervalMs,
}

/// An increment accepted for buffering.
///
/// Acceptance means the increment is in the fast store, not that it has been committed
/// to the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// The validated counter key.
    pub key: TallyKey,
    /// Whether the increment opened or extended a window.
    pub outcome: ApplyOutcome,
    /// Tokens left in the caller's bucket; `None` when the path bypassed the limiter.
    pub remaining_tokens: Option<u64>,
}

/// Write-behind counter service.
///
/// Accepts increments through [`Tallyman::apply`], buffers them in per-key windows in
/// the fast store and flushes each closed window to the durable store once.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use tallyman::{
///     IncrementRequest, LocalFastStore, LocalFastStoreOptions, LocalSumStore, Tallyman,
///     TallymanOptions,
/// };
///
/// # async fn run() -> Result<(), tallyman::TallymanError> {
/// let tallyman = Tallyman::new(
///     LocalFastStore::new(LocalFastStoreOptions::default()),
///     Arc::new(LocalSumStore::new()),
///     TallymanOptions::default(),
/// );
///
/// let workers = tallyman.start_flush_workers(4).await?;
/// tallyman.run_sweep_loop();
///
/// let accepted = tallyman
///     .apply(&IncrementRequest {
///         caller_id: "10.0.0.1".to_string(),
///         path: "/api/increment".to_string(),
///         key: "page_views".to_string(),
///         value: 1,
///     })
///     .await?;
///
/// println!("{:?}", accepted.outcome);
///
/// tallyman.stop_sweep_loop();
/// workers.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Tallyman {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    coordinator: IncrementCoordinator,
    rate_limiter: RateLimiter,
    flush_handler: FlushHandler,
    sweeper: ShadowSweeper,
    sweep_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl Tallyman {
    /// Create a new [`Tallyman`] over the given stores.
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        options: TallymanOptions,
    ) -> Self {
        let prefix = options.prefix.unwrap_or_default();
        let key_generator = KeyGenerator::new(prefix);

        let coordinator = IncrementCoordinator::with_key_generator(
            fast.clone(),
            key_generator.clone(),
            options.window_size_seconds,
        );
        let rate_limiter = RateLimiter::with_key_generator(
            fast.clone(),
            key_generator.clone(),
            options.rate_limit,
        );
        let flush_handler = FlushHandler::with_key_generator(
            fast.clone(),
            durable.clone(),
            key_generator,
            options.claim_ttl_ms,
        );
        let sweeper = ShadowSweeper::new(
            fast.clone(),
            flush_handler.clone(),
            options.sweep_interval_ms,
        );

        Self {
            fast,
            durable,
            coordinator,
            rate_limiter,
            flush_handler,
            sweeper,
            sweep_stop: Mutex::new(None),
        }
    }

    /// Admit, validate and buffer one increment.
    ///
    /// Admission runs first, so a rejected call never touches the counter's window.
    ///
    /// # Errors
    ///
    /// - [`TallymanError::RateLimited`] when the caller's bucket is empty
    /// - [`TallymanError::ValidationError`] for a blank key or a non-positive value
    /// - [`TallymanError::StoreUnavailable`] when the fast store cannot be reached
    pub async fn apply(&self, request: &IncrementRequest) -> Result<Accepted, TallymanError> {
        let decision = self
            .rate_limiter
            .admit(&request.caller_id, &request.path)
            .await?;

        if let RateLimitDecision::Rejected { retry_after_ms, .. } = decision {
            return Err(TallymanError::RateLimited {
                caller_id: request.caller_id.clone(),
                retry_after_ms,
            });
        }

        let (key, delta) = request.validate()?;
        let outcome = self.coordinator.apply(&key, delta).await?;

        Ok(Accepted {
            key,
            outcome,
            remaining_tokens: decision.remaining_tokens(),
        })
    } // end method apply

    /// Subscribe to expirations and start `count` flush workers.
    pub async fn start_flush_workers(&self, count: usize) -> Result<FlushWorkers, TallymanError> {
        let subscription = self.fast.subscribe_expirations().await?;

        FlushWorkers::spawn(self.flush_handler.clone(), subscription, count)
    }

    /// Start sweeping for stranded shadow entries every sweep interval.
    ///
    /// The first sweep runs immediately. Calling this while the loop runs does nothing.
    /// Must be called inside a tokio runtime.
    pub fn run_sweep_loop(&self) {
        let mut sweep_stop = self
            .sweep_stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if sweep_stop.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *sweep_stop = Some(tx);

        let sweeper = self.sweeper.clone();
        let period = sweeper.sweep_interval_ms().as_duration();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = rx.changed() => break,
                }

                if let Err(err) = sweeper.sweep_once().await {
                    tracing::error!(error = ?err, "Sweep failed");
                }
            }

            tracing::debug!("Sweep loop stopped");
        });

        tracing::info!(sweep_interval_ms = *self.sweeper.sweep_interval_ms(), "Sweep loop started");
    } // end method run_sweep_loop

    /// Stop the sweep loop. A sweep in progress finishes first.
    ///
    /// Calling this when no loop runs does nothing.
    pub fn stop_sweep_loop(&self) {
        let stop = self
            .sweep_stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
    }

    /// Whether the sweep loop is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweep_stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Access the increment coordinator.
    pub fn coordinator(&self) -> &IncrementCoordinator {
        &self.coordinator
    }

    /// Access the rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Access the flush handler.
    pub fn flush_handler(&self) -> &FlushHandler {
        &self.flush_handler
    }

    /// Access the reconciliation sweeper.
    pub fn sweeper(&self) -> &ShadowSweeper {
        &self.sweeper
    }

    /// Access the fast store.
    pub fn fast_store(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    /// Access the durable store.
    pub fn durable_store(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }
}
