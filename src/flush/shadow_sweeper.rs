use std::sync::Arc;

use crate::{
    SweepIntervalMs, TallymanError,
    flush::{FlushHandler, FlushOutcome},
    store::FastStore,
};

/// Counts from one [`ShadowSweeper::sweep_once`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Whether this instance held the sweep lease. Nothing else is set when it did not.
    pub lease_held: bool,
    /// Shadow entries found.
    pub scanned: usize,
    /// Windows committed to the durable store.
    pub flushed: usize,
    /// Shadow entries belonging to open windows, held claims or already gone.
    pub skipped: usize,
    /// Flush attempts that failed.
    pub failed: usize,
}

/// Reconciliation pass over shadow entries whose expiration event never arrived.
///
/// Expiration delivery is best effort, so a closed window can strand its shadow entry.
/// The sweep runs every shadow entry through the normal flush path; the claim rejects
/// open windows and flushes already in progress.
///
/// A lease in the fast store limits sweeping to one instance per interval.
#[derive(Clone)]
pub struct ShadowSweeper {
    fast: Arc<dyn FastStore>,
    handler: FlushHandler,
    sweep_interval_ms: SweepIntervalMs,
}

impl ShadowSweeper {
    /// Create a sweeper flushing through `handler`.
    pub fn new(
        fast: Arc<dyn FastStore>,
        handler: FlushHandler,
        sweep_interval_ms: SweepIntervalMs,
    ) -> Self {
        Self {
            fast,
            handler,
            sweep_interval_ms,
        }
    }

    /// Run one sweep if no other instance swept within the last interval.
    pub async fn sweep_once(&self) -> Result<SweepReport, TallymanError> {
        let key_generator = self.handler.key_generator();

        let acquired = self
            .fast
            .set_if_absent(
                key_generator.sweep_lease_key(),
                1,
                self.sweep_interval_ms.as_duration(),
            )
            .await?;

        if !acquired {
            tracing::debug!("Sweep lease held elsewhere");
            return Ok(SweepReport::default());
        }

        let shadow_keys = self.fast.scan_prefix(key_generator.shadow_prefix()).await?;

        let mut report = SweepReport {
            lease_held: true,
            scanned: shadow_keys.len(),
            ..Default::default()
        };

        for shadow_key in shadow_keys {
            let Some(key) = key_generator.parse_shadow_key(&shadow_key) else {
                report.skipped += 1;
                continue;
            };

            match self.handler.flush(&key).await {
                Ok(FlushOutcome::Flushed { .. }) => report.flushed += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    tracing::error!(error = ?err, key = %key, "Sweep flush failed");
                    report.failed += 1;
                }
            }
        }

        if report.flushed > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                flushed = report.flushed,
                failed = report.failed,
                "Sweep recovered stranded windows"
            );
        } else {
            tracing::debug!(scanned = report.scanned, "Sweep found nothing stranded");
        }

        Ok(report)
    } // end method sweep_once

    /// Period between sweeps.
    pub fn sweep_interval_ms(&self) -> SweepIntervalMs {
        self.sweep_interval_ms
    }
}
