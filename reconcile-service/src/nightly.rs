//! Deferred nightly leak estimates.
//!
//! Reconciliation reports a zone as due once its midnight window settles. The
//! estimate runs `delay` later so that late hourly pressures of the same day
//! can still land. Estimates run one at a time, off the ingestion path.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::engine::{Engine, EngineError, NightlyDue};

pub struct NightlyScheduler {
    engine: Arc<Engine>,
    delay: Duration,
}

impl NightlyScheduler {
    pub fn new(engine: Arc<Engine>, delay: Duration) -> Self {
        Self { engine, delay }
    }

    /// Start the worker. It stops once every sender is dropped and the queue
    /// is drained.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<NightlyDue>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<NightlyDue>) {
        while let Some(due) = rx.recv().await {
            let at = Instant::now() + self.delay;
            tokio::time::sleep_until(at).await;
            self.estimate(&due).await;
        }
        tracing::debug!("nightly scheduler stopped");
    }

    pub async fn estimate(&self, due: &NightlyDue) {
        match self.engine.run_nightly_leak_estimate(&due.zone_id, due.night).await {
            Ok(leak) => tracing::debug!(
                zone = %due.zone_id,
                night = %due.night,
                amount = leak.loss_record.amount,
                "nightly estimate done"
            ),
            Err(e @ EngineError::IndeterminateLeakEstimate { .. }) => {
                metrics::counter!("reconcile_leak_indeterminate_total").increment(1);
                tracing::warn!(error = %e, "nightly estimate skipped");
            }
            Err(EngineError::AlreadyEstimated { .. }) => {
                tracing::debug!(zone = %due.zone_id, night = %due.night, "nightly estimate already recorded");
            }
            Err(e) => {
                metrics::counter!("reconcile_leak_errors_total").increment(1);
                tracing::error!(zone = %due.zone_id, night = %due.night, error = %e, "nightly estimate failed");
            }
        }
    }
}
