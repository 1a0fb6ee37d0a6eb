use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use network_client::domain::{DeviceKind, RawReading};
use tokio::sync::mpsc;

use crate::{
    engine::{Engine, EngineError, NightlyDue},
    pipeline::{Envelope, PipelineError, Sink},
};

/// Feeds readings into the engine one at a time, in arrival order.
///
/// Transient store failures are retried with linear backoff. Everything else
/// is logged and counted; a bad reading never stops the stream.
#[derive(Clone)]
pub struct ReconcileWorker {
    engine: Arc<Engine>,
    max_retries: u32,
    retry_backoff: Duration,
    nightly: Option<mpsc::Sender<NightlyDue>>,
}

impl ReconcileWorker {
    pub fn new(
        engine: Arc<Engine>,
        max_retries: u32,
        retry_backoff: Duration,
        nightly: Option<mpsc::Sender<NightlyDue>>,
    ) -> Self {
        Self {
            engine,
            max_retries,
            retry_backoff,
            nightly,
        }
    }

    async fn dispatch(&self, r: &RawReading) -> Result<Vec<NightlyDue>, EngineError> {
        match r.kind {
            DeviceKind::Flow => Ok(self.engine.record_pulse(&r.device_id, r.ts, &r.raw).await?.nightly_due),
            DeviceKind::Pressure => {
                self.engine.record_pressure(&r.device_id, r.ts, &r.raw).await?;
                Ok(Vec::new())
            }
            DeviceKind::Chlorine => {
                self.engine.record_chlorine(&r.device_id, r.ts, &r.raw).await?;
                Ok(Vec::new())
            }
        }
    }

    pub async fn handle(&self, env: Envelope<RawReading>) {
        let r = &env.payload;
        let mut attempt: u32 = 0;
        loop {
            match self.dispatch(r).await {
                Ok(due) => {
                    metrics::counter!("reconcile_readings_processed_total").increment(1);
                    if let Ok(dur) = std::time::SystemTime::now().duration_since(env.received_at) {
                        metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
                    }
                    self.forward(due).await;
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        device = %r.device_id,
                        ts = %r.ts,
                        error = %e,
                        attempt,
                        "reconciliation contended, retrying with backoff"
                    );
                    metrics::counter!("reconcile_retry_total").increment(1);
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e @ (EngineError::DuplicatePulse { .. } | EngineError::DuplicateReading { .. })) => {
                    tracing::info!(device = %r.device_id, ts = %r.ts, error = %e, "duplicate reading ignored");
                    metrics::counter!("reconcile_duplicates_total").increment(1);
                    return;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(
                        device = %r.device_id,
                        ts = %r.ts,
                        error = %e,
                        "reconciliation aborted on inconsistent state"
                    );
                    metrics::counter!("reconcile_inconsistencies_total").increment(1);
                    return;
                }
                Err(e) => {
                    tracing::warn!(device = %r.device_id, ts = %r.ts, error = %e, "reading rejected");
                    metrics::counter!("reconcile_rejected_total").increment(1);
                    return;
                }
            }
        }
    }

    async fn forward(&self, due: Vec<NightlyDue>) {
        let Some(tx) = &self.nightly else {
            return;
        };
        for d in due {
            if tx.send(d).await.is_err() {
                tracing::warn!("nightly scheduler gone, leak estimate not scheduled");
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<RawReading> for ReconcileWorker {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<RawReading>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            match item {
                Ok(env) => self.handle(env).await,
                Err(e) => tracing::debug!(error = %e, "upstream item dropped"),
            }
        }
        Ok(())
    }
}

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Runs several [`ReconcileWorker`]s, routing each device to a fixed worker
/// so its readings stay in order.
pub struct ReconcileSink {
    worker: ReconcileWorker,
    workers: usize,
    channel_capacity: usize,
}

impl ReconcileSink {
    pub fn new(worker: ReconcileWorker, workers: usize, channel_capacity: usize) -> Self {
        Self {
            worker,
            workers: workers.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }
}

#[async_trait::async_trait]
impl Sink<RawReading> for ReconcileSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<RawReading>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let (tx, rx) = mpsc::channel::<Envelope<RawReading>>(self.channel_capacity);
            txs.push(tx);

            let worker = self.worker.clone();
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok);
            joins.push(tokio::spawn(async move { worker.run(stream).await }));
        }

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::debug!(error = %e, "upstream item dropped");
                    continue;
                }
            };

            let idx = shard_index(&env.payload.device_id, self.workers);
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink("reconcile worker channel closed".to_string()));
            }
        }

        drop(txs);

        for j in joins {
            match j.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(PipelineError::Sink(format!("reconcile worker join error: {e}"))),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_index_is_stable_and_bounded() {
        for key in ["mtr-1", "mtr-2", "pt-1"] {
            let a = shard_index(key, 4);
            assert_eq!(a, shard_index(key, 4));
            assert!(a < 4);
        }
        assert_eq!(shard_index("mtr-1", 0), 0);
    }
}
