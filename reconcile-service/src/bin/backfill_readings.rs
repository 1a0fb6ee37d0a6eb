use anyhow::{bail, Result};
use network_client::domain::RawReading;
use reconcile_service::{
    build_engine,
    config::AppConfig,
    nightly::NightlyScheduler,
    observability,
    pipeline::Pipeline,
    sinks::{ReconcileSink, ReconcileWorker},
    sources::ReadingsCsvFileSource,
    store, transform,
};
use std::{env, sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_readings <csv_file_path>");
    }
    let file_path = &args[1];

    // RECONCILE_CONFIG can point at a backfill-specific file.
    let cfg = AppConfig::load()?;
    let network = Arc::new(cfg.load_network()?);
    let store = store::open(&cfg.store).await?;
    let engine = Arc::new(build_engine(store, network, &cfg.reconcile)?);

    // Historical days are complete already; estimate as soon as they close.
    let (nightly_tx, nightly) = NightlyScheduler::new(engine.clone(), Duration::ZERO).spawn(256);

    let sink_cfg = &cfg.readings.sink;
    let worker = ReconcileWorker::new(engine, sink_cfg.max_retries, sink_cfg.retry_backoff(), Some(nightly_tx));
    let pipeline: Pipeline<_, RawReading, _> = Pipeline {
        source: ReadingsCsvFileSource::new(file_path),
        transforms: vec![Arc::new(transform::ReadingValidation)],
        sink: ReconcileSink::new(worker, sink_cfg.workers, cfg.readings.source.channel_capacity),
    };

    pipeline.run().await?;
    nightly.await?;

    tracing::info!(file = %file_path, "backfill finished");
    Ok(())
}
