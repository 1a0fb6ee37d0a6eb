use std::{sync::Arc, time::Duration};

use anyhow::Result;
use network_client::domain::RawReading;
use reconcile_service::{
    build_engine,
    config::AppConfig,
    metrics_server,
    nightly::NightlyScheduler,
    observability,
    pipeline::Pipeline,
    sinks::{ReconcileSink, ReconcileWorker},
    sources::HttpReadingsSource,
    store, transform,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let network = Arc::new(cfg.load_network()?);
    tracing::info!(
        zones = network.zones().count(),
        subscribers = network.subscribers().len(),
        "network loaded"
    );

    let store = store::open(&cfg.store).await?;
    let engine = Arc::new(build_engine(store, network, &cfg.reconcile)?);

    let (nightly_tx, nightly) =
        NightlyScheduler::new(engine.clone(), Duration::from_secs(cfg.reconcile.mnf.delay_secs)).spawn(256);

    let sink_cfg = &cfg.readings.sink;
    let worker = ReconcileWorker::new(engine, sink_cfg.max_retries, sink_cfg.retry_backoff(), Some(nightly_tx));
    let source_cfg = &cfg.readings.source;
    let pipeline: Pipeline<_, RawReading, _> = Pipeline {
        source: HttpReadingsSource::new(&source_cfg.http_bind_addr, source_cfg.channel_capacity).await?,
        transforms: vec![Arc::new(transform::ReadingValidation)],
        sink: ReconcileSink::new(worker, sink_cfg.workers, source_cfg.channel_capacity),
    };

    pipeline.run().await?;
    nightly.await?;

    Ok(())
}
