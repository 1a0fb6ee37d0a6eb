pub mod config;
pub mod engine;
pub mod metrics_server;
pub mod nightly;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod store;
pub mod transform;

pub use engine::{Engine, EngineError, EngineSettings};
pub use pipeline::{Envelope, Pipeline};

use std::sync::Arc;

use network_client::{db::EntityStore, domain::Network};

use crate::{
    config::ReconcileConfig,
    engine::{Hooks, StaticIgnoreSet},
};

/// Engine with the ignore set and timings taken from configuration.
pub fn build_engine(
    store: Arc<dyn EntityStore>,
    network: Arc<Network>,
    cfg: &ReconcileConfig,
) -> anyhow::Result<Engine> {
    let settings = EngineSettings::from_config(cfg)?;
    let hooks = Hooks {
        ignore: Arc::new(StaticIgnoreSet::new(cfg.ignored_meters.iter().cloned())),
        ..Hooks::default()
    };
    Ok(Engine::new(store, network, settings).with_hooks(hooks))
}
