use std::sync::Arc;

use network_client::db::{EntityStore, MemoryStore, PgStore};
use sqlx::postgres::PgPoolOptions;

use crate::config::{StoreConfig, StoreKind};

pub async fn connect_postgres(cfg: &StoreConfig) -> anyhow::Result<PgStore> {
    let uri = cfg
        .uri
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("store.uri is required for the postgres store"))?;
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(uri)
        .await?;
    let store = PgStore::new(pool);
    if cfg.apply_schema {
        store.apply_schema().await?;
        tracing::info!("reconciliation schema applied");
    }
    Ok(store)
}

/// Open the configured entity store.
pub async fn open(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn EntityStore>> {
    Ok(match cfg.kind {
        StoreKind::Memory => {
            tracing::warn!("using the in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Postgres => Arc::new(connect_postgres(cfg).await?),
    })
}
