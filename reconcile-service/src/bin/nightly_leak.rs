use anyhow::{bail, Result};
use network_client::db::rollup_queries;
use reconcile_service::{build_engine, config::AppConfig, config::StoreKind, observability, store};
use std::{env, sync::Arc};
use time::{macros::format_description, Date, Duration};

/// Run the leak estimate of one zone and night by hand, then print the
/// zone's estimated losses over the preceding 30 nights.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: nightly_leak <zone_id> <YYYY-MM-DD>");
    }
    let zone_id = &args[1];
    let night = Date::parse(&args[2], format_description!("[year]-[month]-[day]"))
        .map_err(|e| anyhow::anyhow!("invalid night '{}': {e}", args[2]))?;

    let cfg = AppConfig::load()?;
    if cfg.store.kind != StoreKind::Postgres {
        bail!("nightly_leak needs the postgres store; the in-memory store holds no history");
    }

    let network = Arc::new(cfg.load_network()?);
    let pg = store::connect_postgres(&cfg.store).await?;
    let pool = pg.pool().clone();
    let engine = build_engine(Arc::new(pg), network, &cfg.reconcile)?;

    let leak = engine.run_nightly_leak_estimate(zone_id, night).await?;
    println!("{}", serde_json::to_string_pretty(&leak)?);

    let totals = rollup_queries::zone_loss_totals(
        &pool,
        &[zone_id.clone()],
        night - Duration::days(29),
        night + Duration::days(1),
    )
    .await?;
    for t in totals {
        println!(
            "{}",
            serde_json::json!({
                "zone_id": t.zone_id,
                "nights": t.nights,
                "total_loss": t.total_loss,
            })
        );
    }

    Ok(())
}
