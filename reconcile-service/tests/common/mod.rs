//! Shared helpers for reconciliation scenarios.
#![allow(dead_code)]

use std::sync::Arc;

use network_client::{
    db::{EntityStore, MemoryStore},
    domain::{PendingKind, PendingRecord, Resolution, Series, Target},
};
use reconcile_service::{
    build_engine,
    config::{parse_network, ReconcileConfig},
    engine::Hooks,
    Engine, EngineError,
};
use time::OffsetDateTime;

/// Engine over a fresh in-memory store.
pub fn engine(network_toml: &str) -> Engine {
    engine_with(network_toml, &ReconcileConfig::default())
}

pub fn engine_with(network_toml: &str, cfg: &ReconcileConfig) -> Engine {
    let network = parse_network(network_toml).expect("network fixture");
    build_engine(Arc::new(MemoryStore::new()), Arc::new(network), cfg).expect("engine")
}

pub fn engine_with_hooks(network_toml: &str, hooks: Hooks) -> Engine {
    engine(network_toml).with_hooks(hooks)
}

pub async fn pulse(engine: &Engine, meter: &str, ts: OffsetDateTime, raw: f64) {
    engine
        .record_pulse(meter, ts, &raw.to_string())
        .await
        .unwrap_or_else(|e| panic!("pulse {meter}@{ts}: {e}"));
}

pub async fn pressure(engine: &Engine, transmitter: &str, ts: OffsetDateTime, raw: f64) {
    engine
        .record_pressure(transmitter, ts, &raw.to_string())
        .await
        .unwrap_or_else(|e| panic!("pressure {transmitter}@{ts}: {e}"));
}

/// Value of an aggregate that must exist and carry a value.
pub async fn value(engine: &Engine, series: Series, target: &str, res: Resolution, at: OffsetDateTime) -> f64 {
    engine
        .get_aggregate(series, target, res, at)
        .await
        .unwrap_or_else(|e| panic!("{series} {res} {target}@{at}: {e}"))
        .unwrap_or_else(|| panic!("{series} {res} {target}@{at} has no value"))
}

pub async fn absent(engine: &Engine, series: Series, target: &str, res: Resolution, at: OffsetDateTime) -> bool {
    matches!(
        engine.get_aggregate(series, target, res, at).await,
        Err(EngineError::NotFound { .. })
    )
}

pub async fn pending(engine: &Engine, target: Target) -> Vec<PendingRecord> {
    engine.store().pending_for(&target).await.expect("pending records")
}

pub async fn pending_at(engine: &Engine, target: Target, tick: OffsetDateTime) -> Option<PendingRecord> {
    pending(engine, target).await.into_iter().find(|r| r.key.tick == tick)
}

pub async fn pending_of(
    engine: &Engine,
    target: Target,
    tick: OffsetDateTime,
    kind: PendingKind,
) -> Option<PendingRecord> {
    pending(engine, target)
        .await
        .into_iter()
        .find(|r| r.key.tick == tick && r.key.kind == kind)
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}
