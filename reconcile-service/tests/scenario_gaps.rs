mod common;

use common::*;
use network_client::domain::{Resolution, Series, Target};
use reconcile_service::{config::ReconcileConfig, engine::ticks};
use time::{macros::datetime, OffsetDateTime};

const ZONE: &str = r#"
[[zones]]
id = "dma"

[[meters]]
id = "in"
input_for = "dma"

[[meters]]
id = "out"
output_for = "dma"
"#;

async fn group(engine: &reconcile_service::Engine, ts: OffsetDateTime, inflow: f64, outflow: f64) {
    pulse(engine, "in", ts, inflow).await;
    pulse(engine, "out", ts, outflow).await;
}

async fn qh(engine: &reconcile_service::Engine, at: OffsetDateTime) -> f64 {
    value(engine, Series::ZoneConsumption, "dma", Resolution::QuarterHour, at).await
}

#[tokio::test]
async fn scenario_gap_is_split_evenly_over_missed_ticks() {
    let engine = engine(ZONE);

    group(&engine, datetime!(2020-03-05 09:45:00 UTC), 990.0, 495.0).await;
    group(&engine, datetime!(2020-03-05 10:00:00 UTC), 1000.0, 500.0).await;
    assert_eq!(qh(&engine, datetime!(2020-03-05 10:00:00 UTC)).await, 5.0);

    // 10:15 and 10:30 never arrive.
    group(&engine, datetime!(2020-03-05 10:45:00 UTC), 1090.0, 530.0).await;
    assert!(absent(&engine, Series::ZoneConsumption, "dma", Resolution::QuarterHour, datetime!(2020-03-05 10:45:00 UTC)).await);

    group(&engine, datetime!(2020-03-05 11:00:00 UTC), 1100.0, 535.0).await;
    assert_eq!(qh(&engine, datetime!(2020-03-05 11:00:00 UTC)).await, 5.0);
    // 10:30 may still turn up.
    assert!(absent(&engine, Series::ZoneConsumption, "dma", Resolution::QuarterHour, datetime!(2020-03-05 10:45:00 UTC)).await);

    group(&engine, datetime!(2020-03-05 11:15:00 UTC), 1110.0, 540.0).await;
    group(&engine, datetime!(2020-03-05 11:30:00 UTC), 1120.0, 545.0).await;
    group(&engine, datetime!(2020-03-05 11:45:00 UTC), 1130.0, 550.0).await;

    for at in [
        datetime!(2020-03-05 10:15:00 UTC),
        datetime!(2020-03-05 10:30:00 UTC),
        datetime!(2020-03-05 10:45:00 UTC),
    ] {
        assert_close(qh(&engine, at).await, 20.0);
    }

    // Quarter-hours add up to the day.
    let rows = engine
        .aggregate_series(
            Series::ZoneConsumption,
            "dma",
            Resolution::QuarterHour,
            datetime!(2020-03-05 00:00:00 UTC),
            datetime!(2020-03-06 00:00:00 UTC),
        )
        .await
        .unwrap();
    let sum: f64 = rows.iter().filter_map(|r| r.value).sum();
    let day = value(&engine, Series::ZoneConsumption, "dma", Resolution::Day, datetime!(2020-03-05 00:00:00 UTC)).await;
    assert_close(sum, 85.0);
    assert_close(day, 85.0);
    assert!(pending(&engine, Target::Zone("dma".into())).await.is_empty());
}

#[tokio::test]
async fn scenario_first_window_without_history_is_null() {
    let cfg = ReconcileConfig {
        late_tolerance_ticks: 1,
        ..ReconcileConfig::default()
    };
    let engine = engine_with(ZONE, &cfg);

    group(&engine, datetime!(2020-03-05 09:45:00 UTC), 990.0, 495.0).await;
    group(&engine, datetime!(2020-03-05 10:00:00 UTC), 1000.0, 500.0).await;

    let first = engine
        .get_aggregate(
            Series::ZoneConsumption,
            "dma",
            Resolution::QuarterHour,
            datetime!(2020-03-05 09:45:00 UTC),
        )
        .await
        .unwrap();
    assert_eq!(first, None);
    assert_eq!(
        value(&engine, Series::ZoneConsumption, "dma", Resolution::Day, datetime!(2020-03-05 00:00:00 UTC)).await,
        5.0
    );
}

#[tokio::test]
async fn scenario_old_gap_is_reset_to_zero() {
    let engine = engine(ZONE);

    group(&engine, datetime!(2020-03-05 10:00:00 UTC), 1000.0, 500.0).await;
    group(&engine, datetime!(2020-03-08 10:00:00 UTC), 5000.0, 600.0).await;
    group(&engine, datetime!(2020-03-08 10:15:00 UTC), 5010.0, 602.0).await;
    assert_eq!(qh(&engine, datetime!(2020-03-08 10:15:00 UTC)).await, 8.0);

    for at in [
        datetime!(2020-03-08 10:30:00 UTC),
        datetime!(2020-03-08 10:45:00 UTC),
        datetime!(2020-03-08 11:00:00 UTC),
    ] {
        group(&engine, at, 5010.0, 602.0).await;
    }

    assert_eq!(qh(&engine, datetime!(2020-03-08 10:00:00 UTC)).await, 0.0);
    assert!(absent(&engine, Series::ZoneConsumption, "dma", Resolution::QuarterHour, datetime!(2020-03-07 10:00:00 UTC)).await);
    assert_eq!(
        value(&engine, Series::ZoneConsumption, "dma", Resolution::Day, datetime!(2020-03-08 00:00:00 UTC)).await,
        8.0
    );
}

#[tokio::test]
async fn scenario_reset_horizon_follows_config() {
    let cfg = ReconcileConfig {
        gap_reset_after_hours: 96,
        late_tolerance_ticks: 1,
        ..ReconcileConfig::default()
    };
    let engine = engine_with(ZONE, &cfg);

    group(&engine, datetime!(2020-03-05 10:00:00 UTC), 1000.0, 500.0).await;
    group(&engine, datetime!(2020-03-08 10:00:00 UTC), 1288.0, 500.0).await;
    group(&engine, datetime!(2020-03-08 10:15:00 UTC), 1290.0, 500.0).await;

    // 288 over the 288 quarter-hours of three days.
    assert_close(qh(&engine, datetime!(2020-03-08 10:00:00 UTC)).await, 1.0);
    assert_close(qh(&engine, datetime!(2020-03-06 00:00:00 UTC)).await, 1.0);
    assert_close(
        value(&engine, Series::ZoneConsumption, "dma", Resolution::Day, datetime!(2020-03-06 00:00:00 UTC)).await,
        96.0,
    );
}

const PAIR: &str = r#"
[[zones]]
id = "z"

[[meters]]
id = "a"
input_for = "z"

[[meters]]
id = "b"
input_for = "z"
"#;

/// Twenty ticks from 10:00; a gains 10 and b gains 4 per tick.
async fn steady_pair(lost_b: &[OffsetDateTime]) -> reconcile_service::Engine {
    let engine = engine(PAIR);
    for i in 0..20u32 {
        let ts = datetime!(2020-03-05 10:00:00 UTC) + ticks::RIE * i;
        pulse(&engine, "a", ts, 1000.0 + 10.0 * f64::from(i)).await;
        if !lost_b.contains(&ts) {
            pulse(&engine, "b", ts, 500.0 + 4.0 * f64::from(i)).await;
        }
    }
    engine
}

#[tokio::test]
async fn scenario_lost_pulse_is_absorbed_by_the_gap() {
    let lost = datetime!(2020-03-05 10:30:00 UTC);
    let engine = steady_pair(&[lost]).await;

    assert!(pending(&engine, Target::Zone("z".into())).await.is_empty());
    let rows = engine
        .aggregate_series(
            Series::ZoneConsumption,
            "z",
            Resolution::QuarterHour,
            datetime!(2020-03-05 10:15:00 UTC),
            datetime!(2020-03-05 15:00:00 UTC),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 19);
    for row in &rows {
        assert_close(row.value.expect("window value"), 14.0);
    }
    assert_close(
        value(&engine, Series::ZoneConsumption, "z", Resolution::Day, datetime!(2020-03-05 00:00:00 UTC)).await,
        19.0 * 14.0,
    );
}

#[tokio::test]
async fn scenario_pending_state_stays_bounded_when_pulses_are_lost() {
    let lost: Vec<OffsetDateTime> = (10..15)
        .map(|h| datetime!(2020-03-05 00:30:00 UTC) + time::Duration::hours(h))
        .collect();
    let engine = steady_pair(&lost).await;

    // Only the last hour can still be completed.
    let left: Vec<_> = pending(&engine, Target::Zone("z".into()))
        .await
        .into_iter()
        .map(|r| r.key.tick)
        .collect();
    assert_eq!(
        left,
        vec![datetime!(2020-03-05 14:30:00 UTC), datetime!(2020-03-05 14:45:00 UTC)]
    );

    // Everything up to 14:15 is reconciled once, gaps included.
    assert_close(
        value(&engine, Series::ZoneConsumption, "z", Resolution::Day, datetime!(2020-03-05 00:00:00 UTC)).await,
        17.0 * 14.0,
    );
    assert_close(
        value(&engine, Series::ZoneConsumption, "z", Resolution::QuarterHour, datetime!(2020-03-05 13:30:00 UTC)).await,
        14.0,
    );
}
